// src/tree/isolate.rs

//! Isolation: turning a node into independently executable cells.

use std::fmt;

use crate::errors::{FanoutError, Result};
use crate::target::TargetHandle;
use crate::tree::node::{Isolation, NodeId, Tree};
use crate::tree::resolve::{Resolver, derive_roles};
use crate::tree::roles::RoleSet;

/// Position of a cell: one entry per array node from the root down.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellIndex(Vec<usize>);

impl CellIndex {
    pub fn new(parts: Vec<usize>) -> Self {
        Self(parts)
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn child(&self, i: usize) -> Self {
        let mut next = self.0.clone();
        next.push(i);
        Self(next)
    }
}

impl fmt::Display for CellIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in &self.0 {
            write!(f, "[{i}]")?;
        }
        Ok(())
    }
}

/// A node bound to one concrete slice of its targets.
#[derive(Debug, Clone)]
pub struct Cell {
    pub node: NodeId,
    pub index: CellIndex,
    pub roles: RoleSet,
}

impl Cell {
    /// The single target of the node's isolation role, if it has one.
    pub fn isolated_target(&self, tree: &Tree) -> Option<TargetHandle> {
        let role = tree.node(self.node).isolation_role()?;
        match self.roles.get(role) {
            Some([only]) => Some(only.clone()),
            _ => None,
        }
    }

    /// Human readable address, e.g. `web[1].worker`.
    pub fn label(&self, tree: &Tree) -> String {
        let mut out = String::new();
        let mut idx = self.index.as_slice().iter();
        for id in tree.lineage(self.node).into_iter().skip(1) {
            let node = tree.node(id);
            if !out.is_empty() {
                out.push('.');
            }
            out.push_str(node.name());
            if matches!(node.isolation(), Isolation::Array { .. }) {
                if let Some(i) = idx.next() {
                    out.push_str(&format!("[{i}]"));
                }
            }
        }
        if out.is_empty() {
            out.push_str(tree.node(self.node).name());
        }
        out
    }
}

/// Cells of `node`, expanding every array isolation from the root down.
///
/// A node with no array on its path yields exactly one cell. An array
/// whose role is empty yields none.
pub fn isolate(tree: &Tree, resolver: &Resolver, node: NodeId) -> Result<Vec<Cell>> {
    let lineage = tree.lineage(node);
    let root = lineage[0];
    let mut cells = expand(tree, root, resolver.resolve(root)?, CellIndex::default())?;

    for &id in &lineage[1..] {
        let mut next = Vec::with_capacity(cells.len());
        for cell in &cells {
            next.extend(expand_child(tree, cell, id)?);
        }
        cells = next;
    }
    Ok(cells)
}

/// Cells of `child` reached from an already isolated parent cell.
pub fn expand_child(tree: &Tree, parent: &Cell, child: NodeId) -> Result<Vec<Cell>> {
    let roles = derive_roles(tree, child, &parent.roles)?;
    expand(tree, child, roles, parent.index.clone())
}

fn expand(tree: &Tree, node: NodeId, roles: RoleSet, base: CellIndex) -> Result<Vec<Cell>> {
    match tree.node(node).isolation() {
        Isolation::None => Ok(vec![Cell {
            node,
            index: base,
            roles,
        }]),
        Isolation::Array { role } => {
            let targets = roles.get(role).unwrap_or_default().to_vec();
            Ok(targets
                .into_iter()
                .enumerate()
                .map(|(i, target)| Cell {
                    node,
                    index: base.child(i),
                    roles: roles.rebind(role, target),
                })
                .collect())
        }
        Isolation::JustOne { role } => {
            let n = roles.get(role).map_or(0, <[_]>::len);
            if n != 1 {
                return Err(FanoutError::AmbiguousIsolation(format!(
                    "node '{}': role '{role}' has {n} targets, expected exactly one",
                    tree.node(node).display_name()
                )));
            }
            Ok(vec![Cell {
                node,
                index: base,
                roles,
            }])
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::target::{LocalTarget, slugs};
    use crate::tree::node::{NodeBuilder, TreeBuilder};
    use crate::tree::roles::RoleMapping;

    fn t(slug: &str) -> TargetHandle {
        Arc::new(LocalTarget::new(slug))
    }

    fn tree(web: &[&str]) -> Arc<Tree> {
        let root = NodeBuilder::new("root")
            .roles(
                RoleSet::new()
                    .with_role("web", web.iter().map(|s| t(s)).collect())
                    .unwrap()
                    .with_role("db", vec![t("db1")])
                    .unwrap(),
            )
            .child(
                NodeBuilder::new("web")
                    .map(RoleMapping::new().map("host", ["web"]).map("db", ["db"]))
                    .isolate("host")
                    .child(NodeBuilder::new("app"))
                    .child(
                        NodeBuilder::new("pair")
                            .map(RoleMapping::new().map("peer", ["host"]).map("db", ["db"]))
                            .isolate("db"),
                    ),
            );
        Arc::new(TreeBuilder::new(root).build().unwrap())
    }

    #[test]
    fn array_yields_one_cell_per_target() {
        let tree = tree(&["w1", "w2", "w3"]);
        let resolver = Resolver::new(tree.clone());
        let web = tree.find("web").unwrap();

        let cells = isolate(&tree, &resolver, web).unwrap();
        assert_eq!(cells.len(), 3);
        for (i, cell) in cells.iter().enumerate() {
            assert_eq!(cell.index.as_slice(), &[i]);
            assert_eq!(slugs(cell.roles.get("host").unwrap()), vec![format!("w{}", i + 1)]);
            assert_eq!(slugs(cell.roles.get("db").unwrap()), vec!["db1"]);
        }
        assert_eq!(cells[1].label(&tree), "web[1]");
        assert_eq!(cells[2].isolated_target(&tree).unwrap().slug(), "w3");
    }

    #[test]
    fn empty_role_yields_no_cells() {
        let tree = tree(&[]);
        let resolver = Resolver::new(tree.clone());
        let cells = isolate(&tree, &resolver, tree.find("web").unwrap()).unwrap();
        assert!(cells.is_empty());
        let cells = isolate(&tree, &resolver, tree.find("web.app").unwrap()).unwrap();
        assert!(cells.is_empty());
    }

    #[test]
    fn children_of_an_array_inherit_the_cell() {
        let tree = tree(&["w1", "w2"]);
        let resolver = Resolver::new(tree.clone());
        let cells = isolate(&tree, &resolver, tree.find("web.app").unwrap()).unwrap();
        assert_eq!(cells.len(), 2);
        assert_eq!(slugs(cells[1].roles.get("host").unwrap()), vec!["w2"]);
        assert_eq!(cells[1].label(&tree), "web[1].app");
    }

    #[test]
    fn nested_arrays_multiply() {
        let tree = tree(&["w1", "w2"]);
        let resolver = Resolver::new(tree.clone());
        let cells = isolate(&tree, &resolver, tree.find("web.pair").unwrap()).unwrap();
        let indices: Vec<_> = cells.iter().map(|c| c.index.to_string()).collect();
        assert_eq!(indices, vec!["[0][0]", "[1][0]"]);
    }

    #[test]
    fn root_without_isolation_is_one_cell() {
        let tree = tree(&["w1"]);
        let resolver = Resolver::new(tree.clone());
        let cells = isolate(&tree, &resolver, tree.root()).unwrap();
        assert_eq!(cells.len(), 1);
        assert!(cells[0].index.is_empty());
        assert_eq!(cells[0].roles, resolver.resolve(tree.root()).unwrap());
    }
}
