// src/tree/node.rs

//! The node tree: an arena of plain data nodes.
//!
//! Trees are assembled with [`NodeBuilder`] and frozen by
//! [`TreeBuilder::build`], which checks the structural rules that do not
//! need any target to be contacted:
//! - at most one isolation role per node,
//! - isolation roles exist on the node,
//! - `just_one` roles are provably single-target,
//! - child names are unique.
//!
//! Overriding part of a tree is a structural replacement of a sub-tree
//! ([`NodeBuilder::replace_child`]).

use std::fmt;

use indexmap::IndexMap;

use crate::engine::action::Action;
use crate::errors::{FanoutError, Result};
use crate::tree::roles::{MappingSource, RoleMapping, RoleSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// How a node obtains its role set.
#[derive(Debug, Clone)]
pub enum HostsDecl {
    /// Same role set as the parent.
    Inherit,
    /// Its own targets; ignores the parent.
    Explicit(RoleSet),
    /// Derived from the parent through a role mapping.
    Mapped(RoleMapping),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Isolation {
    None,
    /// One independent cell per target of `role`.
    Array { role: String },
    /// `role` has exactly one target; the node stays scalar.
    JustOne { role: String },
}

impl Isolation {
    pub fn role(&self) -> Option<&str> {
        match self {
            Isolation::None => None,
            Isolation::Array { role } | Isolation::JustOne { role } => Some(role),
        }
    }
}

pub struct NodeDecl {
    name: String,
    path: String,
    parent: Option<NodeId>,
    children: IndexMap<String, NodeId>,
    hosts: HostsDecl,
    declared_roles: Vec<String>,
    isolation: Isolation,
    actions: IndexMap<String, Action>,
}

impl NodeDecl {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dotted path from the root, e.g. `web.worker`. Empty for the root.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Name used in messages: the path, or the root's name.
    pub fn display_name(&self) -> &str {
        if self.path.is_empty() {
            &self.name
        } else {
            &self.path
        }
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> impl Iterator<Item = (&str, NodeId)> {
        self.children.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn hosts(&self) -> &HostsDecl {
        &self.hosts
    }

    pub fn declared_mapping(&self) -> Option<&RoleMapping> {
        match &self.hosts {
            HostsDecl::Mapped(m) => Some(m),
            _ => None,
        }
    }

    pub fn declared_roles(&self) -> &[String] {
        &self.declared_roles
    }

    pub fn isolation(&self) -> &Isolation {
        &self.isolation
    }

    pub fn isolation_role(&self) -> Option<&str> {
        self.isolation.role()
    }

    pub fn actions(&self) -> impl Iterator<Item = &Action> {
        self.actions.values()
    }

    pub fn action(&self, name: &str) -> Option<&Action> {
        self.actions.get(name)
    }
}

impl fmt::Debug for NodeDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeDecl")
            .field("path", &self.path)
            .field("hosts", &self.hosts)
            .field("isolation", &self.isolation)
            .field("actions", &self.actions.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct Tree {
    nodes: Vec<NodeDecl>,
}

impl Tree {
    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn node(&self, id: NodeId) -> &NodeDecl {
        &self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All node ids, parents before children.
    pub fn ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len()).map(NodeId)
    }

    pub fn child(&self, id: NodeId, name: &str) -> Option<NodeId> {
        self.node(id).children.get(name).copied()
    }

    /// Look a node up by dotted path; the empty path is the root.
    pub fn find(&self, path: &str) -> Result<NodeId> {
        let mut id = self.root();
        for segment in path.split('.').filter(|s| !s.is_empty()) {
            id = self
                .child(id, segment)
                .ok_or_else(|| FanoutError::UnknownNode(path.to_string()))?;
        }
        Ok(id)
    }

    /// Ids from the root down to `id`, inclusive.
    pub fn lineage(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = vec![id];
        let mut cur = id;
        while let Some(parent) = self.node(cur).parent {
            out.push(parent);
            cur = parent;
        }
        out.reverse();
        out
    }

    /// True if `id` or any ancestor is an array node.
    pub fn is_array(&self, id: NodeId) -> bool {
        self.array_depth(id) > 0
    }

    /// Number of array isolations from the root down to `id`.
    pub fn array_depth(&self, id: NodeId) -> usize {
        self.lineage(id)
            .into_iter()
            .filter(|n| matches!(self.node(*n).isolation, Isolation::Array { .. }))
            .count()
    }

    fn has_role(&self, id: NodeId, role: &str) -> bool {
        let node = self.node(id);
        if node.declared_roles.iter().any(|r| r == role) {
            return true;
        }
        match &node.hosts {
            HostsDecl::Explicit(rs) => rs.contains(role),
            HostsDecl::Mapped(m) => m.get(role).is_some(),
            HostsDecl::Inherit => node.parent.is_some_and(|p| self.has_role(p, role)),
        }
    }

    /// `role` on `id` is guaranteed to hold exactly one target, judging by
    /// declarations alone.
    fn provably_singleton(&self, id: NodeId, role: &str) -> bool {
        self.node(id).isolation_role() == Some(role) || self.singleton_by_declaration(id, role)
    }

    fn singleton_by_declaration(&self, id: NodeId, role: &str) -> bool {
        let node = self.node(id);
        match &node.hosts {
            HostsDecl::Explicit(rs) => rs.get(role).is_some_and(|t| t.len() == 1),
            HostsDecl::Inherit => node
                .parent
                .is_some_and(|p| self.provably_singleton(p, role)),
            HostsDecl::Mapped(m) => match m.get(role) {
                Some(MappingSource::Roles(sources)) if sources.len() == 1 => node
                    .parent
                    .is_some_and(|p| self.provably_singleton(p, &sources[0])),
                _ => false,
            },
        }
    }
}

/// Declarative description of one node and its sub-tree.
#[derive(Debug, Clone)]
pub struct NodeBuilder {
    name: String,
    hosts: HostsDecl,
    declared_roles: Vec<String>,
    isolate: Vec<String>,
    just_one: bool,
    actions: IndexMap<String, Action>,
    children: Vec<NodeBuilder>,
}

impl NodeBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hosts: HostsDecl::Inherit,
            declared_roles: Vec::new(),
            isolate: Vec::new(),
            just_one: false,
            actions: IndexMap::new(),
            children: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn roles(mut self, roles: RoleSet) -> Self {
        self.hosts = HostsDecl::Explicit(roles);
        self
    }

    pub fn map(mut self, mapping: RoleMapping) -> Self {
        self.hosts = HostsDecl::Mapped(mapping);
        self
    }

    /// Declare a role that may stay unmapped; it then resolves to no targets.
    pub fn declare_role(mut self, role: impl Into<String>) -> Self {
        self.declared_roles.push(role.into());
        self
    }

    /// Run actions once per target of `role`.
    pub fn isolate(mut self, role: impl Into<String>) -> Self {
        self.isolate.push(role.into());
        self
    }

    /// Address the node as a scalar; `role` must be provably single-target.
    pub fn just_one(mut self, role: impl Into<String>) -> Self {
        self.isolate.push(role.into());
        self.just_one = true;
        self
    }

    pub fn action(mut self, action: Action) -> Self {
        self.actions.insert(action.name.clone(), action);
        self
    }

    pub fn child(mut self, child: NodeBuilder) -> Self {
        self.children.push(child);
        self
    }

    /// Swap the sub-tree named like `child` for `child`.
    pub fn replace_child(mut self, child: NodeBuilder) -> Result<Self> {
        let slot = self
            .children
            .iter_mut()
            .find(|c| c.name == child.name)
            .ok_or_else(|| {
                FanoutError::UnknownNode(format!("{}.{}", self.name, child.name))
            })?;
        *slot = child;
        Ok(self)
    }
}

pub struct TreeBuilder {
    root: NodeBuilder,
}

impl TreeBuilder {
    pub fn new(root: NodeBuilder) -> Self {
        Self { root }
    }

    pub fn build(self) -> Result<Tree> {
        if matches!(self.root.hosts, HostsDecl::Mapped(_)) {
            return Err(FanoutError::ConfigError(format!(
                "root node '{}' has no parent to map roles from",
                self.root.name
            )));
        }

        let mut tree = Tree { nodes: Vec::new() };
        let mut pending = Vec::new();
        flatten(&mut tree, self.root, None, String::new(), &mut pending)?;

        for (id, just_one) in pending {
            validate_isolation(&tree, id, just_one)?;
        }
        Ok(tree)
    }
}

fn flatten(
    tree: &mut Tree,
    builder: NodeBuilder,
    parent: Option<NodeId>,
    path: String,
    pending: &mut Vec<(NodeId, bool)>,
) -> Result<NodeId> {
    let display = if path.is_empty() {
        builder.name.clone()
    } else {
        path.clone()
    };

    if builder.isolate.len() > 1 {
        return Err(FanoutError::AmbiguousIsolation(format!(
            "node '{display}' declares more than one isolation role: {:?}",
            builder.isolate
        )));
    }
    let isolation = match builder.isolate.into_iter().next() {
        None => Isolation::None,
        Some(role) if builder.just_one => Isolation::JustOne { role },
        Some(role) => Isolation::Array { role },
    };
    let needs_check = !matches!(isolation, Isolation::None);

    let id = NodeId(tree.nodes.len());
    tree.nodes.push(NodeDecl {
        name: builder.name,
        path: path.clone(),
        parent,
        children: IndexMap::new(),
        hosts: builder.hosts,
        declared_roles: builder.declared_roles,
        isolation,
        actions: builder.actions,
    });
    if needs_check {
        pending.push((id, builder.just_one));
    }

    for child in builder.children {
        let child_name = child.name.clone();
        if tree.nodes[id.0].children.contains_key(&child_name) {
            return Err(FanoutError::ConfigError(format!(
                "node '{display}' has two children named '{child_name}'"
            )));
        }
        let child_path = if path.is_empty() {
            child_name.clone()
        } else {
            format!("{path}.{child_name}")
        };
        let child_id = flatten(tree, child, Some(id), child_path, pending)?;
        tree.nodes[id.0].children.insert(child_name, child_id);
    }
    Ok(id)
}

fn validate_isolation(tree: &Tree, id: NodeId, just_one: bool) -> Result<()> {
    let node = tree.node(id);
    let Some(role) = node.isolation_role() else {
        return Ok(());
    };

    if !tree.has_role(id, role) {
        return Err(FanoutError::UnknownRole {
            node: node.display_name().to_string(),
            role: role.to_string(),
        });
    }

    if just_one && !tree.singleton_by_declaration(id, role) {
        return Err(FanoutError::AmbiguousIsolation(format!(
            "node '{}' reduces role '{role}' to one target, but '{role}' is not \
             derived from a single-target role",
            node.display_name()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::target::{LocalTarget, TargetHandle};

    fn t(slug: &str) -> TargetHandle {
        Arc::new(LocalTarget::new(slug))
    }

    fn root() -> NodeBuilder {
        NodeBuilder::new("root").roles(
            RoleSet::new()
                .with_role("web", vec![t("w1"), t("w2")])
                .unwrap()
                .with_role("db", vec![t("d1")])
                .unwrap(),
        )
    }

    #[test]
    fn paths_and_lookup() {
        let tree = TreeBuilder::new(
            root().child(NodeBuilder::new("web").child(NodeBuilder::new("app"))),
        )
        .build()
        .unwrap();

        let app = tree.find("web.app").unwrap();
        assert_eq!(tree.node(app).path(), "web.app");
        assert_eq!(tree.lineage(app).len(), 3);
        assert_eq!(tree.find("").unwrap(), tree.root());
        assert!(matches!(tree.find("web.nope"), Err(FanoutError::UnknownNode(_))));
    }

    #[test]
    fn two_isolation_roles_are_ambiguous() {
        let err = TreeBuilder::new(root().child(NodeBuilder::new("x").isolate("web").isolate("db")))
            .build()
            .unwrap_err();
        assert!(matches!(err, FanoutError::AmbiguousIsolation(_)));
    }

    #[test]
    fn just_one_requires_single_target_source() {
        let under_array = root().child(
            NodeBuilder::new("web")
                .map(RoleMapping::new().map("host", ["web"]))
                .isolate("host")
                .child(
                    NodeBuilder::new("leader")
                        .map(RoleMapping::new().map("host", ["host"]))
                        .just_one("host"),
                ),
        );
        assert!(TreeBuilder::new(under_array).build().is_ok());

        let explicit_single = root().child(
            NodeBuilder::new("db")
                .map(RoleMapping::new().map("host", ["db"]))
                .just_one("host"),
        );
        // `db` is declared with exactly one target on the root.
        assert!(TreeBuilder::new(explicit_single).build().is_ok());

        let mapped_union = root().child(
            NodeBuilder::new("both")
                .map(RoleMapping::new().map("host", ["db", "db"]))
                .just_one("host"),
        );
        assert!(matches!(
            TreeBuilder::new(mapped_union).build(),
            Err(FanoutError::AmbiguousIsolation(_))
        ));

        let many = root().child(
            NodeBuilder::new("web")
                .map(RoleMapping::new().map_all("host"))
                .just_one("host"),
        );
        assert!(matches!(
            TreeBuilder::new(many).build(),
            Err(FanoutError::AmbiguousIsolation(_))
        ));
    }

    #[test]
    fn isolating_an_undeclared_role_fails() {
        let err = TreeBuilder::new(
            root().child(NodeBuilder::new("x").map(RoleMapping::new().map("a", ["web"])).isolate("b")),
        )
        .build()
        .unwrap_err();
        assert!(matches!(err, FanoutError::UnknownRole { ref role, .. } if role == "b"));
    }

    #[test]
    fn replace_child_swaps_subtree() {
        let tree = TreeBuilder::new(
            root()
                .child(NodeBuilder::new("web").isolate("web"))
                .replace_child(NodeBuilder::new("web"))
                .unwrap(),
        )
        .build()
        .unwrap();
        let web = tree.find("web").unwrap();
        assert_eq!(tree.node(web).isolation(), &Isolation::None);
        assert!(root().replace_child(NodeBuilder::new("nope")).is_err());
    }

    #[test]
    fn duplicate_children_are_rejected() {
        let err = TreeBuilder::new(root().child(NodeBuilder::new("a")).child(NodeBuilder::new("a")))
            .build()
            .unwrap_err();
        assert!(matches!(err, FanoutError::ConfigError(_)));
    }
}
