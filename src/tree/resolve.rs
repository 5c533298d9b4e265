// src/tree/resolve.rs

//! Resolution: which targets play which role at a node.
//!
//! Resolution walks root → node, applying each node's hosts declaration to
//! its parent's role set. It never contacts a target, so results are cached
//! per node.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::errors::Result;
use crate::tree::node::{HostsDecl, NodeId, Tree};
use crate::tree::roles::RoleSet;

#[derive(Debug)]
pub struct Resolver {
    tree: Arc<Tree>,
    cache: Mutex<HashMap<NodeId, RoleSet>>,
}

impl Resolver {
    pub fn new(tree: Arc<Tree>) -> Self {
        Self {
            tree,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn tree(&self) -> &Arc<Tree> {
        &self.tree
    }

    /// Role set of `node`. Deterministic; repeated calls return equal sets.
    pub fn resolve(&self, node: NodeId) -> Result<RoleSet> {
        if let Some(hit) = self.cache.lock().get(&node) {
            return Ok(hit.clone());
        }

        let roles = match self.tree.node(node).parent() {
            None => derive_roles(&self.tree, node, &RoleSet::new())?,
            Some(parent) => {
                let parent_roles = self.resolve(parent)?;
                derive_roles(&self.tree, node, &parent_roles)?
            }
        };
        trace!(node = %self.tree.node(node).display_name(), roles = ?roles, "resolved");

        self.cache.lock().insert(node, roles.clone());
        Ok(roles)
    }

    /// Resolve without touching the cache.
    pub fn resolve_uncached(&self, node: NodeId) -> Result<RoleSet> {
        let mut roles = RoleSet::new();
        for id in self.tree.lineage(node) {
            roles = derive_roles(&self.tree, id, &roles)?;
        }
        Ok(roles)
    }
}

/// One resolution step: `node`'s role set given its parent's.
///
/// Declared roles left uncovered resolve to an empty target list.
pub fn derive_roles(tree: &Tree, node: NodeId, parent: &RoleSet) -> Result<RoleSet> {
    let decl = tree.node(node);
    let mut roles = match decl.hosts() {
        HostsDecl::Inherit => parent.clone(),
        HostsDecl::Explicit(rs) => rs.clone(),
        HostsDecl::Mapped(mapping) => mapping.apply(decl.display_name(), parent)?,
    };
    for role in decl.declared_roles() {
        if !roles.contains(role) {
            roles.insert(role.clone(), Vec::new())?;
        }
    }
    Ok(roles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FanoutError;
    use crate::target::{LocalTarget, TargetHandle};
    use crate::tree::node::{NodeBuilder, TreeBuilder};
    use crate::tree::roles::RoleMapping;

    fn t(slug: &str) -> TargetHandle {
        Arc::new(LocalTarget::new(slug))
    }

    fn tree() -> Arc<Tree> {
        let root = NodeBuilder::new("root")
            .roles(
                RoleSet::new()
                    .with_role("slaves", vec![t("a"), t("b")])
                    .unwrap()
                    .with_role("master", vec![t("m")])
                    .unwrap(),
            )
            .child(
                NodeBuilder::new("cluster")
                    .map(RoleMapping::new().map("worker", ["slaves"]).map("boss", ["master"]))
                    .declare_role("spare")
                    .child(NodeBuilder::new("inherit"))
                    .child(NodeBuilder::new("broken").map(RoleMapping::new().map("x", ["slaves"])))
                    .child(NodeBuilder::new("bad").map(RoleMapping::new().map("x", ["nope"]))),
            );
        Arc::new(TreeBuilder::new(root).build().unwrap())
    }

    #[test]
    fn mapping_and_inheritance() {
        let tree = tree();
        let resolver = Resolver::new(tree.clone());

        let cluster = resolver.resolve(tree.find("cluster").unwrap()).unwrap();
        assert_eq!(cluster.slugs()["worker"], vec!["a", "b"]);
        assert_eq!(cluster.slugs()["boss"], vec!["m"]);
        assert!(cluster.slugs()["spare"].is_empty());

        let inherit = resolver.resolve(tree.find("cluster.inherit").unwrap()).unwrap();
        assert_eq!(inherit, cluster);
    }

    #[test]
    fn resolution_is_deterministic() {
        let tree = tree();
        let resolver = Resolver::new(tree.clone());
        let id = tree.find("cluster").unwrap();

        let first = resolver.resolve(id).unwrap();
        let second = resolver.resolve(id).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, resolver.resolve_uncached(id).unwrap());
    }

    #[test]
    fn unknown_role_in_mapping() {
        let tree = tree();
        let resolver = Resolver::new(tree.clone());

        // `slaves` exists on the root, not on `cluster`.
        let err = resolver.resolve(tree.find("cluster.broken").unwrap()).unwrap_err();
        assert!(matches!(err, FanoutError::UnknownRole { ref role, .. } if role == "slaves"));

        let err = resolver.resolve(tree.find("cluster.bad").unwrap()).unwrap_err();
        assert!(matches!(
            err,
            FanoutError::UnknownRole { ref node, ref role } if node == "cluster.bad" && role == "nope"
        ));
    }
}
