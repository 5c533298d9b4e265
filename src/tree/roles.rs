// src/tree/roles.rs

//! Role sets and role mappings.

use std::collections::HashSet;
use std::fmt;

use indexmap::IndexMap;

use crate::errors::{FanoutError, Result};
use crate::target::TargetHandle;

/// Ordered mapping from role name to the targets playing that role.
///
/// Insertion order is preserved and determines cell order during isolation.
/// A target may appear under several roles.
#[derive(Clone, Default)]
pub struct RoleSet {
    roles: IndexMap<String, Vec<TargetHandle>>,
}

impl RoleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a role. Fails if the same target slug is listed twice in it.
    pub fn insert(&mut self, role: impl Into<String>, targets: Vec<TargetHandle>) -> Result<()> {
        let role = role.into();
        let mut seen = HashSet::new();
        for t in &targets {
            if !seen.insert(t.slug().to_string()) {
                return Err(FanoutError::ConfigError(format!(
                    "target '{}' listed twice in role '{role}'",
                    t.slug()
                )));
            }
        }
        self.roles.insert(role, targets);
        Ok(())
    }

    pub fn with_role(mut self, role: impl Into<String>, targets: Vec<TargetHandle>) -> Result<Self> {
        self.insert(role, targets)?;
        Ok(self)
    }

    pub fn get(&self, role: &str) -> Option<&[TargetHandle]> {
        self.roles.get(role).map(Vec::as_slice)
    }

    pub fn contains(&self, role: &str) -> bool {
        self.roles.contains_key(role)
    }

    pub fn role_names(&self) -> impl Iterator<Item = &str> {
        self.roles.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[TargetHandle])> {
        self.roles.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }

    /// Union of the named roles, in declaration order, each target once.
    pub fn filter<S: AsRef<str>>(&self, roles: &[S]) -> Vec<TargetHandle> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for role in roles {
            for t in self.get(role.as_ref()).unwrap_or_default() {
                if seen.insert(t.slug().to_string()) {
                    out.push(t.clone());
                }
            }
        }
        out
    }

    /// Every target of every role, in order, each target once.
    pub fn all_targets(&self) -> Vec<TargetHandle> {
        let names: Vec<&str> = self.role_names().collect();
        self.filter(&names)
    }

    /// Copy of this set with `role` bound to exactly `target`.
    pub fn rebind(&self, role: &str, target: TargetHandle) -> Self {
        let mut next = self.clone();
        next.roles.insert(role.to_string(), vec![target]);
        next
    }

    /// `role -> [slug]` view, handy for printing and comparisons.
    pub fn slugs(&self) -> IndexMap<String, Vec<String>> {
        self.roles
            .iter()
            .map(|(k, v)| (k.clone(), crate::target::slugs(v)))
            .collect()
    }
}

impl PartialEq for RoleSet {
    fn eq(&self, other: &Self) -> bool {
        self.slugs().into_iter().eq(other.slugs())
    }
}

impl fmt::Debug for RoleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.slugs()).finish()
    }
}

/// Where a mapped child role takes its targets from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingSource {
    /// Union of these parent roles.
    Roles(Vec<String>),
    /// Every target of the parent.
    AllTargets,
}

/// `child role -> source` declarations attached to a child node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleMapping {
    entries: IndexMap<String, MappingSource>,
}

impl RoleMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `child_role` to the union of `parent_roles`.
    pub fn map<S: Into<String>>(
        mut self,
        child_role: impl Into<String>,
        parent_roles: impl IntoIterator<Item = S>,
    ) -> Self {
        let sources = parent_roles.into_iter().map(Into::into).collect();
        self.entries
            .insert(child_role.into(), MappingSource::Roles(sources));
        self
    }

    /// Map `child_role` to every target of the parent.
    pub fn map_all(mut self, child_role: impl Into<String>) -> Self {
        self.entries
            .insert(child_role.into(), MappingSource::AllTargets);
        self
    }

    pub fn get(&self, child_role: &str) -> Option<&MappingSource> {
        self.entries.get(child_role)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MappingSource)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apply this mapping to the parent's role set.
    ///
    /// Never introduces a target absent from `parent`.
    pub fn apply(&self, node: &str, parent: &RoleSet) -> Result<RoleSet> {
        let mut out = RoleSet::new();
        for (child_role, source) in &self.entries {
            let targets = match source {
                MappingSource::AllTargets => parent.all_targets(),
                MappingSource::Roles(roles) => {
                    if let Some(missing) = roles.iter().find(|r| !parent.contains(r)) {
                        return Err(FanoutError::UnknownRole {
                            node: node.to_string(),
                            role: missing.clone(),
                        });
                    }
                    parent.filter(roles)
                }
            };
            out.roles.insert(child_role.clone(), targets);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::target::LocalTarget;

    fn t(slug: &str) -> TargetHandle {
        Arc::new(LocalTarget::new(slug))
    }

    fn parent() -> RoleSet {
        RoleSet::new()
            .with_role("slaves", vec![t("a"), t("b")])
            .unwrap()
            .with_role("master", vec![t("m"), t("a")])
            .unwrap()
    }

    #[test]
    fn mapping_preserves_parent_order() {
        let mapped = RoleMapping::new()
            .map("worker", ["slaves"])
            .apply("child", &parent())
            .unwrap();
        assert_eq!(mapped.slugs()["worker"], vec!["a", "b"]);
    }

    #[test]
    fn union_deduplicates_shared_targets() {
        let p = parent();
        assert_eq!(crate::target::slugs(&p.filter(&["slaves", "master"])), vec!["a", "b", "m"]);
        assert_eq!(crate::target::slugs(&p.all_targets()), vec!["a", "b", "m"]);
    }

    #[test]
    fn unknown_parent_role_is_reported() {
        let err = RoleMapping::new()
            .map("worker", ["missing"])
            .apply("child", &parent())
            .unwrap_err();
        assert!(matches!(err, FanoutError::UnknownRole { ref role, .. } if role == "missing"));
    }

    #[test]
    fn duplicate_slug_in_role_is_rejected() {
        assert!(RoleSet::new().with_role("web", vec![t("a"), t("a")]).is_err());
    }

    #[test]
    fn equality_is_by_slug_and_order() {
        let a = RoleSet::new().with_role("r", vec![t("x"), t("y")]).unwrap();
        let b = RoleSet::new().with_role("r", vec![t("x"), t("y")]).unwrap();
        let c = RoleSet::new().with_role("r", vec![t("y"), t("x")]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
