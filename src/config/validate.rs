// src/config/validate.rs

use std::collections::HashSet;
use std::sync::Arc;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::config::model::{
    ActionConfig, ConfigFile, IsolateDecl, MapSource, NodeConfig, RawConfigFile, RawSettings,
    Settings, TargetKind,
};
use crate::engine::action::{Action, ShellAction};
use crate::errors::{FanoutError, Result};
use crate::target::command::SudoMode;
use crate::target::{LocalTarget, SshTarget, TargetHandle};
use crate::tree::{NodeBuilder, RoleMapping, RoleSet, Tree, TreeBuilder};
use crate::types::parse_duration;

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = FanoutError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        let settings = validate_settings(&raw.settings)?;
        let root = validate_nodes(&raw)?;
        validate_targets(&raw)?;
        Ok(ConfigFile::new_unchecked(settings, raw.target, raw.node, root))
    }
}

fn validate_settings(raw: &RawSettings) -> Result<Settings> {
    let duration = |key: &str, value: &str| {
        parse_duration(value)
            .map_err(|e| FanoutError::ConfigError(format!("[settings].{key} = {value:?}: {e}")))
    };
    if raw.backlog_bytes == 0 {
        return Err(FanoutError::ConfigError(
            "[settings].backlog_bytes must be >= 1 (got 0)".to_string(),
        ));
    }
    if raw.max_parallel == Some(0) {
        return Err(FanoutError::ConfigError(
            "[settings].max_parallel must be >= 1 (got 0)".to_string(),
        ));
    }
    Ok(Settings {
        connect_timeout: duration("connect_timeout", &raw.connect_timeout)?,
        frontend_timeout: duration("frontend_timeout", &raw.frontend_timeout)?,
        backlog_bytes: raw.backlog_bytes,
        fail_fast: raw.fail_fast,
        sandbox: raw.sandbox,
        frontend: raw.frontend,
        max_parallel: raw.max_parallel,
        socket_dir: raw.socket_dir.clone(),
    })
}

/// Checks the node hierarchy and returns the root's name.
fn validate_nodes(cfg: &RawConfigFile) -> Result<String> {
    if cfg.node.is_empty() {
        return Err(FanoutError::ConfigError(
            "config must contain at least one [node.<name>] section".to_string(),
        ));
    }

    let roots: Vec<&str> = cfg
        .node
        .iter()
        .filter(|(_, n)| n.parent.is_none())
        .map(|(k, _)| k.as_str())
        .collect();
    let root = match roots.as_slice() {
        [only] => only.to_string(),
        [] => {
            return Err(FanoutError::TreeCycle(
                "every node has a parent; exactly one node must omit `parent`".to_string(),
            ));
        }
        many => {
            return Err(FanoutError::ConfigError(format!(
                "exactly one node may omit `parent`, found {}: {}",
                many.len(),
                many.join(", ")
            )));
        }
    };

    for (name, node) in &cfg.node {
        validate_node(cfg, name, node)?;
    }
    validate_hierarchy(cfg)?;
    Ok(root)
}

fn validate_node(cfg: &RawConfigFile, name: &str, node: &NodeConfig) -> Result<()> {
    if let Some(parent) = &node.parent {
        if !cfg.node.contains_key(parent) {
            return Err(FanoutError::ConfigError(format!(
                "node '{name}' has unknown parent '{parent}'"
            )));
        }
        if parent == name {
            return Err(FanoutError::TreeCycle(format!(
                "node '{name}' is its own parent"
            )));
        }
    }

    if node.roles.is_some() && node.map.is_some() {
        return Err(FanoutError::ConfigError(format!(
            "node '{name}' sets both `roles` and `map`"
        )));
    }
    if node.parent.is_none() && node.map.is_some() {
        return Err(FanoutError::ConfigError(format!(
            "root node '{name}' cannot map roles from a parent"
        )));
    }

    if let Some(roles) = &node.roles {
        for (role, slugs) in roles {
            let mut seen = HashSet::new();
            for slug in slugs {
                if !cfg.target.contains_key(slug) {
                    return Err(FanoutError::ConfigError(format!(
                        "node '{name}' role '{role}' references unknown target '{slug}'"
                    )));
                }
                if !seen.insert(slug) {
                    return Err(FanoutError::ConfigError(format!(
                        "node '{name}' role '{role}' lists target '{slug}' twice"
                    )));
                }
            }
        }
    }

    if let Some(IsolateDecl::Many(roles)) = &node.isolate {
        if roles.len() != 1 {
            return Err(FanoutError::AmbiguousIsolation(format!(
                "node '{name}' declares {} isolation roles: {}",
                roles.len(),
                roles.join(", ")
            )));
        }
    }
    if node.just_one && node.isolate.is_none() {
        return Err(FanoutError::ConfigError(format!(
            "node '{name}' sets `just_one` without an `isolate` role"
        )));
    }

    for (action, cfg_action) in &node.action {
        if cfg_action.cmd.trim().is_empty() {
            return Err(FanoutError::ConfigError(format!(
                "action '{name}.{action}' has an empty `cmd`"
            )));
        }
        if cfg_action.sudo && cfg_action.sudo_user.is_some() {
            return Err(FanoutError::ConfigError(format!(
                "action '{name}.{action}' sets both `sudo` and `sudo_user`"
            )));
        }
    }
    Ok(())
}

fn validate_hierarchy(cfg: &RawConfigFile) -> Result<()> {
    // Edge direction: parent -> child.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for name in cfg.node.keys() {
        graph.add_node(name.as_str());
    }
    for (name, node) in &cfg.node {
        if let Some(parent) = &node.parent {
            graph.add_edge(parent.as_str(), name.as_str(), ());
        }
    }

    match toposort(&graph, None) {
        Ok(_order) => Ok(()),
        Err(cycle) => Err(FanoutError::TreeCycle(format!(
            "cycle in node parents involving node '{}'",
            cycle.node_id()
        ))),
    }
}

fn validate_targets(cfg: &RawConfigFile) -> Result<()> {
    for (slug, target) in &cfg.target {
        if target.kind == TargetKind::Ssh
            && target.address.as_deref().is_none_or(|a| a.trim().is_empty())
        {
            return Err(FanoutError::ConfigError(format!(
                "ssh target '{slug}' needs an `address`"
            )));
        }
    }
    Ok(())
}

impl ConfigFile {
    /// Instantiate every target.
    pub fn build_targets(&self) -> indexmap::IndexMap<String, TargetHandle> {
        let control_dir = self
            .settings
            .socket_dir
            .clone()
            .unwrap_or_else(crate::attach::default_socket_dir);
        self.target
            .iter()
            .map(|(slug, t)| {
                let handle: TargetHandle = match t.kind {
                    TargetKind::Local => Arc::new(LocalTarget::new(slug.clone())),
                    TargetKind::Ssh => Arc::new(
                        SshTarget::new(slug.clone(), t.address.clone().unwrap_or_default())
                            .with_user(t.user.clone())
                            .with_port(t.port)
                            .with_identity_file(t.identity_file.clone())
                            .with_options(t.ssh_options.clone())
                            .with_control_dir(control_dir.clone())
                            .with_connect_timeout_secs(self.settings.connect_timeout.as_secs()),
                    ),
                };
                (slug.clone(), handle)
            })
            .collect()
    }

    /// Build the node tree. Isolation rules are checked here, so an
    /// ambiguous `just_one` surfaces as `AmbiguousIsolation`.
    pub fn build_tree(&self) -> Result<Tree> {
        let targets = self.build_targets();
        let root = self.node_builder(self.root(), &targets)?;
        TreeBuilder::new(root).build()
    }

    fn node_builder(
        &self,
        name: &str,
        targets: &indexmap::IndexMap<String, TargetHandle>,
    ) -> Result<NodeBuilder> {
        let node = self
            .node
            .get(name)
            .ok_or_else(|| FanoutError::UnknownNode(name.to_string()))?;
        let mut builder = NodeBuilder::new(name);

        if let Some(roles) = &node.roles {
            let mut set = RoleSet::new();
            for (role, slugs) in roles {
                let handles = slugs
                    .iter()
                    .map(|s| {
                        targets.get(s).cloned().ok_or_else(|| {
                            FanoutError::ConfigError(format!("unknown target '{s}'"))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                set.insert(role.clone(), handles)?;
            }
            builder = builder.roles(set);
        }

        if let Some(map) = &node.map {
            let mut mapping = RoleMapping::new();
            for (child_role, source) in map {
                mapping = match source {
                    MapSource::One(s) if s == "*" => mapping.map_all(child_role.clone()),
                    MapSource::One(s) => mapping.map(child_role.clone(), [s.clone()]),
                    MapSource::Many(list) => mapping.map(child_role.clone(), list.iter().cloned()),
                };
            }
            builder = builder.map(mapping);
        }

        let isolate = match &node.isolate {
            Some(IsolateDecl::One(role)) => Some(role.clone()),
            Some(IsolateDecl::Many(roles)) => roles.first().cloned(),
            None => None,
        };
        if let Some(role) = isolate {
            builder = if node.just_one {
                builder.just_one(role)
            } else {
                builder.isolate(role)
            };
        }

        for (action_name, action) in &node.action {
            builder = builder.action(shell_action(action_name, action));
        }

        for child in self.children_of(name) {
            builder = builder.child(self.node_builder(child, targets)?);
        }
        Ok(builder)
    }
}

fn shell_action(name: &str, cfg: &ActionConfig) -> Action {
    let sudo = match (&cfg.sudo_user, cfg.sudo) {
        (Some(user), _) => Some(SudoMode::User(user.clone())),
        (None, true) => Some(SudoMode::Root),
        (None, false) => None,
    };
    Action::shell(
        name,
        ShellAction {
            template: cfg.cmd.clone(),
            role: cfg.role.clone(),
            cwd: cfg.cwd.clone(),
            env: cfg.env.clone(),
            ignore_exit_status: cfg.ignore_exit_status,
            sudo,
        },
    )
    .interactive(cfg.interactive)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Result<ConfigFile> {
        let raw: RawConfigFile = toml::from_str(toml_src)?;
        ConfigFile::try_from(raw)
    }

    const BASE: &str = r#"
        [target.w1]
        kind = "local"
        [target.w2]
        kind = "local"

        [node.root]
        roles = { web = ["w1", "w2"] }

        [node.web]
        parent = "root"
        map = { host = "web" }
        isolate = "host"

        [node.web.action.deploy]
        cmd = "echo deploy {0}"
    "#;

    #[test]
    fn valid_config_builds_a_tree() {
        let cfg = parse(BASE).unwrap();
        assert_eq!(cfg.root(), "root");
        assert_eq!(cfg.settings.frontend_timeout, std::time::Duration::from_secs(2));

        let tree = cfg.build_tree().unwrap();
        let web = tree.find("web").unwrap();
        assert!(tree.node(web).action("deploy").is_some());
        assert_eq!(tree.node(web).isolation_role(), Some("host"));
    }

    #[test]
    fn parent_cycle_is_reported() {
        let err = parse(
            r#"
            [node.root]
            [node.a]
            parent = "b"
            [node.b]
            parent = "a"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, FanoutError::TreeCycle(_)), "{err}");
    }

    #[test]
    fn roles_and_map_are_exclusive() {
        let err = parse(
            r#"
            [target.w1]
            kind = "local"
            [node.root]
            roles = { web = ["w1"] }
            [node.web]
            parent = "root"
            roles = { host = ["w1"] }
            map = { host = "web" }
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("both `roles` and `map`"));
    }

    #[test]
    fn several_isolation_roles_are_ambiguous() {
        let err = parse(
            r#"
            [node.root]
            isolate = ["a", "b"]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, FanoutError::AmbiguousIsolation(_)));
    }

    #[test]
    fn ssh_target_needs_address() {
        let err = parse(
            r#"
            [target.db]
            user = "admin"
            [node.root]
            roles = { db = ["db"] }
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("needs an `address`"));
    }

    #[test]
    fn unknown_target_and_bad_duration() {
        let err = parse(
            r#"
            [node.root]
            roles = { db = ["nope"] }
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown target 'nope'"));

        let err = parse(
            r#"
            [settings]
            connect_timeout = "soon"
            [node.root]
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("connect_timeout"));
    }

    #[test]
    fn just_one_on_a_multi_target_role_fails_at_build() {
        let cfg = parse(
            r#"
            [target.w1]
            kind = "local"
            [target.w2]
            kind = "local"
            [node.root]
            roles = { web = ["w1", "w2"] }
            [node.web]
            parent = "root"
            map = { host = "web" }
            isolate = "host"
            just_one = true
            "#,
        )
        .unwrap();
        assert!(matches!(
            cfg.build_tree(),
            Err(FanoutError::AmbiguousIsolation(_))
        ));
    }
}
