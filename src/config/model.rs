// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use indexmap::IndexMap;
use serde::Deserialize;

use crate::types::FrontendKind;

/// Configuration exactly as read from TOML.
///
/// ```toml
/// [settings]
/// frontend = "tmux"
///
/// [target.web1]
/// address = "10.0.0.11"
///
/// [node.root]
/// roles = { web = ["web1", "web2"] }
///
/// [node.web]
/// parent = "root"
/// map = { host = "web" }
/// isolate = "host"
///
/// [node.web.action.deploy]
/// cmd = "./deploy {0}"
/// ```
///
/// Becomes a [`ConfigFile`] through `TryFrom`, which validates it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfigFile {
    #[serde(default)]
    pub settings: RawSettings,

    /// `[target.<slug>]`, in file order.
    #[serde(default)]
    pub target: IndexMap<String, TargetConfig>,

    /// `[node.<name>]`, in file order. Children are ordered as they appear.
    #[serde(default)]
    pub node: IndexMap<String, NodeConfig>,
}

/// `[settings]` with durations still as strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawSettings {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: String,

    /// How long to wait for a front-end to attach to a new session.
    #[serde(default = "default_frontend_timeout")]
    pub frontend_timeout: String,

    /// Output kept per session for replay on attach.
    #[serde(default = "default_backlog_bytes")]
    pub backlog_bytes: usize,

    #[serde(default)]
    pub fail_fast: bool,

    #[serde(default)]
    pub sandbox: bool,

    #[serde(default)]
    pub frontend: FrontendKind,

    #[serde(default)]
    pub max_parallel: Option<usize>,

    #[serde(default)]
    pub socket_dir: Option<PathBuf>,
}

fn default_connect_timeout() -> String {
    "10s".to_string()
}

fn default_frontend_timeout() -> String {
    "2s".to_string()
}

fn default_backlog_bytes() -> usize {
    64 * 1024
}

impl Default for RawSettings {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            frontend_timeout: default_frontend_timeout(),
            backlog_bytes: default_backlog_bytes(),
            fail_fast: false,
            sandbox: false,
            frontend: FrontendKind::default(),
            max_parallel: None,
            socket_dir: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    #[default]
    Ssh,
    Local,
}

/// `[target.<slug>]`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    #[serde(default)]
    pub kind: TargetKind,
    /// Host name or IP. Required for ssh targets.
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    /// Extra `ssh -o` options.
    #[serde(default)]
    pub ssh_options: Vec<String>,
}

/// Where a mapped child role takes its targets from.
///
/// `"web"`, `["web", "db"]` or `"*"` (every parent target).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum MapSource {
    One(String),
    Many(Vec<String>),
}

/// `isolate = "host"`. A list is accepted by the parser so that more than
/// one isolation role can be reported as ambiguous.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum IsolateDecl {
    One(String),
    Many(Vec<String>),
}

/// `[node.<name>]`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// Absent on exactly one node: the root.
    #[serde(default)]
    pub parent: Option<String>,

    /// Explicit role set: role name -> target slugs.
    #[serde(default)]
    pub roles: Option<IndexMap<String, Vec<String>>>,

    /// Role mapping from the parent: child role -> parent role(s).
    #[serde(default)]
    pub map: Option<IndexMap<String, MapSource>>,

    #[serde(default)]
    pub isolate: Option<IsolateDecl>,

    /// The isolation role is single-target; keep the node scalar.
    #[serde(default)]
    pub just_one: bool,

    #[serde(default)]
    pub action: IndexMap<String, ActionConfig>,
}

/// `[node.<name>.action.<action>]`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionConfig {
    pub cmd: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub interactive: bool,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub ignore_exit_status: bool,
    /// Run through sudo as root.
    #[serde(default)]
    pub sudo: bool,
    /// Run through sudo as this user.
    #[serde(default)]
    pub sudo_user: Option<String>,
}

/// Validated `[settings]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub connect_timeout: Duration,
    pub frontend_timeout: Duration,
    pub backlog_bytes: usize,
    pub fail_fast: bool,
    pub sandbox: bool,
    pub frontend: FrontendKind,
    pub max_parallel: Option<usize>,
    pub socket_dir: Option<PathBuf>,
}

/// Validated configuration. Construct through `ConfigFile::try_from`.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub settings: Settings,
    pub target: IndexMap<String, TargetConfig>,
    pub node: IndexMap<String, NodeConfig>,
    root: String,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(
        settings: Settings,
        target: IndexMap<String, TargetConfig>,
        node: IndexMap<String, NodeConfig>,
        root: String,
    ) -> Self {
        Self {
            settings,
            target,
            node,
            root,
        }
    }

    /// Name of the node without a parent.
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Names of the direct children of `name`, in file order.
    pub fn children_of<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.node
            .iter()
            .filter(move |(_, n)| n.parent.as_deref() == Some(name))
            .map(|(k, _)| k.as_str())
    }
}
