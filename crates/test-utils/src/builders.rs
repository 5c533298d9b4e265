use std::sync::Arc;

use fanout::config::{ConfigFile, RawConfigFile};
use fanout::engine::{Action, Dispatcher, ShellAction};
use fanout::errors::Result;
use fanout::session::{MultiplexerOptions, SessionMultiplexer};
use fanout::target::TargetHandle;
use fanout::tree::{NodeBuilder, RoleMapping, RoleSet, Tree, TreeBuilder};

use crate::fake_target::FakeTarget;

/// A named set of fake targets, e.g. `Fleet::new(&["web1", "web2"])`.
pub struct Fleet {
    pub targets: Vec<Arc<FakeTarget>>,
}

impl Fleet {
    pub fn new(slugs: &[&str]) -> Self {
        Self::from_targets(slugs.iter().map(|s| FakeTarget::new(*s)).collect())
    }

    pub fn from_targets(targets: Vec<FakeTarget>) -> Self {
        Self {
            targets: targets.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn handles(&self) -> Vec<TargetHandle> {
        self.targets
            .iter()
            .map(|t| Arc::clone(t) as TargetHandle)
            .collect()
    }

    pub fn get(&self, slug: &str) -> Arc<FakeTarget> {
        self.targets
            .iter()
            .find(|t| fanout::target::Target::slug(t.as_ref()) == slug)
            .cloned()
            .unwrap_or_else(|| panic!("no fake target {slug}"))
    }
}

/// Builder for the common two-level tree:
///
/// ```text
/// root   roles { web = <fleet> }
/// └─ web map { host = web }, isolate host
/// ```
pub struct WebTreeBuilder {
    web: Vec<TargetHandle>,
    web_actions: Vec<Action>,
    children: Vec<NodeBuilder>,
}

impl WebTreeBuilder {
    pub fn new(web: Vec<TargetHandle>) -> Self {
        Self {
            web,
            web_actions: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn web_action(mut self, action: Action) -> Self {
        self.web_actions.push(action);
        self
    }

    /// A shell action on `web`.
    pub fn web_shell(self, name: &str, template: &str) -> Self {
        self.web_action(Action::shell(name, ShellAction::new(template)))
    }

    /// A child of `web`.
    pub fn web_child(mut self, child: NodeBuilder) -> Self {
        self.children.push(child);
        self
    }

    pub fn build(self) -> Arc<Tree> {
        let mut web = NodeBuilder::new("web")
            .map(RoleMapping::new().map("host", ["web"]))
            .isolate("host");
        for action in self.web_actions {
            web = web.action(action);
        }
        for child in self.children {
            web = web.child(child);
        }

        let root = NodeBuilder::new("root").roles(
            RoleSet::new()
                .with_role("web", self.web)
                .expect("fresh role set"),
        );
        Arc::new(
            TreeBuilder::new(root.child(web))
                .build()
                .expect("valid web tree"),
        )
    }
}

/// Dispatcher over `tree` with a fresh multiplexer.
pub fn dispatcher(tree: Arc<Tree>) -> Dispatcher {
    Dispatcher::new(tree, multiplexer())
}

pub fn multiplexer() -> Arc<SessionMultiplexer> {
    Arc::new(SessionMultiplexer::new(MultiplexerOptions::default()))
}

/// Parse and validate a TOML config held in a string.
pub fn config(toml_text: &str) -> Result<ConfigFile> {
    let raw: RawConfigFile = toml::from_str(toml_text)?;
    ConfigFile::try_from(raw)
}
