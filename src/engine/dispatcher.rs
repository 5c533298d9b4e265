// src/engine/dispatcher.rs

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::action::{Action, Args};
use crate::engine::env::Env;
use crate::engine::plan::{ExecutionMode, PlanInput, TerminalMode, plan};
use crate::engine::prompt::Prompter;
use crate::engine::{CellOutcome, CellStatus, InvocationResult};
use crate::errors::{FanoutError, Result};
use crate::session::frontend::HeadlessFrontend;
use crate::session::{FrontendStrategy, SessionMultiplexer};
use crate::target::slugs;
use crate::tree::{
    Cell, CellIndex, Isolation, NodeId, NodePath, NodeRef, Resolver, Tree, expand_child, isolate,
};
use crate::types::FrontendKind;

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Cancel the remaining cells once one fails.
    pub fail_fast: bool,
    /// Wrap every target in a `SandboxTarget`.
    pub sandbox: bool,
    /// Upper bound on concurrently running cells of one invocation.
    pub max_parallel: Option<usize>,
    /// How long to wait for a front-end to attach to a new session.
    pub frontend_timeout: Duration,
    /// A single interactive cell may use the controlling terminal.
    pub local_terminal: bool,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            fail_fast: false,
            sandbox: false,
            max_parallel: None,
            frontend_timeout: Duration::from_secs(2),
            local_terminal: false,
        }
    }
}

/// Runs actions on the cells of a node.
///
/// Cheap to clone; every `Env` carries one to invoke child-node actions.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    tree: Arc<Tree>,
    resolver: Arc<Resolver>,
    multiplexer: Arc<SessionMultiplexer>,
    frontend: Arc<dyn FrontendStrategy>,
    prompter: Option<Arc<dyn Prompter>>,
    socket: Option<PathBuf>,
    options: DispatchOptions,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(tree: Arc<Tree>, multiplexer: Arc<SessionMultiplexer>) -> Self {
        Self {
            resolver: Arc::new(Resolver::new(Arc::clone(&tree))),
            tree,
            multiplexer,
            frontend: Arc::new(HeadlessFrontend),
            prompter: None,
            socket: None,
            options: DispatchOptions::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_options(mut self, options: DispatchOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_frontend(mut self, frontend: Arc<dyn FrontendStrategy>) -> Self {
        self.frontend = frontend;
        self
    }

    /// Who answers questions of non-headless cells. Without one, every
    /// question takes its default.
    pub fn with_prompter(mut self, prompter: Arc<dyn Prompter>) -> Self {
        self.prompter = Some(prompter);
        self
    }

    /// Attach socket front-ends connect to.
    pub fn with_socket(mut self, socket: PathBuf) -> Self {
        self.socket = Some(socket);
        self
    }

    /// Root token; cancelling it stops every invocation.
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn tree(&self) -> &Arc<Tree> {
        &self.tree
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub fn multiplexer(&self) -> &Arc<SessionMultiplexer> {
        &self.multiplexer
    }

    pub fn frontend(&self) -> &Arc<dyn FrontendStrategy> {
        &self.frontend
    }

    pub fn prompter(&self) -> Option<&Arc<dyn Prompter>> {
        self.prompter.as_ref()
    }

    pub fn socket(&self) -> Option<&PathBuf> {
        self.socket.as_ref()
    }

    pub fn options(&self) -> &DispatchOptions {
        &self.options
    }

    fn frontend_available(&self) -> bool {
        self.socket.is_some() && self.frontend.kind() != FrontendKind::Headless
    }

    /// Invoke `action` on a node path such as `web[1].worker`.
    pub async fn invoke_path(&self, path: &str, action: &str, args: Args) -> Result<InvocationResult> {
        let path: NodePath = path.parse()?;
        let node_ref = path.resolve(&self.tree)?;
        self.invoke(&node_ref, action, args).await
    }

    /// Invoke `action` on every cell `node_ref` selects.
    ///
    /// Structural errors (unknown action, role or cell, ambiguous
    /// isolation) are returned before anything runs. Per-cell failures are
    /// reported in the result.
    pub async fn invoke(
        &self,
        node_ref: &NodeRef,
        action: &str,
        args: Args,
    ) -> Result<InvocationResult> {
        let node = self.tree.node(node_ref.node);
        let action = self.lookup(node_ref.node, action)?;

        let cells: Vec<Cell> = isolate(&self.tree, &self.resolver, node_ref.node)?
            .into_iter()
            .filter(|c| node_ref.matches(c))
            .collect();

        let scalar = node_ref.is_single_cell();
        if scalar && cells.len() != 1 {
            let index = node_ref
                .filter
                .iter()
                .map(|i| format!("[{}]", i.unwrap_or_default()))
                .collect::<String>();
            return Err(FanoutError::UnknownCell {
                node: node.display_name().to_string(),
                index,
            });
        }

        info!(
            node = %node.display_name(),
            action = %action.name,
            cells = cells.len(),
            "invoking action"
        );
        let outcomes = self
            .run_cells(cells, action, args, self.options.local_terminal, self.cancel.child_token())
            .await;
        Ok(wrap(scalar, outcomes))
    }

    /// Invoke `action` on the child `child` of an already isolated cell.
    pub(crate) async fn invoke_child(
        &self,
        parent: &Cell,
        child: &str,
        action: &str,
        args: Args,
        local_terminal: bool,
        cancel: CancellationToken,
    ) -> Result<InvocationResult> {
        let child_id = self.tree.child(parent.node, child).ok_or_else(|| {
            let parent_path = self.tree.node(parent.node).path();
            FanoutError::UnknownNode(if parent_path.is_empty() {
                child.to_string()
            } else {
                format!("{parent_path}.{child}")
            })
        })?;
        let action = self.lookup(child_id, action)?;
        let cells = expand_child(&self.tree, parent, child_id)?;
        let scalar = !matches!(self.tree.node(child_id).isolation(), Isolation::Array { .. });

        debug!(
            node = %self.tree.node(child_id).display_name(),
            action = %action.name,
            cells = cells.len(),
            "invoking child action"
        );
        let outcomes = self
            .run_cells(cells, action, args, local_terminal, cancel.child_token())
            .await;
        Ok(wrap(scalar, outcomes))
    }

    fn lookup(&self, node: NodeId, action: &str) -> Result<Action> {
        let decl = self.tree.node(node);
        decl.action(action)
            .cloned()
            .ok_or_else(|| FanoutError::UnknownAction {
                node: decl.display_name().to_string(),
                action: action.to_string(),
            })
    }

    async fn run_cells(
        &self,
        cells: Vec<Cell>,
        action: Action,
        args: Args,
        local_terminal: bool,
        cancel: CancellationToken,
    ) -> Vec<CellOutcome> {
        let plan = plan(PlanInput {
            cells: cells.len(),
            interactive: action.interactive,
            frontend_available: self.frontend_available(),
            local_terminal,
        });
        debug!(mode = ?plan.mode, terminal = ?plan.terminal, "execution plan");

        match plan.mode {
            ExecutionMode::Empty => Vec::new(),
            ExecutionMode::Direct | ExecutionMode::Sequential => {
                let mut outcomes = Vec::with_capacity(cells.len());
                for cell in cells {
                    let outcome = self
                        .run_cell(cell, &action, args.clone(), plan.terminal, cancel.clone())
                        .await;
                    if self.options.fail_fast && outcome.status.is_failed() {
                        cancel.cancel();
                    }
                    outcomes.push(outcome);
                }
                outcomes
            }
            ExecutionMode::ConcurrentHeadless | ExecutionMode::ConcurrentInteractive => {
                self.run_concurrent(cells, action, args, plan.terminal, cancel)
                    .await
            }
        }
    }

    async fn run_concurrent(
        &self,
        cells: Vec<Cell>,
        action: Action,
        args: Args,
        terminal: TerminalMode,
        cancel: CancellationToken,
    ) -> Vec<CellOutcome> {
        let limit = self
            .options
            .max_parallel
            .filter(|n| *n > 0)
            .map(|n| Arc::new(Semaphore::new(n)));

        // Placeholders keep results index-aligned even if a task panics.
        let mut slots: Vec<Option<CellOutcome>> = Vec::with_capacity(cells.len());
        let mut meta = Vec::with_capacity(cells.len());
        let mut set = JoinSet::new();

        for (i, cell) in cells.into_iter().enumerate() {
            slots.push(None);
            meta.push(self.describe(&cell));
            let this = self.clone();
            let action = action.clone();
            let args = args.clone();
            let cancel = cancel.clone();
            let limit = limit.clone();
            set.spawn(async move {
                let _permit = match limit {
                    Some(sem) => tokio::select! {
                        permit = sem.acquire_owned() => permit.ok(),
                        _ = cancel.cancelled() => None,
                    },
                    None => None,
                };
                let outcome = this.run_cell(cell, &action, args, terminal, cancel.clone()).await;
                if this.options.fail_fast && outcome.status.is_failed() {
                    cancel.cancel();
                }
                (i, outcome)
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((i, outcome)) => slots[i] = Some(outcome),
                Err(err) => warn!(error = %err, "cell task failed to complete"),
            }
        }

        slots
            .into_iter()
            .zip(meta)
            .map(|(slot, (index, label, targets))| {
                slot.unwrap_or_else(|| CellOutcome {
                    index,
                    label,
                    targets,
                    status: CellStatus::Failed(FanoutError::Other(anyhow::anyhow!(
                        "cell task panicked"
                    ))),
                })
            })
            .collect()
    }

    fn describe(&self, cell: &Cell) -> (CellIndex, String, Vec<String>) {
        let targets = match cell.isolated_target(&self.tree) {
            Some(t) => vec![t.slug().to_string()],
            None => slugs(&cell.roles.all_targets()),
        };
        (cell.index.clone(), cell.label(&self.tree), targets)
    }

    async fn run_cell(
        &self,
        cell: Cell,
        action: &Action,
        args: Args,
        terminal: TerminalMode,
        cancel: CancellationToken,
    ) -> CellOutcome {
        let (index, label, targets) = self.describe(&cell);
        if cancel.is_cancelled() {
            return CellOutcome {
                index,
                label,
                targets,
                status: CellStatus::Cancelled,
            };
        }

        let env = Env::new(self.clone(), cell, terminal, cancel.clone());
        let status = match action.execute(env, args).await {
            Ok(out) => {
                debug!(cell = %label, exit_code = out.exit_code, "cell succeeded");
                CellStatus::Succeeded(out)
            }
            Err(FanoutError::Cancelled) => CellStatus::Cancelled,
            Err(err) => {
                warn!(cell = %label, error = %err, "cell failed");
                CellStatus::Failed(err)
            }
        };
        CellOutcome {
            index,
            label,
            targets,
            status,
        }
    }
}

fn wrap(scalar: bool, mut outcomes: Vec<CellOutcome>) -> InvocationResult {
    if scalar && outcomes.len() == 1 {
        if let Some(only) = outcomes.pop() {
            return InvocationResult::Single(only);
        }
    }
    InvocationResult::Array(outcomes)
}
