// src/engine/env.rs

//! The context an action runs in.
//!
//! An [`Env`] is one cell of one node, plus everything needed to act on it:
//! which targets each role resolves to, where pty commands get a terminal,
//! the working directory and environment of commands, cancellation, and the
//! dispatcher for invoking actions of child nodes.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::attach::{AttachOutcome, attach_local};
use crate::engine::InvocationResult;
use crate::engine::action::Args;
use crate::engine::dispatcher::Dispatcher;
use crate::engine::plan::TerminalMode;
use crate::engine::prompt::{Question, parse_confirm};
use crate::errors::{FanoutError, RemoteFailure, Result};
use crate::session::{FrontendRequest, Session};
use crate::target::{CommandContext, RemoteCommand, RunOutput, SandboxTarget, TargetHandle};
use crate::tree::{Cell, CellIndex, NodeDecl, Tree};
use crate::types::TermSize;

#[derive(Debug, Clone)]
pub struct Env {
    dispatcher: Dispatcher,
    cell: Arc<Cell>,
    terminal: TerminalMode,
    context: CommandContext,
    cancel: CancellationToken,
}

impl Env {
    pub(crate) fn new(
        dispatcher: Dispatcher,
        cell: Cell,
        terminal: TerminalMode,
        cancel: CancellationToken,
    ) -> Self {
        let term = std::env::var("TERM").ok().filter(|t| !t.is_empty());
        Self {
            dispatcher,
            cell: Arc::new(cell),
            terminal,
            context: CommandContext::new().with_term(term),
            cancel,
        }
    }

    pub fn tree(&self) -> &Arc<Tree> {
        self.dispatcher.tree()
    }

    pub fn cell(&self) -> &Cell {
        &self.cell
    }

    pub fn node(&self) -> &NodeDecl {
        self.tree().node(self.cell.node)
    }

    pub fn index(&self) -> &CellIndex {
        &self.cell.index
    }

    pub fn terminal(&self) -> TerminalMode {
        self.terminal
    }

    pub fn is_sandboxed(&self) -> bool {
        self.dispatcher.options().sandbox
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn context(&self) -> &CommandContext {
        &self.context
    }

    /// Same cell, commands run inside `path`.
    pub fn with_cwd(&self, path: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.context = self.context.with_cwd(path);
        next
    }

    pub fn with_env(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.context = self.context.with_env(key, value);
        next
    }

    pub fn with_envs(&self, vars: &BTreeMap<String, String>) -> Self {
        let mut next = self.clone();
        next.context = self.context.with_envs(vars);
        next
    }

    pub fn with_prefix(&self, prefix: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.context = self.context.with_prefix(prefix);
        next
    }

    /// `cmd` in this env's working directory and environment.
    pub fn command(&self, cmd: impl Into<String>) -> RemoteCommand {
        RemoteCommand::new(cmd).with_context(self.context.clone())
    }

    fn wrap(&self, target: TargetHandle) -> TargetHandle {
        if self.is_sandboxed() {
            Arc::new(SandboxTarget::new(target))
        } else {
            target
        }
    }

    /// Targets of `role`, in order. Without a role: the node's isolation
    /// role if it has one, else every target of the cell.
    pub fn targets(&self, role: Option<&str>) -> Result<Vec<TargetHandle>> {
        let role = role.or_else(|| self.node().isolation_role());
        let targets = match role {
            Some(role) => self
                .cell
                .roles
                .get(role)
                .ok_or_else(|| FanoutError::UnknownRole {
                    node: self.node().display_name().to_string(),
                    role: role.to_string(),
                })?
                .to_vec(),
            None => self.cell.roles.all_targets(),
        };
        Ok(targets.into_iter().map(|t| self.wrap(t)).collect())
    }

    /// The one target this cell is about.
    pub fn target(&self) -> Result<TargetHandle> {
        if let Some(t) = self.cell.isolated_target(self.tree()) {
            return Ok(self.wrap(t));
        }
        let mut all = self.cell.roles.all_targets();
        if all.len() == 1 {
            if let Some(t) = all.pop() {
                return Ok(self.wrap(t));
            }
        }
        Err(FanoutError::AmbiguousIsolation(format!(
            "node '{}' has {} targets and no isolation role",
            self.node().display_name(),
            all.len()
        )))
    }

    /// Run `cmd` on every target of `role` in order; a non-zero exit is an
    /// error naming the target.
    pub async fn run(&self, role: Option<&str>, cmd: &str) -> Result<RunOutput> {
        let mut output = String::new();
        let mut exit_code = 0;
        for target in self.targets(role)? {
            let out = self.exec(&target, &self.command(cmd), false).await?;
            output.push_str(&out.output);
            check_status(&target, cmd, &out)?;
            exit_code = out.exit_code;
        }
        Ok(RunOutput::new(exit_code, output))
    }

    /// Run `cmd` on this cell's target in a pty.
    pub async fn run_interactive(&self, cmd: &str) -> Result<RunOutput> {
        let target = self.target()?;
        let out = self.exec(&target, &self.command(cmd), true).await?;
        check_status(&target, cmd, &out)?;
        Ok(out)
    }

    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let target = self.target()?;
        target.read_file(&self.absolute(path)).await
    }

    pub async fn write_file(&self, path: &str, contents: &[u8]) -> Result<()> {
        let target = self.target()?;
        target.write_file(&self.absolute(path), contents).await
    }

    fn absolute(&self, path: &str) -> String {
        match self.context.cwd() {
            Some(cwd) if !path.starts_with('/') && !path.starts_with('~') => {
                format!("{}/{}", cwd.trim_end_matches('/'), path)
            }
            _ => path.to_string(),
        }
    }

    /// Ask for free text. Headless cells get `default` without blocking.
    pub async fn input(&self, prompt: &str, default: &str) -> Result<String> {
        self.ask(prompt, default, Vec::new(), |_| true).await
    }

    /// Ask a yes/no question.
    pub async fn confirm(&self, prompt: &str, default: bool) -> Result<bool> {
        let fallback = if default { "y" } else { "n" };
        let options = vec!["y".to_string(), "n".to_string()];
        let answer = self
            .ask(prompt, fallback, options, |a| parse_confirm(a).is_some())
            .await?;
        Ok(parse_confirm(&answer).unwrap_or(default))
    }

    /// Ask for one of `options`; other answers are asked again.
    pub async fn choice(&self, prompt: &str, options: &[&str], default: &str) -> Result<String> {
        let allowed: Vec<String> = options.iter().map(|o| o.to_string()).collect();
        let check = allowed.clone();
        self.ask(prompt, default, allowed, move |a| check.iter().any(|o| o == a))
            .await
    }

    async fn ask(
        &self,
        prompt: &str,
        default: &str,
        options: Vec<String>,
        accept: impl Fn(&str) -> bool,
    ) -> Result<String> {
        let question = Question {
            label: self.cell.label(self.tree()),
            prompt: prompt.to_string(),
            default: default.to_string(),
            options,
        };
        let prompter = match (self.terminal, self.dispatcher.prompter()) {
            (TerminalMode::Headless, _) | (_, None) => {
                debug!(cell = %question.label, prompt, default, "no operator; using default answer");
                return Ok(question.default);
            }
            (_, Some(prompter)) => Arc::clone(prompter),
        };

        loop {
            let answer = tokio::select! {
                answer = prompter.ask(&question) => answer?,
                _ = self.cancel.cancelled() => return Err(FanoutError::Cancelled),
            };
            match answer {
                None => return Ok(question.default),
                Some(a) if a.trim().is_empty() => return Ok(question.default),
                Some(a) if accept(a.trim()) => return Ok(a.trim().to_string()),
                Some(a) => debug!(cell = %question.label, answer = %a, "answer not accepted; asking again"),
            }
        }
    }

    /// Invoke `action` on the child node `child` from this cell.
    pub async fn invoke_child(
        &self,
        child: &str,
        action: &str,
        args: Args,
    ) -> Result<InvocationResult> {
        self.dispatcher
            .invoke_child(
                &self.cell,
                child,
                action,
                args,
                self.terminal == TerminalMode::Inline,
                self.cancel.clone(),
            )
            .await
    }

    /// Run one command, choosing the terminal by mode. The exit status is
    /// returned, not checked.
    pub async fn exec(
        &self,
        target: &TargetHandle,
        command: &RemoteCommand,
        pty: bool,
    ) -> Result<RunOutput> {
        if self.cancel.is_cancelled() {
            return Err(FanoutError::Cancelled);
        }
        match (pty, self.terminal) {
            (false, _) | (true, TerminalMode::Headless) => {
                tokio::select! {
                    out = target.run(command, false) => out,
                    _ = self.cancel.cancelled() => Err(FanoutError::Cancelled),
                }
            }
            (true, TerminalMode::Inline) => self.exec_inline(target, command).await,
            (true, TerminalMode::Sessions) => self.exec_session(target, command).await,
        }
    }

    fn session_label(&self, target: &TargetHandle) -> String {
        format!("{} @ {}", self.cell.label(self.tree()), target.slug())
    }

    async fn exec_inline(&self, target: &TargetHandle, command: &RemoteCommand) -> Result<RunOutput> {
        let mux = Arc::clone(self.dispatcher.multiplexer());
        let session = mux
            .spawn(target, command, self.session_label(target), TermSize::current())
            .await?;

        match attach_local(Arc::clone(&mux), session.id()).await {
            Ok(AttachOutcome::Finished(code)) => {
                debug!(session = %session.id(), exit_code = code, "inline session finished");
            }
            Ok(AttachOutcome::Detached) => {
                info!(session = %session.id(), "detached; session keeps running");
            }
            Err(err) => {
                warn!(session = %session.id(), error = %err, "could not attach local terminal");
            }
        }
        self.finish(&session).await
    }

    async fn exec_session(&self, target: &TargetHandle, command: &RemoteCommand) -> Result<RunOutput> {
        let mux = self.dispatcher.multiplexer();
        let session = mux
            .spawn(target, command, self.session_label(target), None)
            .await?;

        if let Some(socket) = self.dispatcher.socket() {
            let request = FrontendRequest {
                socket: socket.clone(),
                session: session.id(),
                title: session.label().to_string(),
                focus: false,
            };
            if let Err(err) = self.dispatcher.frontend().open(&request).await {
                warn!(session = %session.id(), error = %err, "could not open front-end");
            }
            let timeout = self.dispatcher.options().frontend_timeout;
            if !session.wait_attached(timeout).await {
                let line = request.attach_line().unwrap_or_default();
                info!(
                    session = %session.id(),
                    "no front-end attached within {timeout:?}; running unattended, attach with: {line}"
                );
            }
        }
        self.finish(&session).await
    }

    /// Wait for the session, killing it on cancellation, then forget it.
    async fn finish(&self, session: &Arc<Session>) -> Result<RunOutput> {
        let mux = self.dispatcher.multiplexer();
        let result = tokio::select! {
            out = session.wait_finished() => Ok(out),
            _ = self.cancel.cancelled() => {
                if let Err(err) = session.kill() {
                    warn!(session = %session.id(), error = %err, "failed to kill cancelled session");
                }
                Err(FanoutError::Cancelled)
            }
        };
        mux.release(session.id());
        result
    }
}

fn check_status(target: &TargetHandle, cmd: &str, out: &RunOutput) -> Result<()> {
    if out.success() {
        return Ok(());
    }
    Err(FanoutError::RemoteExecution {
        target: target.slug().to_string(),
        command: cmd.to_string(),
        failure: RemoteFailure::ExitStatus {
            code: out.exit_code,
            output: out.output.clone(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::dispatcher::DispatchOptions;
    use crate::engine::prompt::Prompter;
    use crate::fs::FileSystem;
    use crate::fs::mock::MockFileSystem;
    use crate::session::{MultiplexerOptions, SessionMultiplexer};
    use crate::target::LocalTarget;
    use crate::tree::{NodeBuilder, RoleMapping, RoleSet, TreeBuilder, isolate};

    fn env_for(sandbox: bool, fs: MockFileSystem) -> Env {
        let a: TargetHandle = Arc::new(LocalTarget::new("a").with_fs(Arc::new(fs.clone())));
        let b: TargetHandle = Arc::new(LocalTarget::new("b").with_fs(Arc::new(fs)));
        let root = NodeBuilder::new("root")
            .roles(RoleSet::new().with_role("web", vec![a, b]).unwrap())
            .child(
                NodeBuilder::new("web")
                    .map(RoleMapping::new().map("host", ["web"]))
                    .isolate("host"),
            );
        let tree = Arc::new(TreeBuilder::new(root).build().unwrap());
        let mux = Arc::new(SessionMultiplexer::new(MultiplexerOptions::default()));
        let dispatcher = Dispatcher::new(Arc::clone(&tree), mux).with_options(DispatchOptions {
            sandbox,
            ..DispatchOptions::default()
        });
        let web = tree.find("web").unwrap();
        let cell = isolate(&tree, dispatcher.resolver(), web).unwrap().remove(1);
        Env::new(dispatcher, cell, TerminalMode::Headless, CancellationToken::new())
    }

    #[tokio::test]
    async fn cell_target_and_relative_files() {
        let fs = MockFileSystem::new();
        let env = env_for(false, fs.clone()).with_cwd("/srv/app");
        assert_eq!(env.target().unwrap().slug(), "b");

        env.write_file("config.yml", b"x: 1").await.unwrap();
        assert_eq!(env.read_file("/srv/app/config.yml").await.unwrap(), b"x: 1");
    }

    #[tokio::test]
    async fn sandbox_skips_writes_and_commands() {
        let fs = MockFileSystem::new();
        let env = env_for(true, fs.clone());
        env.write_file("/tmp/never", b"data").await.unwrap();
        assert!(fs.read(std::path::Path::new("/tmp/never")).is_err());

        let out = env.run(None, "touch /nonexistent/dir/file").await.unwrap();
        assert_eq!(out.output.trim(), "touch /nonexistent/dir/file");
    }

    #[tokio::test]
    async fn failing_command_names_its_target() {
        let env = env_for(false, MockFileSystem::new());
        let err = env.run(None, "exit 4").await.unwrap_err();
        match err {
            FanoutError::RemoteExecution { target, failure, .. } => {
                assert_eq!(target, "b");
                assert!(matches!(failure, RemoteFailure::ExitStatus { code: 4, .. }));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[derive(Debug)]
    struct Answers(parking_lot::Mutex<Vec<&'static str>>);

    impl Prompter for Answers {
        fn ask<'a>(
            &'a self,
            _question: &'a Question,
        ) -> futures::future::BoxFuture<'a, Result<Option<String>>> {
            Box::pin(async move {
                let mut left = self.0.lock();
                Ok((!left.is_empty()).then(|| left.remove(0).to_string()))
            })
        }
    }

    fn with_terminal(env: Env, terminal: TerminalMode, answers: Vec<&'static str>) -> Env {
        let dispatcher = env
            .dispatcher
            .clone()
            .with_prompter(Arc::new(Answers(parking_lot::Mutex::new(answers))));
        Env {
            dispatcher,
            terminal,
            ..env
        }
    }

    #[tokio::test]
    async fn headless_questions_take_the_default() {
        let env = with_terminal(
            env_for(false, MockFileSystem::new()),
            TerminalMode::Headless,
            vec!["never asked"],
        );
        assert_eq!(env.input("Branch?", "main").await.unwrap(), "main");
        assert!(env.confirm("Restart?", true).await.unwrap());
        assert_eq!(env.choice("Env?", &["dev", "prod"], "dev").await.unwrap(), "dev");
    }

    #[tokio::test]
    async fn attended_questions_use_the_operator_answer() {
        let env = with_terminal(
            env_for(false, MockFileSystem::new()),
            TerminalMode::Sessions,
            vec!["release", "maybe", "no", "staging", "prod", ""],
        );
        assert_eq!(env.input("Branch?", "main").await.unwrap(), "release");
        assert!(!env.confirm("Restart?", true).await.unwrap());
        assert_eq!(env.choice("Env?", &["dev", "prod"], "dev").await.unwrap(), "prod");
        assert_eq!(env.input("Tag?", "latest").await.unwrap(), "latest");
        // Input closed: default.
        assert!(env.confirm("Again?", true).await.unwrap());
    }

    #[tokio::test]
    async fn cancelled_env_runs_nothing() {
        let env = env_for(false, MockFileSystem::new());
        env.cancel_token().cancel();
        assert!(matches!(
            env.run(None, "true").await,
            Err(FanoutError::Cancelled)
        ));
    }
}
