// src/engine/action.rs

//! Actions attached to tree nodes.
//!
//! An action is either a shell command template run on a role's targets, or
//! an async closure that drives the bound [`Env`] itself (running commands,
//! moving files, invoking child-node actions).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::engine::env::Env;
use crate::errors::{FanoutError, RemoteFailure, Result};
use crate::target::command::{SudoMode, render_template};
use crate::target::{RemoteCommand, RunOutput};

/// Closure body of an action.
pub type ActionFn = Arc<dyn Fn(Env, Args) -> BoxFuture<'static, Result<RunOutput>> + Send + Sync>;

/// Arguments of one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Args {
    pub positional: Vec<String>,
    pub keyword: BTreeMap<String, String>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    /// Split command-line words: `key=value` becomes a keyword argument,
    /// anything else is positional.
    pub fn parse<S: AsRef<str>>(words: &[S]) -> Self {
        let mut args = Self::default();
        for word in words {
            let word = word.as_ref();
            match word.split_once('=') {
                Some((key, value)) if is_identifier(key) => {
                    args.keyword.insert(key.to_string(), value.to_string());
                }
                _ => args.positional.push(word.to_string()),
            }
        }
        args
    }

    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.positional.push(value.into());
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.keyword.insert(key.into(), value.into());
        self
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A command template run on the targets of one role, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellAction {
    /// Shell line with `{0}` / `{name}` placeholders.
    pub template: String,
    /// Role whose targets run the command. Defaults to the node's isolation
    /// role, else every target of the cell.
    pub role: Option<String>,
    pub cwd: Option<String>,
    pub env: BTreeMap<String, String>,
    pub ignore_exit_status: bool,
    pub sudo: Option<SudoMode>,
}

impl ShellAction {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            ..Self::default()
        }
    }
}

#[derive(Clone)]
pub enum ActionBody {
    Shell(ShellAction),
    Func(ActionFn),
}

#[derive(Clone)]
pub struct Action {
    pub name: String,
    /// Needs a pty (and, when run on several cells, a terminal front-end).
    pub interactive: bool,
    pub body: ActionBody,
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Action");
        d.field("name", &self.name)
            .field("interactive", &self.interactive);
        match &self.body {
            ActionBody::Shell(shell) => d.field("shell", shell),
            ActionBody::Func(_) => d.field("func", &"<closure>"),
        };
        d.finish()
    }
}

impl Action {
    pub fn shell(name: impl Into<String>, shell: ShellAction) -> Self {
        Self {
            name: name.into(),
            interactive: false,
            body: ActionBody::Shell(shell),
        }
    }

    pub fn func<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Env, Args) -> BoxFuture<'static, Result<RunOutput>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            interactive: false,
            body: ActionBody::Func(Arc::new(f)),
        }
    }

    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    /// Run the action inside one cell.
    pub async fn execute(&self, env: Env, args: Args) -> Result<RunOutput> {
        match &self.body {
            ActionBody::Func(f) => f(env, args).await,
            ActionBody::Shell(shell) => run_shell(shell, self.interactive, &env, &args).await,
        }
    }
}

async fn run_shell(shell: &ShellAction, pty: bool, env: &Env, args: &Args) -> Result<RunOutput> {
    let mut env = env.with_envs(&shell.env);
    if let Some(cwd) = &shell.cwd {
        env = env.with_cwd(cwd.clone());
    }
    let line = render_template(&shell.template, &args.positional, &args.keyword);
    let targets = env.targets(shell.role.as_deref())?;

    let mut output = String::new();
    let mut exit_code = 0;
    for target in targets {
        let command = env.command(line.clone()).with_sudo(shell.sudo.clone());
        let out = env.exec(&target, &command, pty).await?;
        output.push_str(&out.output);
        if !out.success() && !shell.ignore_exit_status {
            return Err(FanoutError::RemoteExecution {
                target: target.slug().to_string(),
                command: line,
                failure: RemoteFailure::ExitStatus {
                    code: out.exit_code,
                    output,
                },
            });
        }
        exit_code = out.exit_code;
    }
    Ok(RunOutput::new(exit_code, output))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_words_split_into_positional_and_keyword() {
        let args = Args::parse(&["v1.2", "env=prod", "a=b=c", "=x", "--flag"]);
        assert_eq!(args.positional, vec!["v1.2", "=x", "--flag"]);
        assert_eq!(args.keyword.get("env").map(String::as_str), Some("prod"));
        assert_eq!(args.keyword.get("a").map(String::as_str), Some("b=c"));
    }

    #[test]
    fn debug_hides_closures() {
        let action = Action::func("noop", |_, _| Box::pin(async { Ok(RunOutput::default()) }))
            .interactive(true);
        let text = format!("{action:?}");
        assert!(text.contains("noop"));
        assert!(text.contains("<closure>"));
    }
}
