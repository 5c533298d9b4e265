// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::session::SessionId;
use crate::types::SignalKind;

/// Command-line arguments for `fanout`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "fanout",
    version,
    about = "Run actions across a hierarchy of machines, in parallel and interactively.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `FANOUT_CONFIG`, else `Fanout.toml` in the current directory.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `FANOUT_LOG` or a default level will be used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Invoke an action on a node, e.g. `fanout run web[1] deploy v2 env=prod`.
    Run(RunArgs),

    /// Parse + validate, print resolved roles and cells, run nothing.
    Check,

    /// Attach this terminal to a running session.
    Attach {
        #[arg(long, value_name = "PATH")]
        socket: PathBuf,
        #[arg(long, value_name = "ID")]
        session: SessionId,
    },

    /// List sessions of one server, or of every server in the socket directory.
    Sessions {
        #[arg(long, value_name = "PATH")]
        socket: Option<PathBuf>,
    },

    /// Send a signal to a session.
    Signal {
        #[arg(long, value_name = "PATH")]
        socket: PathBuf,
        #[arg(long, value_name = "ID")]
        session: SessionId,
        #[arg(long, value_enum)]
        signal: SignalKind,
    },
}

#[derive(Debug, Clone, clap::Args)]
pub struct RunArgs {
    /// Node path: `web`, `web[1]`, `web[0].worker`.
    pub path: String,

    /// Action name on that node.
    pub action: String,

    /// Action arguments; `key=value` words become keyword arguments.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,

    /// Only syntax-check commands and skip file writes.
    #[arg(long)]
    pub sandbox: bool,

    /// Cancel the remaining cells as soon as one fails.
    #[arg(long)]
    pub fail_fast: bool,

    /// Never open terminal front-ends.
    #[arg(long)]
    pub headless: bool,

    /// Serve the attach socket at this path instead of the default.
    #[arg(long, value_name = "PATH")]
    pub socket: Option<PathBuf>,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_collects_trailing_args() {
        let args = CliArgs::try_parse_from([
            "fanout", "run", "--fail-fast", "web[1]", "deploy", "v2", "env=prod",
        ])
        .unwrap();
        match args.command {
            Command::Run(run) => {
                assert_eq!(run.path, "web[1]");
                assert_eq!(run.action, "deploy");
                assert_eq!(run.args, vec!["v2", "env=prod"]);
                assert!(run.fail_fast);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn flags_before_positionals() {
        let args =
            CliArgs::try_parse_from(["fanout", "--log-level", "debug", "run", "--sandbox", "web", "uptime"])
                .unwrap();
        match args.command {
            Command::Run(run) => {
                assert!(run.sandbox);
                assert!(run.args.is_empty());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn signal_parses_session_and_kind() {
        let args = CliArgs::try_parse_from([
            "fanout", "signal", "--socket", "/tmp/s.sock", "--session", "4", "--signal", "terminate",
        ])
        .unwrap();
        match args.command {
            Command::Signal { session, signal, .. } => {
                assert_eq!(session, SessionId(4));
                assert_eq!(signal, SignalKind::Terminate);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
