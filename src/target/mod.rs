// src/target/mod.rs

//! Execution targets.
//!
//! A [`Target`] is one machine actions run on. The rest of the crate only
//! sees this capability surface:
//! - `connect` (the only step a timeout applies to),
//! - `run` a command and collect `(exit_code, output)`,
//! - `open_pty` for an interactive, pty-backed command,
//! - `read_file` / `write_file`.
//!
//! Implementations:
//! - [`LocalTarget`]: the machine `fanout` runs on (`sh -c`).
//! - [`SshTarget`]: a remote machine reached through the system `ssh` client.
//! - [`SandboxTarget`]: wraps another target and only syntax-checks commands.

pub mod command;
pub mod local;
pub mod pty;
pub mod sandbox;
pub mod ssh;

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;

use crate::errors::Result;
use crate::types::TermSize;

pub use command::{CommandContext, RemoteCommand};
pub use local::LocalTarget;
pub use pty::{PtyControl, PtyProcess, PtyWait};
pub use sandbox::SandboxTarget;
pub use ssh::SshTarget;

/// Shared handle to a target. Many nodes may reference the same target.
pub type TargetHandle = Arc<dyn Target>;

/// Result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct RunOutput {
    pub exit_code: i32,
    pub output: String,
}

impl RunOutput {
    pub fn new(exit_code: i32, output: impl Into<String>) -> Self {
        Self {
            exit_code,
            output: output.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

pub trait Target: Send + Sync + fmt::Debug {
    /// Unique, stable identifier of this target within a tree.
    fn slug(&self) -> &str;

    /// Human readable address, used in logs and result listings.
    fn describe(&self) -> String {
        self.slug().to_string()
    }

    /// Make sure the target is reachable. Called before a session opens.
    fn connect(&self) -> BoxFuture<'_, Result<()>>;

    /// Run a command to completion.
    ///
    /// A non-zero exit status is *not* an error here; the caller decides.
    /// Errors mean the command could not be run at all.
    fn run<'a>(&'a self, command: &'a RemoteCommand, pty: bool)
    -> BoxFuture<'a, Result<RunOutput>>;

    /// Start a command inside a fresh pty of the given size.
    fn open_pty(&self, command: &RemoteCommand, size: TermSize) -> Result<PtyProcess>;

    fn read_file<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Vec<u8>>>;

    fn write_file<'a>(&'a self, path: &'a str, contents: &'a [u8]) -> BoxFuture<'a, Result<()>>;
}

/// Slugs of a target list, in order.
pub fn slugs(targets: &[TargetHandle]) -> Vec<String> {
    targets.iter().map(|t| t.slug().to_string()).collect()
}
