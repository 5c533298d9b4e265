// src/errors.rs

//! Crate-wide error type and result alias.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FanoutError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Cycle detected in node tree: {0}")]
    TreeCycle(String),

    #[error("Node not found: {0}")]
    UnknownNode(String),

    #[error("Node '{node}' has no action named '{action}'")]
    UnknownAction { node: String, action: String },

    #[error("Node '{node}' has no cell {index}")]
    UnknownCell { node: String, index: String },

    /// A role mapping references a role the parent does not define.
    #[error("Node '{node}' maps from unknown role '{role}'")]
    UnknownRole { node: String, role: String },

    #[error("Ambiguous isolation: {0}")]
    AmbiguousIsolation(String),

    #[error("Command `{command}` on {target}: {failure}")]
    RemoteExecution {
        target: String,
        command: String,
        failure: RemoteFailure,
    },

    #[error("Attach failed ({kind}): {message}")]
    SessionAttach {
        kind: AttachErrorKind,
        message: String,
    },

    #[error("Timed out connecting to {target} after {after:?}")]
    Timeout { target: String, after: Duration },

    #[error("Cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Why a remote command did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteFailure {
    /// The command ran and exited non-zero.
    ExitStatus { code: i32, output: String },
    /// The command could not be run or its connection dropped.
    Transport(String),
}

impl fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteFailure::ExitStatus { code, .. } => write!(f, "exited with status {code}"),
            RemoteFailure::Transport(msg) => write!(f, "transport failure: {msg}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachErrorKind {
    SocketMissing,
    PermissionDenied,
    NotFound,
    Finished,
    Busy,
    Protocol,
}

impl fmt::Display for AttachErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AttachErrorKind::SocketMissing => "socket missing",
            AttachErrorKind::PermissionDenied => "permission denied",
            AttachErrorKind::NotFound => "no such session",
            AttachErrorKind::Finished => "session finished",
            AttachErrorKind::Busy => "session already attached",
            AttachErrorKind::Protocol => "protocol error",
        };
        f.write_str(s)
    }
}

impl FanoutError {
    pub fn attach(kind: AttachErrorKind, message: impl Into<String>) -> Self {
        FanoutError::SessionAttach {
            kind,
            message: message.into(),
        }
    }

    pub fn transport(target: &str, command: &str, err: impl fmt::Display) -> Self {
        FanoutError::RemoteExecution {
            target: target.to_string(),
            command: command.to_string(),
            failure: RemoteFailure::Transport(err.to_string()),
        }
    }

    /// Structural errors abort a whole invocation before any command runs.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            FanoutError::UnknownRole { .. }
                | FanoutError::AmbiguousIsolation(_)
                | FanoutError::UnknownNode(_)
                | FanoutError::UnknownAction { .. }
                | FanoutError::UnknownCell { .. }
                | FanoutError::ConfigError(_)
                | FanoutError::TreeCycle(_)
        )
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, FanoutError>;
