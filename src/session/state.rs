// src/session/state.rs

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(SessionId)
            .map_err(|e| format!("invalid session id '{s}': {e}"))
    }
}

/// Lifecycle of a session.
///
/// ```text
/// Pending -> Running -> Attached <-> Detached
///               \          |            /
///                `------> Finished <---'
/// ```
///
/// `Pending` may also go straight to `Finished` when the target could not be
/// reached or the pty failed to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Running,
    Attached,
    Detached,
    Finished,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Finished)
                | (Running, Attached)
                | (Running, Finished)
                | (Attached, Detached)
                | (Attached, Finished)
                | (Detached, Attached)
                | (Detached, Finished)
        )
    }

    pub fn is_finished(self) -> bool {
        self == SessionState::Finished
    }

    /// The process is alive and accepts input.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            SessionState::Running | SessionState::Attached | SessionState::Detached
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Pending => "pending",
            SessionState::Running => "running",
            SessionState::Attached => "attached",
            SessionState::Detached => "detached",
            SessionState::Finished => "finished",
        };
        f.write_str(s)
    }
}
