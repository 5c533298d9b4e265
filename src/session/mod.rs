// src/session/mod.rs

//! Session multiplexer.
//!
//! Every pty-backed command started for a concurrent (or local interactive)
//! action becomes a [`Session`] owned by the [`SessionMultiplexer`]. Sessions
//! run whether or not anyone watches; front-ends attach and detach through
//! the attach protocol (see [`crate::attach`]).

pub mod backlog;
pub mod frontend;
pub mod multiplexer;
#[allow(clippy::module_inception)]
pub mod session;
pub mod state;

use bytes::Bytes;

pub use backlog::Backlog;
pub use frontend::{FrontendRequest, FrontendStrategy};
pub use multiplexer::{MultiplexerOptions, SessionMultiplexer};
pub use session::{Attachment, Session, SessionSummary};
pub use state::{SessionId, SessionState};

/// What an attached front-end receives after the replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Output(Bytes),
    Finished { exit_code: i32 },
}
