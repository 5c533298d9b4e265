// src/session/multiplexer.rs

//! Owner of every session of this process.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::errors::{AttachErrorKind, FanoutError, Result};
use crate::session::session::{Session, SessionSummary};
use crate::session::state::SessionId;
use crate::target::{RemoteCommand, TargetHandle};
use crate::types::TermSize;

#[derive(Debug, Clone)]
pub struct MultiplexerOptions {
    /// Bound of each session's output backlog.
    pub backlog_bytes: usize,
    /// Limit for `Target::connect`. Command execution is never timed out.
    pub connect_timeout: Duration,
    /// Pty size used before any front-end reports its own.
    pub initial_size: TermSize,
}

impl Default for MultiplexerOptions {
    fn default() -> Self {
        Self {
            backlog_bytes: 64 * 1024,
            connect_timeout: Duration::from_secs(10),
            initial_size: TermSize::default(),
        }
    }
}

#[derive(Debug)]
pub struct SessionMultiplexer {
    sessions: RwLock<IndexMap<SessionId, Arc<Session>>>,
    next_id: AtomicU64,
    options: MultiplexerOptions,
}

impl SessionMultiplexer {
    pub fn new(options: MultiplexerOptions) -> Self {
        Self {
            sessions: RwLock::new(IndexMap::new()),
            next_id: AtomicU64::new(1),
            options,
        }
    }

    pub fn options(&self) -> &MultiplexerOptions {
        &self.options
    }

    /// Connect to `target`, open a pty running `command` and register the
    /// resulting session.
    ///
    /// A failed or timed-out connect leaves a `Finished` session behind so
    /// listings show what happened; the error is returned to the caller.
    pub async fn spawn(
        &self,
        target: &TargetHandle,
        command: &RemoteCommand,
        label: impl Into<String>,
        size: Option<TermSize>,
    ) -> Result<Arc<Session>> {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let session = Arc::new(Session::new(
            id,
            target.slug(),
            label,
            command.command.clone(),
            self.options.backlog_bytes,
        ));
        self.sessions.write().insert(id, Arc::clone(&session));

        let timeout = self.options.connect_timeout;
        match tokio::time::timeout(timeout, target.connect()).await {
            Err(_) => {
                session.abort("connection timed out\r\n");
                return Err(FanoutError::Timeout {
                    target: target.slug().to_string(),
                    after: timeout,
                });
            }
            Ok(Err(err)) => {
                session.abort(&format!("{err}\r\n"));
                return Err(err);
            }
            Ok(Ok(())) => {}
        }

        let process = match target.open_pty(command, size.unwrap_or(self.options.initial_size)) {
            Ok(p) => p,
            Err(err) => {
                session.abort(&format!("{err}\r\n"));
                return Err(err);
            }
        };
        session.start(process)?;
        Ok(session)
    }

    pub fn get(&self, id: SessionId) -> Result<Arc<Session>> {
        self.sessions.read().get(&id).cloned().ok_or_else(|| {
            FanoutError::attach(AttachErrorKind::NotFound, format!("no session {id}"))
        })
    }

    pub fn list(&self) -> Vec<SessionSummary> {
        self.sessions.read().values().map(|s| s.summary()).collect()
    }

    /// Forget a session once its result has been collected.
    pub fn release(&self, id: SessionId) {
        self.sessions.write().shift_remove(&id);
    }

    /// Kill every session that has not finished. Detached sessions too.
    pub fn shutdown(&self) {
        let live: Vec<Arc<Session>> = self
            .sessions
            .read()
            .values()
            .filter(|s| !s.state().is_finished())
            .cloned()
            .collect();
        if live.is_empty() {
            return;
        }
        info!(count = live.len(), "killing unfinished sessions");
        for session in live {
            if let Err(err) = session.kill() {
                warn!(session = %session.id(), error = %err, "failed to kill session");
            }
        }
    }
}

impl Drop for SessionMultiplexer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
