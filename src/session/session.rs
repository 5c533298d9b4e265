// src/session/session.rs

//! One live pty bound to one target and one in-flight command.

use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::errors::{AttachErrorKind, FanoutError, Result};
use crate::session::SessionEvent;
use crate::session::backlog::Backlog;
use crate::session::state::{SessionId, SessionState};
use crate::target::{PtyControl, PtyProcess, RunOutput};
use crate::types::{SignalKind, TermSize};

/// Listing entry, as shown by `fanout sessions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub target: String,
    pub label: String,
    pub command: String,
    pub state: SessionState,
    pub exit_code: Option<i32>,
}

/// A front-end's live binding to a session.
#[derive(Debug)]
pub struct Attachment {
    pub session: SessionId,
    pub attach_id: u64,
    /// Buffered output up to the moment of attaching.
    pub replay: Bytes,
    /// Everything produced after `replay`, in order.
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

struct AttachSlot {
    id: u64,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

struct Inner {
    state: SessionState,
    backlog: Backlog,
    attached: Option<AttachSlot>,
    exit_code: Option<i32>,
    next_attach: u64,
}

struct SessionIo {
    writer: Box<dyn Write + Send>,
    control: Arc<dyn PtyControl>,
}

pub struct Session {
    id: SessionId,
    target: String,
    label: String,
    command: String,
    inner: Mutex<Inner>,
    io: Mutex<Option<SessionIo>>,
    state_tx: watch::Sender<SessionState>,
    ever_attached: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        target: impl Into<String>,
        label: impl Into<String>,
        command: impl Into<String>,
        backlog_bytes: usize,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Pending);
        Self {
            id,
            target: target.into(),
            label: label.into(),
            command: command.into(),
            inner: Mutex::new(Inner {
                state: SessionState::Pending,
                backlog: Backlog::new(backlog_bytes),
                attached: None,
                exit_code: None,
                next_attach: 1,
            }),
            io: Mutex::new(None),
            state_tx,
            ever_attached: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.inner.lock().exit_code
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn summary(&self) -> SessionSummary {
        let inner = self.inner.lock();
        SessionSummary {
            id: self.id,
            target: self.target.clone(),
            label: self.label.clone(),
            command: self.command.clone(),
            state: inner.state,
            exit_code: inner.exit_code,
        }
    }

    /// Current backlog contents.
    pub fn output(&self) -> Bytes {
        self.inner.lock().backlog.snapshot()
    }

    fn transition(&self, inner: &mut Inner, next: SessionState) -> bool {
        if !inner.state.can_transition_to(next) {
            return false;
        }
        debug!(session = %self.id, from = %inner.state, to = %next, "session transition");
        inner.state = next;
        self.state_tx.send_replace(next);
        true
    }

    /// `Pending -> Running`: take ownership of the pty and start pumping it.
    pub(crate) fn start(self: &Arc<Self>, process: PtyProcess) -> Result<()> {
        let PtyProcess {
            mut reader,
            writer,
            control,
            waiter,
        } = process;

        {
            let mut inner = self.inner.lock();
            if !self.transition(&mut inner, SessionState::Running) {
                return Err(FanoutError::Other(anyhow::anyhow!(
                    "session {} cannot start from state {}",
                    self.id,
                    inner.state
                )));
            }
        }
        *self.io.lock() = Some(SessionIo { writer, control });
        info!(session = %self.id, target = %self.target, label = %self.label, "session running");

        let session = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => session.record_output(&buf[..n]),
                    Err(_) => break,
                }
            }
            let code = match waiter.wait() {
                Ok(code) => code,
                Err(err) => {
                    warn!(session = %session.id, error = %err, "waiting for session process failed");
                    -1
                }
            };
            session.record_exit(code);
        });
        Ok(())
    }

    /// `Pending -> Finished` without ever running.
    pub(crate) fn abort(&self, reason: &str) {
        let mut inner = self.inner.lock();
        inner.backlog.push(reason.as_bytes());
        self.transition(&mut inner, SessionState::Finished);
    }

    pub(crate) fn record_output(&self, chunk: &[u8]) {
        let mut inner = self.inner.lock();
        inner.backlog.push(chunk);
        let delivered = match &inner.attached {
            Some(slot) => slot
                .tx
                .send(SessionEvent::Output(Bytes::copy_from_slice(chunk)))
                .is_ok(),
            None => true,
        };
        if !delivered {
            debug!(session = %self.id, "attached front-end went away; detaching");
            inner.attached = None;
            self.transition(&mut inner, SessionState::Detached);
        }
    }

    pub(crate) fn record_exit(&self, exit_code: i32) {
        {
            let mut inner = self.inner.lock();
            inner.exit_code = Some(exit_code);
            if let Some(slot) = inner.attached.take() {
                let _ = slot.tx.send(SessionEvent::Finished { exit_code });
            }
            self.transition(&mut inner, SessionState::Finished);
        }
        *self.io.lock() = None;
        info!(session = %self.id, target = %self.target, exit_code, "session finished");
    }

    /// Bind a front-end. At most one at a time.
    ///
    /// The replay and the event channel are taken under the same lock that
    /// records output, so nothing produced meanwhile is lost or repeated.
    pub fn attach(&self) -> Result<Attachment> {
        let mut inner = self.inner.lock();
        match inner.state {
            SessionState::Finished => {
                return Err(FanoutError::attach(
                    AttachErrorKind::Finished,
                    format!("session {} already finished", self.id),
                ));
            }
            SessionState::Attached => {
                return Err(FanoutError::attach(
                    AttachErrorKind::Busy,
                    format!("session {} is attached elsewhere", self.id),
                ));
            }
            SessionState::Pending => {
                return Err(FanoutError::attach(
                    AttachErrorKind::Protocol,
                    format!("session {} has not started yet", self.id),
                ));
            }
            SessionState::Running | SessionState::Detached => {}
        }

        let attach_id = inner.next_attach;
        inner.next_attach += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        inner.attached = Some(AttachSlot { id: attach_id, tx });
        let replay = inner.backlog.snapshot();
        self.transition(&mut inner, SessionState::Attached);
        self.ever_attached.store(true, Ordering::SeqCst);

        info!(session = %self.id, attach_id, replay = replay.len(), "front-end attached");
        Ok(Attachment {
            session: self.id,
            attach_id,
            replay,
            events: rx,
        })
    }

    /// Release the front-end binding. The process keeps running.
    pub fn detach(&self, attach_id: u64) {
        let mut inner = self.inner.lock();
        if inner.attached.as_ref().is_some_and(|s| s.id == attach_id) {
            inner.attached = None;
            self.transition(&mut inner, SessionState::Detached);
            info!(session = %self.id, attach_id, "front-end detached");
        }
    }

    pub fn write_input(&self, data: &[u8]) -> Result<()> {
        let mut io = self.io.lock();
        let Some(io) = io.as_mut() else {
            return Err(FanoutError::attach(
                AttachErrorKind::Finished,
                format!("session {} is not running", self.id),
            ));
        };
        io.writer.write_all(data)?;
        io.writer.flush()?;
        Ok(())
    }

    pub fn resize(&self, size: TermSize) -> Result<()> {
        match self.io.lock().as_ref() {
            Some(io) => io.control.resize(size),
            None => Ok(()),
        }
    }

    /// Interrupt is delivered as Ctrl-C through the pty so it reaches the
    /// remote process; the others signal the local process directly.
    pub fn signal(&self, signal: SignalKind) -> Result<()> {
        info!(session = %self.id, %signal, "signalling session");
        if signal == SignalKind::Interrupt {
            return self.write_input(&[0x03]);
        }
        match self.io.lock().as_ref() {
            Some(io) => io.control.signal(signal),
            None => Ok(()),
        }
    }

    pub fn kill(&self) -> Result<()> {
        if self.state().is_finished() {
            return Ok(());
        }
        self.signal(SignalKind::Kill)
    }

    /// Block until the session finishes; returns its exit code and backlog.
    pub async fn wait_finished(&self) -> RunOutput {
        let mut rx = self.subscribe_state();
        // The sender lives in `self`, so this only ends once Finished is seen.
        let _ = rx.wait_for(|s| s.is_finished()).await;
        let inner = self.inner.lock();
        RunOutput::new(
            inner.exit_code.unwrap_or(-1),
            String::from_utf8_lossy(&inner.backlog.snapshot()).into_owned(),
        )
    }

    /// Wait until some front-end attached at least once, or the session
    /// finished. Returns false on timeout.
    pub async fn wait_attached(&self, timeout: Duration) -> bool {
        let mut rx = self.subscribe_state();
        let ever = &self.ever_attached;
        let fut = rx.wait_for(|s| {
            matches!(s, SessionState::Attached | SessionState::Finished)
                || ever.load(Ordering::SeqCst)
        });
        matches!(tokio::time::timeout(timeout, fut).await, Ok(Ok(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running() -> Session {
        let s = Session::new(SessionId(1), "t", "label", "cmd", 1024);
        {
            let mut inner = s.inner.lock();
            assert!(s.transition(&mut inner, SessionState::Running));
        }
        s
    }

    #[tokio::test]
    async fn reattach_replays_without_gap() {
        let s = running();
        s.record_output(b"one ");

        let mut first = s.attach().unwrap();
        assert_eq!(&first.replay[..], b"one ");
        s.record_output(b"two ");
        match first.events.recv().await {
            Some(SessionEvent::Output(b)) => assert_eq!(&b[..], b"two "),
            other => panic!("unexpected event {other:?}"),
        }

        s.detach(first.attach_id);
        assert_eq!(s.state(), SessionState::Detached);
        s.record_output(b"three");

        let second = s.attach().unwrap();
        assert_eq!(&second.replay[..], b"one two three");
    }

    #[tokio::test]
    async fn second_attach_is_busy_and_finished_refuses() {
        let s = running();
        let a = s.attach().unwrap();
        let err = s.attach().unwrap_err();
        assert!(matches!(
            err,
            FanoutError::SessionAttach { kind: AttachErrorKind::Busy, .. }
        ));

        s.record_exit(0);
        let err = s.attach().unwrap_err();
        assert!(matches!(
            err,
            FanoutError::SessionAttach { kind: AttachErrorKind::Finished, .. }
        ));
        drop(a);
    }

    #[tokio::test]
    async fn stale_detach_is_ignored() {
        let s = running();
        let a = s.attach().unwrap();
        s.detach(a.attach_id + 7);
        assert_eq!(s.state(), SessionState::Attached);
    }

    #[tokio::test]
    async fn dropped_front_end_detaches_on_next_output() {
        let s = running();
        let a = s.attach().unwrap();
        drop(a);
        s.record_output(b"x");
        assert_eq!(s.state(), SessionState::Detached);
    }

    #[tokio::test]
    async fn finished_event_is_delivered_and_exit_code_kept() {
        let s = running();
        let mut a = s.attach().unwrap();
        s.record_exit(3);
        assert!(matches!(
            a.events.recv().await,
            Some(SessionEvent::Finished { exit_code: 3 })
        ));
        assert_eq!(s.wait_finished().await.exit_code, 3);
        assert!(s.wait_attached(Duration::from_millis(1)).await);
    }
}
