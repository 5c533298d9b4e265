// src/attach/server.rs

//! Attach socket server.
//!
//! One server per `fanout` process. The socket lives in a `0700` directory
//! and is itself `0600`, so only the owning user can attach.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::attach::protocol::{ClientMessage, Frame, ServerCodec, ServerMessage, data_frames};
use crate::errors::{AttachErrorKind, FanoutError, Result};
use crate::session::{Session, SessionEvent, SessionMultiplexer};

pub struct AttachServer {
    socket_path: PathBuf,
    listener: UnixListener,
    multiplexer: Arc<SessionMultiplexer>,
}

impl std::fmt::Debug for AttachServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachServer")
            .field("socket_path", &self.socket_path)
            .finish_non_exhaustive()
    }
}

/// Removes the socket file when dropped.
struct SocketGuard(PathBuf);

impl Drop for SocketGuard {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.0) {
            debug!(socket = %self.0.display(), error = %err, "socket already removed");
        }
    }
}

impl AttachServer {
    /// Bind the socket. Must be called inside a Tokio runtime.
    ///
    /// A leftover socket nobody listens on is replaced; a live one belongs to
    /// another process and is an error.
    pub fn bind(socket_path: impl Into<PathBuf>, multiplexer: Arc<SessionMultiplexer>) -> Result<Self> {
        let socket_path = socket_path.into();
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
            set_mode(parent, 0o700)?;
        }

        if socket_path.exists() {
            if std::os::unix::net::UnixStream::connect(&socket_path).is_ok() {
                return Err(FanoutError::attach(
                    AttachErrorKind::Busy,
                    format!("{} is owned by a running server", socket_path.display()),
                ));
            }
            debug!(socket = %socket_path.display(), "removing stale socket");
            std::fs::remove_file(&socket_path)?;
        }

        let listener = UnixListener::bind(&socket_path)?;
        set_mode(&socket_path, 0o600)?;
        info!(socket = %socket_path.display(), "attach server listening");

        Ok(Self {
            socket_path,
            listener,
            multiplexer,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept connections until `shutdown` fires, then remove the socket.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        let _guard = SocketGuard(self.socket_path.clone());
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => {
                    let (stream, _) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            warn!(error = %err, "accept failed");
                            continue;
                        }
                    };
                    let mux = Arc::clone(&self.multiplexer);
                    let token = shutdown.child_token();
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, mux, token).await {
                            debug!(error = %err, "attach connection ended with error");
                        }
                    });
                }
            }
        }
        info!(socket = %self.socket_path.display(), "attach server stopped");
        Ok(())
    }
}

fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

/// A connection's hold on a session. Dropping it frees the attach slot, so
/// a connection that ends on an error never leaves the session Attached.
struct Binding {
    session: Arc<Session>,
    attach_id: u64,
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl Drop for Binding {
    fn drop(&mut self) {
        self.session.detach(self.attach_id);
    }
}

async fn next_event(binding: &mut Option<Binding>) -> Option<SessionEvent> {
    match binding {
        Some(b) => b.events.recv().await,
        None => std::future::pending().await,
    }
}

fn error_reply(err: &FanoutError) -> ServerMessage {
    match err {
        FanoutError::SessionAttach { kind, message } => ServerMessage::Error {
            kind: *kind,
            message: message.clone(),
        },
        other => ServerMessage::Error {
            kind: AttachErrorKind::Protocol,
            message: other.to_string(),
        },
    }
}

/// Serve one attach connection. Generic over the stream so an in-process
/// duplex pipe can stand in for the socket.
pub async fn handle_connection<S>(
    stream: S,
    multiplexer: Arc<SessionMultiplexer>,
    shutdown: CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, ServerCodec::new());
    let mut binding: Option<Binding> = None;

    let result = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            frame = framed.next() => {
                let frame = match frame {
                    None => break Ok(()),
                    Some(Err(err)) => {
                        let reply = ServerMessage::Error {
                            kind: AttachErrorKind::Protocol,
                            message: err.to_string(),
                        };
                        let _ = framed.send(Frame::Control(reply)).await;
                        break Err(err.into());
                    }
                    Some(Ok(frame)) => frame,
                };
                match frame {
                    Frame::Data(bytes) => {
                        let res = match &binding {
                            Some(b) => b.session.write_input(&bytes),
                            None => Err(FanoutError::attach(
                                AttachErrorKind::Protocol,
                                "input sent while not attached",
                            )),
                        };
                        if let Err(err) = res {
                            framed.send(Frame::Control(error_reply(&err))).await?;
                        }
                    }
                    Frame::Control(msg) => {
                        handle_request(msg, &multiplexer, &mut binding, &mut framed).await?;
                    }
                }
            }
            event = next_event(&mut binding) => {
                match event {
                    Some(SessionEvent::Output(bytes)) => {
                        for frame in data_frames(bytes) {
                            framed.send(frame).await?;
                        }
                    }
                    Some(SessionEvent::Finished { exit_code }) => {
                        if let Some(b) = binding.take() {
                            framed
                                .send(Frame::Control(ServerMessage::Finished {
                                    session_id: b.session.id(),
                                    exit_code,
                                }))
                                .await?;
                        }
                    }
                    None => {
                        binding = None;
                    }
                }
            }
        }
    };

    drop(binding);
    result
}

async fn handle_request<S>(
    msg: ClientMessage,
    multiplexer: &SessionMultiplexer,
    binding: &mut Option<Binding>,
    framed: &mut Framed<S, ServerCodec>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    debug!(request = ?msg, "attach request");
    match msg {
        ClientMessage::ListSessions => {
            let sessions = multiplexer.list();
            framed
                .send(Frame::Control(ServerMessage::Sessions { sessions }))
                .await?;
        }
        ClientMessage::Attach { session_id, size } => {
            *binding = None;
            let attached = multiplexer
                .get(session_id)
                .and_then(|session| session.attach().map(|a| (session, a)));
            match attached {
                Err(err) => {
                    framed.send(Frame::Control(error_reply(&err))).await?;
                }
                Ok((session, attachment)) => {
                    if let Some(size) = size {
                        if let Err(err) = session.resize(size) {
                            warn!(session = %session_id, error = %err, "initial resize failed");
                        }
                    }
                    *binding = Some(Binding {
                        session,
                        attach_id: attachment.attach_id,
                        events: attachment.events,
                    });
                    framed
                        .send(Frame::Control(ServerMessage::Attached { session_id }))
                        .await?;
                    for frame in data_frames(attachment.replay) {
                        framed.send(frame).await?;
                    }
                }
            }
        }
        ClientMessage::Detach => {
            *binding = None;
            framed.send(Frame::Control(ServerMessage::Detached)).await?;
        }
        ClientMessage::Resize { size } => {
            if let Some(b) = binding.as_ref() {
                if let Err(err) = b.session.resize(size) {
                    warn!(session = %b.session.id(), error = %err, "resize failed");
                }
            }
        }
        ClientMessage::Signal { session_id, signal } => {
            let reply = match multiplexer.get(session_id).and_then(|s| s.signal(signal)) {
                Ok(()) => ServerMessage::Ok,
                Err(err) => error_reply(&err),
            };
            framed.send(Frame::Control(reply)).await?;
        }
    }
    Ok(())
}
