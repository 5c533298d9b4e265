// src/attach/client.rs

//! Attach socket client: the `fanout attach` front-end and the small
//! request/response helpers used by `fanout sessions` and `fanout signal`.

use std::io;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::attach::protocol::{ClientCodec, ClientMessage, DETACH_KEY, Frame, ServerMessage};
use crate::attach::server::handle_connection;
use crate::attach::tty::TtyInput;
use crate::errors::{AttachErrorKind, FanoutError, Result};
use crate::session::{SessionId, SessionMultiplexer, SessionSummary};
use crate::types::{SignalKind, TermSize};

/// How an attach ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    Finished(i32),
    Detached,
}

pub type ClientFramed<S> = Framed<S, ClientCodec>;

/// Open the attach socket.
pub async fn connect(socket: &Path) -> Result<ClientFramed<UnixStream>> {
    match UnixStream::connect(socket).await {
        Ok(stream) => Ok(Framed::new(stream, ClientCodec::new())),
        Err(err) => {
            let kind = match err.kind() {
                io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => {
                    AttachErrorKind::SocketMissing
                }
                io::ErrorKind::PermissionDenied => AttachErrorKind::PermissionDenied,
                _ => return Err(err.into()),
            };
            Err(FanoutError::attach(
                kind,
                format!("{}: {err}", socket.display()),
            ))
        }
    }
}

/// Send one request and wait for its control reply. Data frames are skipped.
async fn request<S>(framed: &mut ClientFramed<S>, msg: ClientMessage) -> Result<ServerMessage>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    framed.send(Frame::Control(msg)).await?;
    loop {
        match framed.next().await {
            None => {
                return Err(FanoutError::attach(
                    AttachErrorKind::Protocol,
                    "server closed the connection",
                ));
            }
            Some(Err(err)) => return Err(err.into()),
            Some(Ok(Frame::Data(_))) => continue,
            Some(Ok(Frame::Control(ServerMessage::Error { kind, message }))) => {
                return Err(FanoutError::attach(kind, message));
            }
            Some(Ok(Frame::Control(reply))) => return Ok(reply),
        }
    }
}

fn unexpected(reply: &ServerMessage) -> FanoutError {
    FanoutError::attach(
        AttachErrorKind::Protocol,
        format!("unexpected reply {reply:?}"),
    )
}

pub async fn list_sessions(socket: &Path) -> Result<Vec<SessionSummary>> {
    let mut framed = connect(socket).await?;
    match request(&mut framed, ClientMessage::ListSessions).await? {
        ServerMessage::Sessions { sessions } => Ok(sessions),
        other => Err(unexpected(&other)),
    }
}

pub async fn send_signal(socket: &Path, session_id: SessionId, signal: SignalKind) -> Result<()> {
    let mut framed = connect(socket).await?;
    match request(&mut framed, ClientMessage::Signal { session_id, signal }).await? {
        ServerMessage::Ok => Ok(()),
        other => Err(unexpected(&other)),
    }
}

/// Attach to `session_id` and pump bytes both ways until the session
/// finishes or the user presses the detach key.
///
/// Input after the detach key in the same read is dropped.
pub async fn bridge<S, I, O>(
    framed: &mut ClientFramed<S>,
    session_id: SessionId,
    size: Option<TermSize>,
    mut input: I,
    mut output: O,
    mut resize: mpsc::Receiver<TermSize>,
) -> Result<AttachOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    match request(framed, ClientMessage::Attach { session_id, size }).await? {
        ServerMessage::Attached { .. } => {}
        other => return Err(unexpected(&other)),
    }
    debug!(session = %session_id, "attached");

    let mut buf = vec![0u8; 4096];
    let mut input_open = true;
    let mut detaching = false;

    loop {
        tokio::select! {
            frame = framed.next() => match frame {
                None => {
                    return Err(FanoutError::attach(
                        AttachErrorKind::Protocol,
                        "server closed the connection",
                    ));
                }
                Some(Err(err)) => return Err(err.into()),
                Some(Ok(Frame::Data(bytes))) => {
                    if !detaching {
                        output.write_all(&bytes).await?;
                        output.flush().await?;
                    }
                }
                Some(Ok(Frame::Control(msg))) => match msg {
                    ServerMessage::Finished { exit_code, .. } => {
                        return Ok(AttachOutcome::Finished(exit_code));
                    }
                    ServerMessage::Detached => return Ok(AttachOutcome::Detached),
                    ServerMessage::Error { kind, message } => {
                        return Err(FanoutError::attach(kind, message));
                    }
                    other => debug!(reply = ?other, "ignoring control message"),
                },
            },
            n = input.read(&mut buf), if input_open && !detaching => {
                let n = n?;
                if n == 0 {
                    input_open = false;
                    continue;
                }
                let chunk = &buf[..n];
                let (data, detach) = match chunk.iter().position(|b| *b == DETACH_KEY) {
                    Some(pos) => (&chunk[..pos], true),
                    None => (chunk, false),
                };
                if !data.is_empty() {
                    framed.send(Frame::Data(Bytes::copy_from_slice(data))).await?;
                }
                if detach {
                    detaching = true;
                    framed.send(Frame::Control(ClientMessage::Detach)).await?;
                }
            }
            Some(size) = resize.recv() => {
                framed.send(Frame::Control(ClientMessage::Resize { size })).await?;
            }
        }
    }
}

/// Restores cooked mode when dropped.
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> Result<Self> {
        crossterm::terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(err) = crossterm::terminal::disable_raw_mode() {
            warn!(error = %err, "failed to restore terminal mode");
        }
    }
}

/// Forward SIGWINCH as terminal sizes until the receiver is dropped.
fn spawn_resize_forwarder() -> Result<mpsc::Receiver<TermSize>> {
    use tokio::signal::unix::{SignalKind as UnixSignal, signal};

    let (tx, rx) = mpsc::channel(4);
    let mut winch = signal(UnixSignal::window_change())?;
    tokio::spawn(async move {
        while winch.recv().await.is_some() {
            let Some(size) = TermSize::current() else {
                continue;
            };
            if tx.send(size).await.is_err() {
                break;
            }
        }
    });
    Ok(rx)
}

/// `fanout attach`: bridge the controlling terminal to a session behind
/// `socket`.
pub async fn attach_terminal(socket: &Path, session_id: SessionId) -> Result<AttachOutcome> {
    let mut framed = connect(socket).await?;
    let input = TtyInput::open()?;
    let resize = spawn_resize_forwarder()?;
    let _raw = RawModeGuard::enable()?;
    bridge(
        &mut framed,
        session_id,
        TermSize::current(),
        input,
        tokio::io::stdout(),
        resize,
    )
    .await
}

/// Attach the controlling terminal to a session of this process without going
/// through the socket. Used when a single interactive command runs inline.
pub async fn attach_local(
    multiplexer: Arc<SessionMultiplexer>,
    session_id: SessionId,
) -> Result<AttachOutcome> {
    let input = TtyInput::open()?;
    let resize = spawn_resize_forwarder()?;
    let _raw = RawModeGuard::enable()?;
    attach_in_process(
        multiplexer,
        session_id,
        TermSize::current(),
        input,
        tokio::io::stdout(),
        resize,
    )
    .await
}

/// Serve one connection over an in-memory pipe and bridge `input`/`output`
/// to it. Returns as soon as the session finishes or is detached; nothing
/// keeps reading `input` afterwards.
pub async fn attach_in_process<I, O>(
    multiplexer: Arc<SessionMultiplexer>,
    session_id: SessionId,
    size: Option<TermSize>,
    input: I,
    output: O,
    resize: mpsc::Receiver<TermSize>,
) -> Result<AttachOutcome>
where
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let (client_end, server_end) = tokio::io::duplex(64 * 1024);
    let token = CancellationToken::new();
    let server = tokio::spawn(handle_connection(server_end, multiplexer, token.clone()));

    let mut framed = Framed::new(client_end, ClientCodec::new());
    let outcome = bridge(&mut framed, session_id, size, input, output, resize).await;
    drop(framed);

    token.cancel();
    if let Err(err) = server.await {
        warn!(error = %err, "local attach task failed");
    }
    outcome
}
