// tests/attach_socket.rs

mod common;

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::SinkExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use common::{FakeTarget, PtyScript, eventually, init_tracing, multiplexer, with_timeout};
use fanout::attach::protocol::ClientCodec;
use fanout::attach::{
    self, AttachOutcome, AttachServer, ClientMessage, DETACH_KEY, Frame, TtyInput,
    attach_in_process, client, discover_sockets, handle_connection, socket_path,
};
use fanout::errors::{AttachErrorKind, FanoutError};
use fanout::fs::RealFileSystem;
use fanout::session::{Session, SessionId, SessionMultiplexer, SessionState};
use fanout::target::{RemoteCommand, TargetHandle};
use fanout::types::{SignalKind, TermSize};

struct Fixture {
    _dir: tempfile::TempDir,
    socket: std::path::PathBuf,
    mux: Arc<SessionMultiplexer>,
    fake: Arc<FakeTarget>,
    session: Arc<Session>,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<fanout::errors::Result<()>>,
}

async fn serve_one_session() -> Fixture {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let socket = socket_path(&dir.path().join("run"), 4242);

    let mux = multiplexer();
    let fake = FakeTarget::new("web1").with_pty(PtyScript::Interactive).handle();
    let handle: TargetHandle = fake.clone();
    let session = mux
        .spawn(&handle, &RemoteCommand::new("bash"), "web[0]", None)
        .await
        .unwrap();

    let server = AttachServer::bind(socket.clone(), Arc::clone(&mux)).unwrap();
    let shutdown = CancellationToken::new();
    let server = tokio::spawn(server.serve(shutdown.clone()));

    Fixture {
        _dir: dir,
        socket,
        mux,
        fake,
        session,
        shutdown,
        server,
    }
}

impl Fixture {
    async fn stop(self) {
        self.mux.shutdown();
        self.shutdown.cancel();
        with_timeout(self.server).await.unwrap().unwrap();
        assert!(!self.socket.exists());
    }
}

#[tokio::test]
async fn socket_is_private_and_discoverable() {
    let fx = serve_one_session().await;

    let mode = std::fs::metadata(&fx.socket).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
    let dir = fx.socket.parent().unwrap();
    let dir_mode = std::fs::metadata(dir).unwrap().permissions().mode();
    assert_eq!(dir_mode & 0o777, 0o700);

    let found = discover_sockets(&RealFileSystem, dir).unwrap();
    assert_eq!(found, vec![fx.socket.clone()]);

    fx.stop().await;
}

#[tokio::test]
async fn lists_sessions_over_the_socket() {
    let fx = serve_one_session().await;

    let sessions = with_timeout(attach::list_sessions(&fx.socket)).await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].id, fx.session.id());
    assert_eq!(sessions[0].target, "web1");
    assert_eq!(sessions[0].label, "web[0]");
    assert_eq!(sessions[0].state, SessionState::Running);

    fx.stop().await;
}

#[tokio::test]
async fn attach_detach_and_reattach_until_exit() {
    let fx = serve_one_session().await;
    let pty = fx.fake.last_pty().unwrap();
    let (_resize_tx, resize_rx) = mpsc::channel::<TermSize>(1);

    // First front-end types a line, then detaches.
    let mut framed = client::connect(&fx.socket).await.unwrap();
    let (mut keyboard, input) = tokio::io::duplex(1024);
    let mut screen = Vec::new();
    let size = Some(TermSize { rows: 30, cols: 100 });
    let (outcome, ()) = with_timeout(async {
        tokio::join!(
            client::bridge(&mut framed, fx.session.id(), size, input, &mut screen, resize_rx),
            async {
                eventually(|| fx.session.state() == SessionState::Attached).await;
                keyboard.write_all(b"uptime\r").await.unwrap();
                eventually(|| pty.input() == b"uptime\r").await;
                keyboard.write_all(&[DETACH_KEY]).await.unwrap();
            }
        )
    })
    .await;
    assert_eq!(outcome.unwrap(), AttachOutcome::Detached);
    eventually(|| fx.session.state() == SessionState::Detached).await;
    assert!(pty.sizes().contains(&TermSize { rows: 30, cols: 100 }));
    drop(framed);

    // Output produced while nobody watches is replayed to the next one.
    pty.print("while detached\r\n");
    eventually(|| String::from_utf8_lossy(&fx.session.output()).contains("while detached")).await;

    let (_resize_tx, resize_rx) = mpsc::channel::<TermSize>(1);
    let mut framed = client::connect(&fx.socket).await.unwrap();
    let (_keyboard, input) = tokio::io::duplex(1024);
    let mut screen = Vec::new();
    let (outcome, ()) = with_timeout(async {
        tokio::join!(
            client::bridge(&mut framed, fx.session.id(), None, input, &mut screen, resize_rx),
            async {
                eventually(|| fx.session.state() == SessionState::Attached).await;
                pty.exit(5);
            }
        )
    })
    .await;
    assert_eq!(outcome.unwrap(), AttachOutcome::Finished(5));
    let seen = String::from_utf8_lossy(&screen);
    assert!(seen.contains("bash"));
    assert!(seen.contains("uptime"));
    assert!(seen.contains("while detached"));

    fx.stop().await;
}

#[tokio::test]
async fn second_frontend_is_refused_while_attached() {
    let fx = serve_one_session().await;
    let _held = fx.session.attach().unwrap();

    let (_resize_tx, resize_rx) = mpsc::channel::<TermSize>(1);
    let mut framed = client::connect(&fx.socket).await.unwrap();
    let (_keyboard, input) = tokio::io::duplex(64);
    let err = with_timeout(client::bridge(
        &mut framed,
        fx.session.id(),
        None,
        input,
        tokio::io::sink(),
        resize_rx,
    ))
    .await
    .unwrap_err();
    assert!(matches!(
        err,
        FanoutError::SessionAttach {
            kind: AttachErrorKind::Busy,
            ..
        }
    ));

    fx.stop().await;
}

#[tokio::test]
async fn signals_are_routed_to_the_session() {
    let fx = serve_one_session().await;

    with_timeout(attach::send_signal(&fx.socket, fx.session.id(), SignalKind::Terminate))
        .await
        .unwrap();
    let out = with_timeout(fx.session.wait_finished()).await;
    assert_eq!(out.exit_code, 143);

    let err = with_timeout(attach::send_signal(&fx.socket, SessionId(999), SignalKind::Kill))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        FanoutError::SessionAttach {
            kind: AttachErrorKind::NotFound,
            ..
        }
    ));

    fx.stop().await;
}

#[tokio::test]
async fn missing_socket_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let err = attach::list_sessions(&dir.path().join("fanout.1.sock"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        FanoutError::SessionAttach {
            kind: AttachErrorKind::SocketMissing,
            ..
        }
    ));
}

#[tokio::test]
async fn live_socket_is_not_stolen_but_stale_one_is_replaced() {
    let fx = serve_one_session().await;

    let err = AttachServer::bind(fx.socket.clone(), multiplexer()).unwrap_err();
    assert!(matches!(
        err,
        FanoutError::SessionAttach {
            kind: AttachErrorKind::Busy,
            ..
        }
    ));

    // A socket file nobody listens on.
    let dir = tempfile::tempdir().unwrap();
    let stale = dir.path().join("fanout.7.sock");
    drop(std::os::unix::net::UnixListener::bind(&stale).unwrap());
    assert!(Path::new(&stale).exists());
    let server = AttachServer::bind(stale.clone(), multiplexer()).unwrap();
    assert_eq!(server.socket_path(), stale.as_path());

    fx.stop().await;
}

#[tokio::test]
async fn client_vanishing_mid_stream_frees_the_session() {
    init_tracing();
    let mux = multiplexer();

    for round in 0..20 {
        let fake = FakeTarget::new(format!("web{round}"))
            .with_pty(PtyScript::Interactive)
            .handle();
        let handle: TargetHandle = fake.clone();
        let session = mux
            .spawn(&handle, &RemoteCommand::new("tail -f app.log"), "web[0]", None)
            .await
            .unwrap();
        let pty = fake.last_pty().unwrap();

        let (client_end, server_end) = tokio::io::duplex(256);
        let server = tokio::spawn(handle_connection(
            server_end,
            Arc::clone(&mux),
            CancellationToken::new(),
        ));
        let mut framed = Framed::new(client_end, ClientCodec::new());
        framed
            .send(Frame::Control(ClientMessage::Attach {
                session_id: session.id(),
                size: None,
            }))
            .await
            .unwrap();
        eventually(|| session.state() == SessionState::Attached).await;

        // Output keeps flowing while the client disappears.
        for i in 0..50 {
            pty.print(&format!("line {i}\r\n"));
        }
        drop(framed);

        let _ = with_timeout(server).await.unwrap();
        assert_eq!(session.state(), SessionState::Detached, "round {round}");
        let again = session.attach().unwrap();
        session.detach(again.attach_id);
        session.kill().unwrap();
    }
}

#[test]
fn inline_attach_returns_without_waiting_for_a_keystroke() {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();
    // Nothing is ever written: a blocking reader would park here forever.
    let (read_end, _write_end) = nix::unistd::pipe().unwrap();

    let outcome = rt.block_on(async {
        let mux = multiplexer();
        let fake = FakeTarget::new("web1").with_pty(PtyScript::Interactive).handle();
        let handle: TargetHandle = fake.clone();
        let session = mux
            .spawn(&handle, &RemoteCommand::new("bash"), "web[0]", None)
            .await
            .unwrap();
        let pty = fake.last_pty().unwrap();
        let input = TtyInput::from_file(std::fs::File::from(read_end)).unwrap();
        let (_resize_tx, resize_rx) = mpsc::channel::<TermSize>(1);

        let (outcome, ()) = with_timeout(async {
            tokio::join!(
                attach_in_process(
                    Arc::clone(&mux),
                    session.id(),
                    None,
                    input,
                    tokio::io::sink(),
                    resize_rx,
                ),
                async {
                    eventually(|| session.state() == SessionState::Attached).await;
                    pty.exit(7);
                }
            )
        })
        .await;
        outcome
    });
    assert_eq!(outcome.unwrap(), AttachOutcome::Finished(7));

    let started = Instant::now();
    rt.shutdown_timeout(Duration::from_secs(5));
    assert!(started.elapsed() < Duration::from_secs(2));
}
