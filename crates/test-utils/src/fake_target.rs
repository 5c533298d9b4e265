use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::mpsc;

use futures::future::BoxFuture;
use parking_lot::Mutex;

use fanout::errors::{FanoutError, Result};
use fanout::target::{PtyControl, PtyProcess, PtyWait, RemoteCommand, RunOutput, Target};
use fanout::types::{SignalKind, TermSize};

/// How a pty opened on a [`FakeTarget`] behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtyScript {
    /// Print the command and exit with this code right away.
    ExitWith(i32),
    /// Echo input; exit on a line `exit <code>`, Ctrl-C or a signal.
    Interactive,
}

#[derive(Debug)]
enum Connect {
    Ok,
    Fail,
    Hang,
}

/// A target that never leaves the process.
///
/// - records every command it was asked to run (rendered),
/// - answers `run` from canned responses keyed by substring,
/// - serves pty sessions from a [`PtyScript`],
/// - keeps files in memory.
#[derive(Debug)]
pub struct FakeTarget {
    slug: String,
    connect: Connect,
    script: PtyScript,
    responses: Mutex<Vec<(String, RunOutput)>>,
    commands: Mutex<Vec<String>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    ptys: Mutex<Vec<PtyHandle>>,
}

impl FakeTarget {
    pub fn new(slug: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            connect: Connect::Ok,
            script: PtyScript::ExitWith(0),
            responses: Mutex::new(Vec::new()),
            commands: Mutex::new(Vec::new()),
            files: Mutex::new(HashMap::new()),
            ptys: Mutex::new(Vec::new()),
        }
    }

    pub fn handle(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Commands containing `pattern` return `output`.
    pub fn respond(self, pattern: impl Into<String>, output: RunOutput) -> Self {
        self.responses.lock().push((pattern.into(), output));
        self
    }

    pub fn with_pty(mut self, script: PtyScript) -> Self {
        self.script = script;
        self
    }

    pub fn failing_connect(mut self) -> Self {
        self.connect = Connect::Fail;
        self
    }

    pub fn hanging_connect(mut self) -> Self {
        self.connect = Connect::Hang;
        self
    }

    pub fn add_file(&self, path: &str, contents: impl Into<Vec<u8>>) {
        self.files.lock().insert(path.to_string(), contents.into());
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().get(path).cloned()
    }

    /// Rendered commands, in the order they were started.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    /// The most recently opened pty.
    pub fn last_pty(&self) -> Option<PtyHandle> {
        self.ptys.lock().last().cloned()
    }

    fn answer(&self, rendered: &str) -> RunOutput {
        self.responses
            .lock()
            .iter()
            .find(|(pattern, _)| rendered.contains(pattern.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_else(|| RunOutput::new(0, format!("{}: {rendered}\n", self.slug)))
    }
}

impl Target for FakeTarget {
    fn slug(&self) -> &str {
        &self.slug
    }

    fn connect(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            match self.connect {
                Connect::Ok => Ok(()),
                Connect::Fail => Err(FanoutError::transport(
                    &self.slug,
                    "connect",
                    "connection refused",
                )),
                Connect::Hang => futures::future::pending().await,
            }
        })
    }

    fn run<'a>(
        &'a self,
        command: &'a RemoteCommand,
        _pty: bool,
    ) -> BoxFuture<'a, Result<RunOutput>> {
        Box::pin(async move {
            let rendered = command.render();
            self.commands.lock().push(rendered.clone());
            Ok(self.answer(&rendered))
        })
    }

    fn open_pty(&self, command: &RemoteCommand, size: TermSize) -> Result<PtyProcess> {
        let rendered = command.render();
        self.commands.lock().push(rendered.clone());
        let (process, handle) = scripted_pty(self.script, &format!("{rendered}\r\n"), size);
        self.ptys.lock().push(handle);
        Ok(process)
    }

    fn read_file<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            self.file(path).ok_or_else(|| {
                FanoutError::Other(anyhow::anyhow!("{}: no such file {path}", self.slug))
            })
        })
    }

    fn write_file<'a>(&'a self, path: &'a str, contents: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.add_file(path, contents);
            Ok(())
        })
    }
}

#[derive(Debug)]
struct PtyShared {
    output: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    exit: Mutex<Option<mpsc::Sender<i32>>>,
    line: Mutex<Vec<u8>>,
    input: Mutex<Vec<u8>>,
    sizes: Mutex<Vec<TermSize>>,
    signals: Mutex<Vec<SignalKind>>,
}

impl PtyShared {
    fn emit(&self, bytes: &[u8]) {
        if let Some(tx) = self.output.lock().as_ref() {
            let _ = tx.send(bytes.to_vec());
        }
    }

    /// Close the output stream, then report the exit code.
    fn finish(&self, code: i32) {
        self.output.lock().take();
        if let Some(tx) = self.exit.lock().take() {
            let _ = tx.send(code);
        }
    }

    fn feed(&self, data: &[u8]) {
        self.input.lock().extend_from_slice(data);
        for &b in data {
            match b {
                0x03 => {
                    self.emit(b"^C\r\n");
                    self.finish(130);
                    return;
                }
                b'\r' | b'\n' => {
                    let line = std::mem::take(&mut *self.line.lock());
                    self.emit(b"\r\n");
                    let text = String::from_utf8_lossy(&line);
                    if let Some(code) = text.trim().strip_prefix("exit") {
                        self.finish(code.trim().parse().unwrap_or(0));
                        return;
                    }
                }
                _ => {
                    self.line.lock().push(b);
                    self.emit(&[b]);
                }
            }
        }
    }
}

/// Test-side view of a scripted pty.
#[derive(Debug, Clone)]
pub struct PtyHandle {
    shared: Arc<PtyShared>,
}

impl PtyHandle {
    /// Produce output as if the remote command printed it.
    pub fn print(&self, text: &str) {
        self.shared.emit(text.as_bytes());
    }

    pub fn exit(&self, code: i32) {
        self.shared.finish(code);
    }

    /// Everything written to the pty so far.
    pub fn input(&self) -> Vec<u8> {
        self.shared.input.lock().clone()
    }

    pub fn sizes(&self) -> Vec<TermSize> {
        self.shared.sizes.lock().clone()
    }

    pub fn signals(&self) -> Vec<SignalKind> {
        self.shared.signals.lock().clone()
    }
}

/// Build an in-memory pty process plus a handle to drive it.
fn scripted_pty(script: PtyScript, banner: &str, size: TermSize) -> (PtyProcess, PtyHandle) {
    let (out_tx, out_rx) = mpsc::channel();
    let (exit_tx, exit_rx) = mpsc::channel();
    let shared = Arc::new(PtyShared {
        output: Mutex::new(Some(out_tx)),
        exit: Mutex::new(Some(exit_tx)),
        line: Mutex::new(Vec::new()),
        input: Mutex::new(Vec::new()),
        sizes: Mutex::new(vec![size]),
        signals: Mutex::new(Vec::new()),
    });

    shared.emit(banner.as_bytes());
    if let PtyScript::ExitWith(code) = script {
        shared.finish(code);
    }

    let process = PtyProcess {
        reader: Box::new(ChannelReader {
            rx: out_rx,
            pending: Vec::new(),
        }),
        writer: Box::new(ScriptWriter {
            shared: Arc::clone(&shared),
        }),
        control: Arc::new(ScriptControl {
            shared: Arc::clone(&shared),
        }),
        waiter: Box::new(ScriptWaiter { rx: exit_rx }),
    };
    (process, PtyHandle { shared })
}

struct ChannelReader {
    rx: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv() {
                Ok(chunk) => self.pending = chunk,
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

struct ScriptWriter {
    shared: Arc<PtyShared>,
}

impl Write for ScriptWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.shared.feed(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct ScriptControl {
    shared: Arc<PtyShared>,
}

impl PtyControl for ScriptControl {
    fn resize(&self, size: TermSize) -> Result<()> {
        self.shared.sizes.lock().push(size);
        Ok(())
    }

    fn signal(&self, signal: SignalKind) -> Result<()> {
        self.shared.signals.lock().push(signal);
        let code = match signal {
            SignalKind::Interrupt => 130,
            SignalKind::Terminate => 143,
            SignalKind::Kill => 137,
        };
        self.shared.finish(code);
        Ok(())
    }
}

struct ScriptWaiter {
    rx: mpsc::Receiver<i32>,
}

impl PtyWait for ScriptWaiter {
    fn wait(self: Box<Self>) -> Result<i32> {
        // A dropped sender means the handle went away without an exit.
        Ok(self.rx.recv().unwrap_or(-1))
    }
}
