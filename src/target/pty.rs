// src/target/pty.rs

//! Pty-backed processes.
//!
//! [`PtyProcess`] splits a running pty command into independently owned
//! halves so the session layer can read, write, resize and wait from
//! different tasks. The blocking halves (`reader`, `waiter`) are driven from
//! `spawn_blocking`.

use std::io::{Read, Write};
use std::sync::Arc;

use anyhow::{Context, anyhow};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use parking_lot::Mutex;
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tracing::debug;

use crate::errors::Result;
use crate::target::RunOutput;
use crate::types::{SignalKind, TermSize};

pub trait PtyControl: Send + Sync {
    fn resize(&self, size: TermSize) -> Result<()>;
    fn signal(&self, signal: SignalKind) -> Result<()>;
}

pub trait PtyWait: Send {
    /// Block until the process exits and return its exit code.
    fn wait(self: Box<Self>) -> Result<i32>;
}

pub struct PtyProcess {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub control: Arc<dyn PtyControl>,
    pub waiter: Box<dyn PtyWait>,
}

impl std::fmt::Debug for PtyProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyProcess").finish_non_exhaustive()
    }
}

impl PtyProcess {
    /// Drain the pty until the process exits. Blocking.
    ///
    /// The writer is dropped first, so the command sees end-of-input.
    pub fn collect(self) -> Result<RunOutput> {
        let PtyProcess {
            mut reader,
            writer,
            control: _control,
            waiter,
        } = self;
        drop(writer);

        let mut output = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => output.extend_from_slice(&buf[..n]),
                // Linux reports EIO on the master once the slave side closes.
                Err(_) => break,
            }
        }
        let exit_code = waiter.wait()?;
        Ok(RunOutput::new(
            exit_code,
            String::from_utf8_lossy(&output).into_owned(),
        ))
    }
}

impl From<TermSize> for PtySize {
    fn from(size: TermSize) -> Self {
        PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// Spawn `builder` inside a new native pty.
pub fn spawn_native(builder: CommandBuilder, size: TermSize) -> Result<PtyProcess> {
    let pair = native_pty_system()
        .openpty(size.into())
        .context("failed to create pty")?;

    let child = pair
        .slave
        .spawn_command(builder)
        .context("failed to spawn command in pty")?;
    // Only the child keeps the slave open, so the reader sees EOF on exit.
    drop(pair.slave);

    let killer = child.clone_killer();
    let pid = child.process_id();
    let reader = pair
        .master
        .try_clone_reader()
        .context("failed to clone pty reader")?;
    let writer = pair
        .master
        .take_writer()
        .context("failed to acquire pty writer")?;

    debug!(?pid, rows = size.rows, cols = size.cols, "pty process started");

    Ok(PtyProcess {
        reader,
        writer,
        control: Arc::new(NativeControl {
            master: Mutex::new(pair.master),
            killer: Mutex::new(killer),
            pid,
        }),
        waiter: Box::new(NativeWaiter { child }),
    })
}

struct NativeControl {
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    pid: Option<u32>,
}

impl PtyControl for NativeControl {
    fn resize(&self, size: TermSize) -> Result<()> {
        self.master
            .lock()
            .resize(size.into())
            .context("pty resize failed")?;
        Ok(())
    }

    fn signal(&self, signal: SignalKind) -> Result<()> {
        let Some(pid) = self.pid.and_then(|p| i32::try_from(p).ok()) else {
            self.killer.lock().kill()?;
            return Ok(());
        };
        let sig = match signal {
            SignalKind::Interrupt => Signal::SIGINT,
            SignalKind::Terminate => Signal::SIGTERM,
            SignalKind::Kill => Signal::SIGKILL,
        };
        kill(Pid::from_raw(pid), sig).map_err(|e| anyhow!("sending {sig} to {pid}: {e}"))?;
        Ok(())
    }
}

struct NativeWaiter {
    child: Box<dyn portable_pty::Child + Send + Sync>,
}

impl PtyWait for NativeWaiter {
    fn wait(mut self: Box<Self>) -> Result<i32> {
        let status = self.child.wait().context("waiting for pty process")?;
        Ok(i32::try_from(status.exit_code()).unwrap_or(i32::MAX))
    }
}
