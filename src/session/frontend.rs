// src/session/frontend.rs

//! Terminal front-ends for concurrent sessions.
//!
//! A front-end is a new tmux pane or terminal window running
//! `fanout attach --socket <path> --session <id>`. Which one is used is a
//! strategy chosen once per run from the environment.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use futures::future::BoxFuture;
use tokio::process::Command;
use tracing::{debug, info};

use crate::errors::{FanoutError, Result};
use crate::session::state::SessionId;
use crate::types::FrontendKind;

/// What to show in a new front-end.
#[derive(Debug, Clone)]
pub struct FrontendRequest {
    pub socket: PathBuf,
    pub session: SessionId,
    pub title: String,
    /// Give the new pane keyboard focus.
    pub focus: bool,
}

impl FrontendRequest {
    /// Argument vector of the attach client for this request.
    pub fn attach_argv(&self) -> Result<Vec<String>> {
        let exe = std::env::current_exe().context("locating the fanout executable")?;
        Ok(vec![
            exe.display().to_string(),
            "attach".to_string(),
            "--socket".to_string(),
            self.socket.display().to_string(),
            "--session".to_string(),
            self.session.to_string(),
        ])
    }

    /// The attach command as one shell line, for panes and log messages.
    pub fn attach_line(&self) -> Result<String> {
        let argv = self.attach_argv()?;
        shlex::try_join(argv.iter().map(String::as_str))
            .map_err(|e| FanoutError::Other(anyhow::anyhow!("quoting attach command: {e}")))
    }
}

pub trait FrontendStrategy: Send + Sync + fmt::Debug {
    fn kind(&self) -> FrontendKind;

    /// Open a front-end for the request. Returns once it was launched, not
    /// once it attached.
    fn open<'a>(&'a self, request: &'a FrontendRequest) -> BoxFuture<'a, Result<()>>;
}

/// Split the current tmux window and re-tile.
#[derive(Debug, Default)]
pub struct TmuxFrontend;

impl FrontendStrategy for TmuxFrontend {
    fn kind(&self) -> FrontendKind {
        FrontendKind::Tmux
    }

    fn open<'a>(&'a self, request: &'a FrontendRequest) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let line = request.attach_line()?;
            let mut split = Command::new("tmux");
            split.arg("split-window");
            if !request.focus {
                split.arg("-d");
            }
            split.arg(&line);
            run_launcher(split, "tmux split-window").await?;

            let mut tile = Command::new("tmux");
            tile.args(["select-layout", "tiled"]);
            run_launcher(tile, "tmux select-layout").await?;

            debug!(session = %request.session, "opened tmux pane");
            Ok(())
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalProgram {
    GnomeTerminal,
    Xterm,
}

/// Open a new terminal emulator window.
#[derive(Debug)]
pub struct WindowFrontend {
    program: TerminalProgram,
}

impl WindowFrontend {
    pub fn new(program: TerminalProgram) -> Self {
        Self { program }
    }
}

impl FrontendStrategy for WindowFrontend {
    fn kind(&self) -> FrontendKind {
        FrontendKind::Window
    }

    fn open<'a>(&'a self, request: &'a FrontendRequest) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let argv = request.attach_argv()?;
            let mut cmd = match self.program {
                TerminalProgram::GnomeTerminal => {
                    let mut c = Command::new("gnome-terminal");
                    c.arg("--title").arg(&request.title).arg("--");
                    c
                }
                TerminalProgram::Xterm => {
                    let mut c = Command::new("xterm");
                    c.arg("-T").arg(&request.title).arg("-e");
                    c
                }
            };
            cmd.args(&argv);
            // The window outlives this call; don't wait for it.
            cmd.stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null());
            cmd.spawn()
                .with_context(|| format!("launching {:?} window", self.program))?;
            debug!(session = %request.session, program = ?self.program, "opened terminal window");
            Ok(())
        })
    }
}

/// No front-end available.
#[derive(Debug, Default)]
pub struct HeadlessFrontend;

impl FrontendStrategy for HeadlessFrontend {
    fn kind(&self) -> FrontendKind {
        FrontendKind::Headless
    }

    fn open<'a>(&'a self, request: &'a FrontendRequest) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let line = request.attach_line()?;
            info!(session = %request.session, "no front-end available; attach with: {line}");
            Ok(())
        })
    }
}

async fn run_launcher(mut cmd: Command, what: &str) -> Result<()> {
    let out = cmd
        .output()
        .await
        .with_context(|| format!("running {what}"))?;
    if !out.status.success() {
        return Err(FanoutError::Other(anyhow::anyhow!(
            "{what} failed: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }
    Ok(())
}

/// Pick a front-end strategy from the process environment.
pub fn detect(kind: FrontendKind) -> Arc<dyn FrontendStrategy> {
    detect_with(kind, |key| std::env::var(key).ok())
}

/// `detect` with an explicit environment lookup.
///
/// `Auto` prefers tmux (`TMUX` set), then a graphical terminal (`DISPLAY`
/// set; gnome-terminal if `COLORTERM` says so, else xterm).
pub fn detect_with(
    kind: FrontendKind,
    env: impl Fn(&str) -> Option<String>,
) -> Arc<dyn FrontendStrategy> {
    let has = |key: &str| env(key).is_some_and(|v| !v.is_empty());
    let window = || {
        if env("COLORTERM").as_deref() == Some("gnome-terminal") {
            TerminalProgram::GnomeTerminal
        } else {
            TerminalProgram::Xterm
        }
    };

    match kind {
        FrontendKind::Headless => Arc::new(HeadlessFrontend),
        FrontendKind::Tmux => Arc::new(TmuxFrontend),
        FrontendKind::Window => Arc::new(WindowFrontend::new(window())),
        FrontendKind::Auto if has("TMUX") => Arc::new(TmuxFrontend),
        FrontendKind::Auto if has("DISPLAY") => Arc::new(WindowFrontend::new(window())),
        FrontendKind::Auto => Arc::new(HeadlessFrontend),
    }
}
