use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which terminal front-end opens attach views for concurrent sessions.
///
/// - `Auto`: pick from the environment (`TMUX`, then `DISPLAY`).
/// - `Tmux`: split the current tmux window.
/// - `Window`: open a new terminal emulator window.
/// - `Headless`: never open a front-end; interactive actions run one at a
///   time without a pty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FrontendKind {
    Auto,
    Tmux,
    Window,
    Headless,
}

impl Default for FrontendKind {
    fn default() -> Self {
        FrontendKind::Auto
    }
}

impl FromStr for FrontendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(FrontendKind::Auto),
            "tmux" => Ok(FrontendKind::Tmux),
            "window" => Ok(FrontendKind::Window),
            "headless" => Ok(FrontendKind::Headless),
            other => Err(format!(
                "invalid frontend: {other} (expected \"auto\", \"tmux\", \"window\" or \"headless\")"
            )),
        }
    }
}

/// Signals an operator can deliver to a running session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    /// Ctrl-C typed into the pty.
    Interrupt,
    Terminate,
    Kill,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SignalKind::Interrupt => "interrupt",
            SignalKind::Terminate => "terminate",
            SignalKind::Kill => "kill",
        };
        f.write_str(s)
    }
}

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct TermSize {
    pub rows: u16,
    pub cols: u16,
}

impl Default for TermSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

impl TermSize {
    /// Size of the controlling terminal, if there is one.
    pub fn current() -> Option<Self> {
        crossterm::terminal::size()
            .ok()
            .map(|(cols, rows)| Self { rows, cols })
    }
}

/// Parse a simple duration string like `"3s"`, `"250ms"`, `"1m"`, `"2h"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| "duration missing unit suffix".to_string())?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{}': {}", num_part, e))?;
    let unit = unit_part.trim().to_lowercase();

    match unit.as_str() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 60 * 60)),
        _ => Err(format!(
            "unsupported duration unit '{}'; expected ms, s, m, or h",
            unit
        )),
    }
}
