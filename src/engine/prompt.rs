// src/engine/prompt.rs

//! Questions an action asks the operator.
//!
//! Actions call [`Env::input`], [`Env::confirm`] or [`Env::choice`]. Headless
//! cells never block: they get the default answer. Otherwise the question goes
//! to the dispatcher's [`Prompter`], which serialises concurrent cells so two
//! questions never share the terminal.
//!
//! [`Env::input`]: crate::engine::Env::input
//! [`Env::confirm`]: crate::engine::Env::confirm
//! [`Env::choice`]: crate::engine::Env::choice

use futures::future::BoxFuture;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use crate::attach::TtyInput;
use crate::errors::Result;

/// One question, as shown to the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    /// Cell the question comes from, e.g. `web[1]`.
    pub label: String,
    pub prompt: String,
    pub default: String,
    /// Allowed answers; empty for free text.
    pub options: Vec<String>,
}

impl Question {
    pub fn render(&self) -> String {
        let mut line = format!("[{}] {}", self.label, self.prompt);
        if !self.options.is_empty() {
            line.push_str(&format!(" ({})", self.options.join("/")));
        }
        if !self.default.is_empty() {
            line.push_str(&format!(" [{}]", self.default));
        }
        line.push_str(": ");
        line
    }
}

/// Where non-headless questions are answered.
pub trait Prompter: Send + Sync + std::fmt::Debug {
    /// The operator's raw answer, or `None` when nobody can answer (closed
    /// input). An empty answer means "take the default".
    fn ask<'a>(&'a self, question: &'a Question) -> BoxFuture<'a, Result<Option<String>>>;
}

/// Asks on the controlling terminal, one question at a time.
#[derive(Debug, Default)]
pub struct TerminalPrompter {
    turn: Mutex<()>,
}

impl TerminalPrompter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Prompter for TerminalPrompter {
    fn ask<'a>(&'a self, question: &'a Question) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(async move {
            let _turn = self.turn.lock().await;
            let mut err = tokio::io::stderr();
            err.write_all(question.render().as_bytes()).await?;
            err.flush().await?;

            let mut reader = BufReader::new(TtyInput::open()?);
            let mut line = String::new();
            if reader.read_line(&mut line).await? == 0 {
                return Ok(None);
            }
            Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
        })
    }
}

/// Interpret a yes/no answer. `None` for anything else.
pub fn parse_confirm(answer: &str) -> Option<bool> {
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Some(true),
        "n" | "no" => Some(false),
        _ => None,
    }
}
