// src/engine/mod.rs

//! Dispatch engine.
//!
//! This module ties together:
//! - actions attached to nodes ([`action`]),
//! - the pure execution planner ([`plan`]),
//! - the bound per-cell context actions run in ([`env`]),
//! - operator questions and their headless defaults ([`prompt`]),
//! - the dispatcher that isolates a node, runs the plan and collects one
//!   outcome per cell ([`dispatcher`]).

pub mod action;
pub mod dispatcher;
pub mod env;
pub mod plan;
pub mod prompt;

use crate::errors::FanoutError;
use crate::target::RunOutput;
use crate::tree::CellIndex;

pub use action::{Action, ActionBody, ActionFn, Args, ShellAction};
pub use dispatcher::{DispatchOptions, Dispatcher};
pub use env::Env;
pub use plan::{ExecutionMode, ExecutionPlan, PlanInput, TerminalMode};
pub use prompt::{Prompter, Question, TerminalPrompter};

#[derive(Debug)]
pub enum CellStatus {
    Succeeded(RunOutput),
    Failed(FanoutError),
    /// Stopped by fail-fast or Ctrl-C before it could finish.
    Cancelled,
}

impl CellStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, CellStatus::Succeeded(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, CellStatus::Failed(_))
    }
}

/// Result of one cell, with the targets that produced it.
#[derive(Debug)]
pub struct CellOutcome {
    pub index: CellIndex,
    pub label: String,
    pub targets: Vec<String>,
    pub status: CellStatus,
}

impl CellOutcome {
    pub fn output(&self) -> Option<&str> {
        match &self.status {
            CellStatus::Succeeded(out) => Some(&out.output),
            _ => None,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match &self.status {
            CellStatus::Succeeded(out) => Some(out.exit_code),
            CellStatus::Failed(FanoutError::RemoteExecution {
                failure: crate::errors::RemoteFailure::ExitStatus { code, .. },
                ..
            }) => Some(*code),
            _ => None,
        }
    }
}

/// What an invocation returns: a single outcome for a scalar node or an
/// indexed cell, otherwise one outcome per cell in isolation order.
#[derive(Debug)]
pub enum InvocationResult {
    Single(CellOutcome),
    Array(Vec<CellOutcome>),
}

impl InvocationResult {
    pub fn outcomes(&self) -> &[CellOutcome] {
        match self {
            InvocationResult::Single(one) => std::slice::from_ref(one),
            InvocationResult::Array(all) => all,
        }
    }

    pub fn into_outcomes(self) -> Vec<CellOutcome> {
        match self {
            InvocationResult::Single(one) => vec![one],
            InvocationResult::Array(all) => all,
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &CellOutcome> {
        self.outcomes().iter().filter(|o| !o.status.is_success())
    }

    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }
}
