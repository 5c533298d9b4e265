// src/engine/plan.rs

//! Pure execution planning.
//!
//! Given how many cells an invocation addresses and what the action needs,
//! decide how to run it. No IO here; the dispatcher executes the plan.

/// How cells are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// No cells; nothing runs.
    Empty,
    /// Exactly one cell, run in the caller's task.
    Direct,
    /// One cell after the other.
    Sequential,
    /// One task per cell, no terminal.
    ConcurrentHeadless,
    /// One task per cell, each pty command in its own session and front-end.
    ConcurrentInteractive,
}

/// Where pty commands get their terminal from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalMode {
    /// The local controlling terminal is attached in-process.
    Inline,
    /// A multiplexer session per command, shown in a front-end.
    Sessions,
    /// No terminal: no pty, stdin closed, prompts get their default answer.
    Headless,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanInput {
    pub cells: usize,
    pub interactive: bool,
    /// A front-end strategy other than headless, and an attach socket.
    pub frontend_available: bool,
    /// The process has a controlling terminal it may hand to one command.
    pub local_terminal: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub mode: ExecutionMode,
    pub terminal: TerminalMode,
}

pub fn plan(input: PlanInput) -> ExecutionPlan {
    use ExecutionMode::*;

    let (mode, terminal) = match input.cells {
        0 => (Empty, TerminalMode::Headless),
        1 => {
            let terminal = if input.interactive && input.local_terminal {
                TerminalMode::Inline
            } else if input.interactive && input.frontend_available {
                TerminalMode::Sessions
            } else {
                TerminalMode::Headless
            };
            (Direct, terminal)
        }
        _ if !input.interactive => (ConcurrentHeadless, TerminalMode::Headless),
        _ if input.frontend_available => (ConcurrentInteractive, TerminalMode::Sessions),
        _ => (Sequential, TerminalMode::Headless),
    };
    ExecutionPlan { mode, terminal }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(cells: usize, interactive: bool, frontend: bool, tty: bool) -> PlanInput {
        PlanInput {
            cells,
            interactive,
            frontend_available: frontend,
            local_terminal: tty,
        }
    }

    #[test]
    fn empty_runs_nothing() {
        assert_eq!(plan(input(0, true, true, true)).mode, ExecutionMode::Empty);
    }

    #[test]
    fn single_cell_prefers_local_terminal() {
        let p = plan(input(1, true, true, true));
        assert_eq!(p.mode, ExecutionMode::Direct);
        assert_eq!(p.terminal, TerminalMode::Inline);

        let p = plan(input(1, true, true, false));
        assert_eq!(p.terminal, TerminalMode::Sessions);

        let p = plan(input(1, true, false, false));
        assert_eq!(p.terminal, TerminalMode::Headless);

        let p = plan(input(1, false, true, true));
        assert_eq!(p.terminal, TerminalMode::Headless);
    }

    #[test]
    fn many_cells() {
        assert_eq!(
            plan(input(3, false, false, true)),
            ExecutionPlan {
                mode: ExecutionMode::ConcurrentHeadless,
                terminal: TerminalMode::Headless
            }
        );
        assert_eq!(
            plan(input(3, true, true, true)),
            ExecutionPlan {
                mode: ExecutionMode::ConcurrentInteractive,
                terminal: TerminalMode::Sessions
            }
        );
        assert_eq!(
            plan(input(3, true, false, true)),
            ExecutionPlan {
                mode: ExecutionMode::Sequential,
                terminal: TerminalMode::Headless
            }
        );
    }
}
