//! Debugger-wide configuration.
//!
//! Modeled on the teacher's `flags.rs`: a plain struct behind a builder,
//! not a CLI or file format (parsing a config file or argv is the
//! user-facing façade's job, out of scope here).

use std::collections::HashSet;
use std::time::Duration;

use nix::sys::signal::Signal;

/// Which heuristic `finish` uses to run until the current function returns.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum FinishHeuristic {
    /// Unwind once up front, plant a transient breakpoint at the caller's
    /// return address.
    Backtrace,
    /// Single-step, tracking a CALL/RET nesting counter.
    StepMode,
}

/// Tunables that shape how the Control Loop and Pipe Manager behave.
#[derive(Clone, Debug)]
pub struct DebuggerConfig {
    /// When true, a read command issued while the tracee is `Running`
    /// performs a group-stop first, serves the read, then resumes.
    pub auto_interrupt_on_command: bool,
    /// Signals in this set are consumed rather than forwarded to the
    /// tracee on the next resume.
    pub suppressed_signals: HashSet<Signal>,
    /// Default timeout for Pipe Manager reads when the caller doesn't
    /// specify one.
    pub default_pipe_timeout: Duration,
    /// Which `finish` heuristic to use when the caller doesn't pick one.
    pub default_finish_heuristic: FinishHeuristic,
    /// Upper bound on `step_until`'s loop when the caller passes `None`.
    pub default_max_steps: u32,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        DebuggerConfig {
            auto_interrupt_on_command: true,
            suppressed_signals: HashSet::new(),
            default_pipe_timeout: Duration::from_secs(2),
            default_finish_heuristic: FinishHeuristic::Backtrace,
            default_max_steps: 1_000_000,
        }
    }
}

impl DebuggerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_auto_interrupt(mut self, on: bool) -> Self {
        self.auto_interrupt_on_command = on;
        self
    }

    pub fn suppress_signal(mut self, sig: Signal) -> Self {
        self.suppressed_signals.insert(sig);
        self
    }

    pub fn is_suppressed(&self, sig: Signal) -> bool {
        self.suppressed_signals.contains(&sig)
    }

    pub fn with_pipe_timeout(mut self, timeout: Duration) -> Self {
        self.default_pipe_timeout = timeout;
        self
    }

    pub fn with_finish_heuristic(mut self, h: FinishHeuristic) -> Self {
        self.default_finish_heuristic = h;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_auto_interrupts_and_uses_backtrace_finish() {
        let cfg = DebuggerConfig::default();
        assert!(cfg.auto_interrupt_on_command);
        assert_eq!(cfg.default_finish_heuristic, FinishHeuristic::Backtrace);
        assert!(cfg.suppressed_signals.is_empty());
    }

    #[test]
    fn suppress_signal_marks_it_as_suppressed() {
        let cfg = DebuggerConfig::new().suppress_signal(Signal::SIGWINCH);
        assert!(cfg.is_suppressed(Signal::SIGWINCH));
        assert!(!cfg.is_suppressed(Signal::SIGINT));
    }

    #[test]
    fn builder_methods_chain() {
        let cfg = DebuggerConfig::new()
            .with_auto_interrupt(false)
            .with_pipe_timeout(Duration::from_millis(500))
            .with_finish_heuristic(FinishHeuristic::StepMode);
        assert!(!cfg.auto_interrupt_on_command);
        assert_eq!(cfg.default_pipe_timeout, Duration::from_millis(500));
        assert_eq!(cfg.default_finish_heuristic, FinishHeuristic::StepMode);
    }
}
