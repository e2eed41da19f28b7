//! Error taxonomy for the debugger core.
//!
//! Mirrors the propagation policy in the spec: gateway and pipe errors
//! propagate to the caller, the stack unwinder downgrades a memory-read
//! failure into a truncated walk instead of an error, and the breakpoint
//! engine logs (rather than raises) when it fails to re-arm a breakpoint
//! after a step, since at that point the tracee is already compromised.

use std::fmt;

use thiserror::Error;

/// The single error type returned by every fallible operation in this crate.
#[derive(Debug, Error)]
pub enum DbgError {
    /// A ptrace/waitpid call into the kernel failed.
    #[error("ptrace gateway call failed: {source}")]
    Gateway {
        #[source]
        source: nix::Error,
    },

    /// A command was issued while the tracee was in a state that doesn't
    /// support it (e.g. a register read on a running tracee with
    /// auto-interrupt disabled).
    #[error("invalid state: expected {expected}, found {found}")]
    State { expected: &'static str, found: String },

    /// A hardware breakpoint was requested but all debug-register slots
    /// are already in use.
    #[error("no free hardware breakpoint (debug register) slots")]
    NoDebugSlots,

    /// I/O against a closed tracee pipe.
    #[error("broken pipe: the tracee's end is no longer available")]
    BrokenPipe,

    /// A Pipe Manager read exceeded its budget.
    #[error("timeout reached while waiting for data")]
    Timeout,

    /// A caller-supplied value was invalid (negative byte count, zero
    /// occurrences, etc).
    #[error("invalid value: {message}")]
    Value { message: String },
}

pub type DbgResult<T> = Result<T, DbgError>;

impl From<nix::Error> for DbgError {
    fn from(source: nix::Error) -> Self {
        DbgError::Gateway { source }
    }
}

impl DbgError {
    pub fn state(expected: &'static str, found: impl fmt::Display) -> Self {
        DbgError::State {
            expected,
            found: found.to_string(),
        }
    }

    pub fn value(message: impl Into<String>) -> Self {
        DbgError::Value {
            message: message.into(),
        }
    }
}
