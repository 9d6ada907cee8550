//! Error types for the interpreter core.
//!
//! The taxonomy separates four concerns:
//!
//! - script-level exceptions ([`VmError::Thrown`]) routed through the
//!   per-function exception table and fully recoverable by a `catch` handler;
//! - engine-fatal conditions (`StackOverflow`, `CorruptBytecode`) that are
//!   never delivered to a `catch` clause;
//! - the interrupt raised by an external observer, which runs `finally`
//!   blocks during unwind but cannot be swallowed by user code;
//! - generator-protocol faults, a dedicated kind distinct from script throws.

use crate::value::Value;
use thiserror::Error;

/// Main error type for the interpreter core.
#[derive(Debug, Error)]
pub enum VmError {
    /// A value thrown by script code. The only variant a `catch` handler
    /// may observe.
    #[error("uncaught exception: {}", value.type_name())]
    Thrown { value: Value },

    #[error("TypeError: {message}")]
    TypeError { message: String },

    #[error("ReferenceError: {name} is not defined")]
    ReferenceError { name: String },

    /// Call-depth limit exceeded. Fatal: propagates past `catch` clauses,
    /// but `finally` blocks already entered still run during unwind.
    #[error("stack overflow: call depth limit of {limit} exceeded")]
    StackOverflow { limit: usize },

    /// Execution aborted by the external interrupt handle or the
    /// instruction budget. Runs `finally` blocks, skips `catch`.
    #[error("execution interrupted")]
    Interrupted,

    /// Malformed bytecode. The exception table cannot be trusted at this
    /// point, so unwinding is skipped entirely.
    #[error("corrupt bytecode: {message}")]
    CorruptBytecode { message: String },

    /// Misuse of the generator protocol.
    #[error("generator protocol violation: {0}")]
    Generator(#[from] GeneratorFault),
}

/// Generator-protocol faults.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GeneratorFault {
    /// A `finally` block attempted to yield while the generator was being
    /// closed by `return()`.
    #[error("yield from closing generator")]
    YieldFromClosing,

    /// `next`/`return`/`throw` called on a generator that is currently
    /// executing (re-entrant resume of a live frame).
    #[error("generator is already running")]
    AlreadyRunning,
}

impl VmError {
    pub fn thrown(value: Value) -> Self {
        VmError::Thrown { value }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        VmError::TypeError {
            message: message.into(),
        }
    }

    pub fn reference_error(name: impl Into<String>) -> Self {
        VmError::ReferenceError { name: name.into() }
    }

    pub fn corrupt(message: impl Into<String>) -> Self {
        VmError::CorruptBytecode {
            message: message.into(),
        }
    }

    /// Whether a user `catch` clause may observe this error.
    ///
    /// `TypeError`/`ReferenceError` raised by opcodes behave as script
    /// exceptions: user code can catch them.
    pub fn is_catchable(&self) -> bool {
        matches!(
            self,
            VmError::Thrown { .. } | VmError::TypeError { .. } | VmError::ReferenceError { .. }
        )
    }

    /// Whether `finally` blocks should still run while this error unwinds.
    ///
    /// Only corrupt bytecode skips them: the exception table itself is
    /// suspect there.
    pub fn runs_finally(&self) -> bool {
        !matches!(self, VmError::CorruptBytecode { .. })
    }

    /// The script-visible value for this error, as delivered to a `catch`
    /// clause.
    pub fn to_value(&self) -> Value {
        match self {
            VmError::Thrown { value } => value.clone(),
            VmError::TypeError { message } => Value::from_string(format!("TypeError: {message}")),
            VmError::ReferenceError { name } => {
                Value::from_string(format!("ReferenceError: {name} is not defined"))
            }
            other => Value::from_string(other.to_string()),
        }
    }
}
