//! Error types for lowering and execution
//!
//! Non-local control transfer is carried by [`RuntimeError`] variants so the
//! VM, the tree-walker and the executors can tell raised errors, loop
//! signals and the scheduler's yield sentinel apart by type.

use crate::value::{ErrorValue, Str, Value};
use thiserror::Error;

/// Source location carried by AST nodes and instructions (diagnostics only)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceSpan {
    pub line: u32,
    pub column: u32,
}

impl std::fmt::Display for SourceSpan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Failure to lower an AST node into bytecode
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LoweringError {
    /// The node kind has no bytecode lowering; callers fall back to the tree-walker
    #[error("bytecode lowering unsupported: {0}")]
    Unsupported(String),

    #[error("{keyword} statement outside of a loop")]
    OutsideLoop { keyword: &'static str },

    #[error("unknown loop label '{0}'")]
    UnknownLabel(Str),
}

impl LoweringError {
    pub fn unsupported(what: impl Into<String>) -> Self {
        LoweringError::Unsupported(what.into())
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, LoweringError::Unsupported(_))
    }
}

/// Error and control-signal type shared by the VM, the tree-walker and the executors
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    /// Language-level raised error; caught by rescue, ensure and or-else
    #[error("{}", describe_raised(.0))]
    Raise(Value),

    /// Loop exit; resolved against the innermost matching loop frame
    #[error("break outside of loop")]
    Break { label: Option<Str>, value: Value },

    #[error("continue outside of loop")]
    Continue { label: Option<Str> },

    /// Function return (tree-walker only; the VM returns through call frames)
    #[error("return outside of function")]
    Return(Value),

    /// Scheduler sentinel: the current task must stop and be retried later
    #[error("task yield")]
    Yield,

    /// The owning task observed a cancellation request
    #[error("task cancelled")]
    Cancelled,

    /// Invariant violation inside the VM (stack or scope underflow)
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("bytecode lowering failed: {0}")]
    Lowering(#[from] LoweringError),
}

fn describe_raised(value: &Value) -> String {
    match value {
        Value::Error(err) => err.to_string(),
        other => format!("raised {}", other),
    }
}

impl RuntimeError {
    /// Raise a runtime error value with the given kind and message
    pub fn raise(kind: &str, message: impl Into<String>) -> Self {
        RuntimeError::Raise(Value::Error(ErrorValue::new(kind, message).into()))
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::raise("TypeError", message)
    }

    pub fn reference_error(name: &str) -> Self {
        Self::raise("ReferenceError", format!("undefined variable '{}'", name))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        RuntimeError::Internal(message.into())
    }

    /// True for signals that must pass through rescue/ensure handlers untouched
    pub fn is_scheduler_signal(&self) -> bool {
        matches!(self, RuntimeError::Yield)
    }

    /// The raised value, if this is a language-level error
    pub fn raised_value(&self) -> Option<&Value> {
        match self {
            RuntimeError::Raise(value) => Some(value),
            _ => None,
        }
    }

    /// Kind string of a raised error value (e.g. "TypeError")
    pub fn raised_kind(&self) -> Option<Str> {
        match self {
            RuntimeError::Raise(Value::Error(err)) => Some(err.kind.clone()),
            _ => None,
        }
    }
}

/// Invalid runtime configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },
}
