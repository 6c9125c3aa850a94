//! Execution core for the Able interpreter
//!
//! Lowers a checked AST to bytecode, runs it on a stack VM (falling back to
//! a tree-walker for unsupported constructs) and schedules `spawn`ed tasks on
//! a cooperative or a thread-per-task executor.
//!
//! # Example
//!
//! ```
//! use able_core::{Runtime, Value};
//! use able_core::ast::{BinaryOp, Expression};
//!
//! let runtime = Runtime::new();
//! let expr = Expression::binary(BinaryOp::Add, Expression::int(1), Expression::int(2));
//! assert_eq!(runtime.eval_expression(&expr).ok(), Some(Value::Int(3)));
//! ```

pub mod ast;
pub mod compiler;
pub mod config;
pub mod environment;
pub mod error;
pub mod interpreter;
pub mod runtime;
pub mod value;

pub use config::{ExecMode, ExecutorKind, RuntimeConfig};
pub use error::{ConfigError, LoweringError, RuntimeError};
pub use interpreter::{Interpreter, NativeCall};
pub use value::{CheapClone, Str, Value};

use ast::{Expression, Module};

/// Embedding entry point: an interpreter plus its executor
pub struct Runtime {
    interpreter: Interpreter,
}

impl Runtime {
    /// Runtime with the default configuration (cooperative executor, bytecode)
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Runtime {
            interpreter: Interpreter::new(config),
        }
    }

    /// Runtime configured from defaults plus `ABLE_*` environment overrides
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self::with_config(
            RuntimeConfig::default().with_env_overrides()?,
        ))
    }

    pub fn interpreter(&self) -> &Interpreter {
        &self.interpreter
    }

    pub fn config(&self) -> &RuntimeConfig {
        self.interpreter.config()
    }

    /// Evaluate a module; tasks it spawns are drained when it returns
    /// (cooperative executor with `auto_drain`)
    pub fn eval_module(&self, module: &Module) -> Result<Value, RuntimeError> {
        self.interpreter.evaluate_module(module)
    }

    pub fn eval_expression(&self, expression: &Expression) -> Result<Value, RuntimeError> {
        self.interpreter.evaluate_expression(expression)
    }

    /// Run every runnable task until none can make progress
    pub fn flush(&self) {
        self.interpreter.executor().flush();
    }

    /// Tasks spawned but not yet settled
    pub fn pending_tasks(&self) -> usize {
        self.interpreter.executor().pending_count()
    }

    /// Bind a native function in the global scope
    pub fn define_native<F>(&self, name: &str, arity: Option<usize>, func: F)
    where
        F: Fn(&NativeCall<'_>, &[Value]) -> Result<Value, RuntimeError> + Send + Sync + 'static,
    {
        self.interpreter.define_native(name, arity, func);
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}
