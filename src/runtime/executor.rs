//! Executor contract shared by the cooperative and parallel schedulers

use super::future::FutureHandle;
use super::payload::AsyncPayload;
use crate::config::ExecutorKind;
use crate::error::RuntimeError;
use crate::value::{ErrorValue, Value};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// A task body. Cooperative tasks are invoked repeatedly until they stop
/// returning [`RuntimeError::Yield`].
pub type TaskFn = Box<dyn FnMut(&Arc<AsyncPayload>) -> Result<Value, RuntimeError> + Send>;

pub trait Executor: Send + Sync {
    fn kind(&self) -> ExecutorKind;

    /// Create a future and schedule `task` to settle it
    fn run(&self, task: TaskFn) -> FutureHandle;

    /// Run until no task is both pending and unblocked
    fn flush(&self);

    /// Tasks that have not settled yet
    fn pending_count(&self) -> usize;

    /// Run the given task once on the caller's thread, if the executor
    /// supports it and the task is queued
    fn drive(&self, handle: &FutureHandle) -> bool;

    /// Requeue a blocked task
    fn resume_handle(&self, handle: &FutureHandle);

    /// Wait up to `timeout` for new runnable work; returns whether any arrived
    fn wait_for_work(&self, _timeout: Duration) -> bool {
        false
    }

    fn begin_synchronous_section(&self) {}

    fn end_synchronous_section(&self) {}
}

/// Run one step of a task, converting a host panic into a failure
pub(crate) fn safe_invoke(
    task: &mut TaskFn,
    payload: &Arc<AsyncPayload>,
) -> Result<Value, RuntimeError> {
    match panic::catch_unwind(AssertUnwindSafe(|| task(payload))) {
        Ok(result) => result,
        Err(panic) => {
            let message = panic_message(panic);
            warn!(task = payload.handle().id(), %message, "task panicked");
            Err(RuntimeError::raise("Panic", message))
        }
    }
}

pub(crate) fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}

/// Settle `handle` from a finished task step (anything but `Yield`)
pub(crate) fn apply_outcome(handle: &FutureHandle, result: Result<Value, RuntimeError>) {
    match result {
        Ok(value) | Err(RuntimeError::Return(value)) => {
            handle.resolve(value);
        }
        Err(RuntimeError::Cancelled) => {
            handle.cancel(None);
        }
        Err(RuntimeError::Raise(value)) => {
            handle.fail(ErrorValue::wrap(value));
        }
        Err(RuntimeError::Yield) => {
            handle.fail(Value::error(
                "InternalError",
                "task yielded outside of a cooperative executor",
            ));
        }
        Err(other @ (RuntimeError::Break { .. } | RuntimeError::Continue { .. })) => {
            handle.fail(Value::error("SyntaxError", other.to_string()));
        }
        Err(other) => {
            handle.fail(Value::error("InternalError", other.to_string()));
        }
    }
}
