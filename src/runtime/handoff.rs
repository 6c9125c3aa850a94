//! Thread-backed resumption for evaluators that keep their state on the
//! native stack
//!
//! The tree-walker cannot save its position the way the VM does, so a
//! cooperative task running on it gets its own thread. At a suspension point
//! the thread reports back to the executor and parks until the executor runs
//! the task again. Exactly one side runs at any time, so the cooperative
//! executor still sees one task step at a time.

use super::executor::panic_message;
use super::payload::AsyncPayload;
use crate::error::RuntimeError;
use crate::value::Value;
use crossbeam::channel::{self, Receiver, Sender};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use tracing::trace;

pub type HandoffBody = Box<dyn FnOnce(Arc<AsyncPayload>) -> Result<Value, RuntimeError> + Send>;

enum Step {
    Suspended,
    Finished(Result<Value, RuntimeError>),
}

/// The task thread's end of the handoff, reachable through the payload
pub(crate) struct Parker {
    step_tx: Sender<Step>,
    resume_rx: Receiver<()>,
}

impl Parker {
    /// Hand control back to the executor and wait to be run again
    pub(crate) fn park(&self) -> Result<(), RuntimeError> {
        self.step_tx.send(Step::Suspended).map_err(|_| abandoned())?;
        self.resume_rx.recv().map_err(|_| abandoned())
    }
}

/// Internal errors skip ensure cleanups, so a dropped task unwinds without
/// running more user code
fn abandoned() -> RuntimeError {
    RuntimeError::internal("suspended task was dropped by its executor")
}

/// The executor's end: each `step` runs the body until it parks or finishes
pub struct HandoffTask {
    body: Option<HandoffBody>,
    parker: Option<Parker>,
    resume_tx: Sender<()>,
    step_rx: Receiver<Step>,
}

impl HandoffTask {
    pub fn new(body: HandoffBody) -> Self {
        let (resume_tx, resume_rx) = channel::bounded(1);
        let (step_tx, step_rx) = channel::bounded(1);
        HandoffTask {
            body: Some(body),
            parker: Some(Parker { step_tx, resume_rx }),
            resume_tx,
            step_rx,
        }
    }

    /// Start or resume the body; `Err(Yield)` when it parked again
    pub fn step(&mut self, payload: &Arc<AsyncPayload>) -> Result<Value, RuntimeError> {
        match self.body.take() {
            Some(body) => self.start(payload, body)?,
            None => self
                .resume_tx
                .send(())
                .map_err(|_| RuntimeError::internal("task thread already exited"))?,
        }
        match self.step_rx.recv() {
            Ok(Step::Suspended) => Err(RuntimeError::Yield),
            Ok(Step::Finished(result)) => result,
            Err(_) => Err(RuntimeError::internal("task thread exited without a result")),
        }
    }

    fn start(&mut self, payload: &Arc<AsyncPayload>, body: HandoffBody) -> Result<(), RuntimeError> {
        let parker = self
            .parker
            .take()
            .ok_or_else(|| RuntimeError::internal("task thread already started"))?;
        let step_tx = parker.step_tx.clone();
        payload.set_parker(parker);

        let task_payload = payload.clone();
        let id = payload.handle().id();
        thread::Builder::new()
            .name(format!("able-walker-{}", id))
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| body(task_payload)))
                    .unwrap_or_else(|panic| Err(RuntimeError::raise("Panic", panic_message(panic))));
                trace!(task = id, "task thread finished");
                let _ = step_tx.send(Step::Finished(result));
            })
            .map(|_| ())
            .map_err(|err| RuntimeError::internal(format!("failed to start task thread: {}", err)))
    }
}
