//! Parallel executor
//!
//! Each task runs on its own named OS thread. The executor keeps pending
//! and blocked counts so `flush` can return once every unfinished task is
//! waiting on something outside the executor.

use super::executor::{Executor, TaskFn, apply_outcome, safe_invoke};
use super::future::{Future, FutureHandle};
use super::payload::{AsyncPayload, PayloadHooks};
use crate::config::ExecutorKind;
use crate::value::Value;
use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, trace};

pub struct ParallelExecutor {
    shared: Arc<ParallelShared>,
}

struct ParallelShared {
    counts: Mutex<TaskCounts>,
    changed: Condvar,
    poll_interval: Duration,
}

#[derive(Default)]
struct TaskCounts {
    pending: usize,
    blocked: usize,
}

impl ParallelShared {
    fn mark_blocked(&self, blocked: bool) {
        let mut counts = self.counts.lock();
        if blocked {
            counts.blocked += 1;
        } else {
            counts.blocked = counts.blocked.saturating_sub(1);
        }
        self.changed.notify_all();
    }

    fn finish(&self) {
        let mut counts = self.counts.lock();
        counts.pending = counts.pending.saturating_sub(1);
        self.changed.notify_all();
    }
}

impl ParallelExecutor {
    pub fn new(poll_interval: Duration) -> Self {
        ParallelExecutor {
            shared: Arc::new(ParallelShared {
                counts: Mutex::new(TaskCounts::default()),
                changed: Condvar::new(),
                poll_interval,
            }),
        }
    }

    /// Tasks currently inside a blocking wait
    pub fn blocked_count(&self) -> usize {
        self.shared.counts.lock().blocked
    }
}

impl Default for ParallelExecutor {
    fn default() -> Self {
        Self::new(Duration::from_millis(10))
    }
}

impl Executor for ParallelExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Parallel
    }

    fn run(&self, mut body: TaskFn) -> FutureHandle {
        let handle = Future::new();

        let weak_shared: Weak<ParallelShared> = Arc::downgrade(&self.shared);
        let hooks = PayloadHooks {
            resume: None,
            blocking: Some(Arc::new(move |blocked| {
                if let Some(shared) = weak_shared.upgrade() {
                    shared.mark_blocked(blocked);
                }
            })),
        };
        let payload = AsyncPayload::new(handle.clone(), ExecutorKind::Parallel, hooks);

        let weak_payload = Arc::downgrade(&payload);
        handle.set_cancel_hook(Arc::new(move || {
            if let Some(payload) = weak_payload.upgrade() {
                payload.wake();
            }
        }));

        self.shared.counts.lock().pending += 1;

        let shared = self.shared.clone();
        let task_handle = handle.clone();
        let spawned = thread::Builder::new()
            .name(format!("able-task-{}", handle.id()))
            .spawn(move || {
                if task_handle.mark_started() {
                    trace!(task = task_handle.id(), "worker started");
                    let result = safe_invoke(&mut body, &payload);
                    apply_outcome(&task_handle, result);
                }
                shared.finish();
            });

        match spawned {
            Ok(_) => debug!(task = handle.id(), "task spawned on worker thread"),
            Err(err) => {
                error!(task = handle.id(), %err, "failed to spawn worker thread");
                self.shared.finish();
                handle.fail(Value::error(
                    "InternalError",
                    format!("failed to spawn worker thread: {}", err),
                ));
            }
        }
        handle
    }

    fn flush(&self) {
        let mut counts = self.shared.counts.lock();
        while counts.pending > counts.blocked {
            self.shared
                .changed
                .wait_for(&mut counts, self.shared.poll_interval);
        }
    }

    fn pending_count(&self) -> usize {
        self.shared.counts.lock().pending
    }

    fn drive(&self, _handle: &FutureHandle) -> bool {
        false
    }

    fn resume_handle(&self, _handle: &FutureHandle) {}
}
