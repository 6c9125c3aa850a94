//! Cooperative executor
//!
//! Tasks run one at a time on whichever thread drives the queue. A task
//! suspends by returning [`RuntimeError::Yield`]; if it marked itself
//! blocked it is parked until something wakes it, otherwise it goes to the
//! back of the queue. The state lock is never held while a task runs.

use super::executor::{Executor, TaskFn, apply_outcome, safe_invoke};
use super::future::{Future, FutureHandle};
use super::payload::{AsyncPayload, PayloadHooks};
use crate::config::ExecutorKind;
use crate::error::RuntimeError;
use indexmap::IndexMap;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, trace};

pub struct CooperativeExecutor {
    shared: Arc<CoopShared>,
}

struct CoopShared {
    state: Mutex<CoopState>,
    work_ready: Condvar,
    auto_drain: bool,
}

#[derive(Default)]
struct CoopState {
    queue: VecDeque<QueuedTask>,
    /// Parked tasks keyed by future id, in the order they blocked
    blocked: IndexMap<u64, QueuedTask>,
    /// Tasks currently executing a step
    running: usize,
    /// Nesting depth of host-driven synchronous evaluation
    sync_depth: usize,
    /// Explicit flushes in progress; they run tasks even inside a section
    forced: usize,
}

struct QueuedTask {
    handle: FutureHandle,
    payload: Arc<AsyncPayload>,
    body: TaskFn,
}

impl CoopShared {
    fn resume(&self, handle: &FutureHandle) {
        let mut state = self.state.lock();
        if let Some(task) = state.blocked.shift_remove(&handle.id()) {
            trace!(task = handle.id(), "task resumed");
            task.payload.set_blocked(false);
            state.queue.push_back(task);
            self.work_ready.notify_all();
        }
    }

    /// Pop the next runnable task unless synchronous evaluation holds the queue
    fn next_task(&self) -> Option<QueuedTask> {
        let mut state = self.state.lock();
        if state.sync_depth > 0 && state.forced == 0 {
            return None;
        }
        let task = state.queue.pop_front()?;
        state.running += 1;
        Some(task)
    }

    fn run_task(&self, mut task: QueuedTask) {
        if !task.handle.mark_started() {
            self.state.lock().running -= 1;
            return;
        }
        trace!(task = task.handle.id(), "running task step");
        let result = safe_invoke(&mut task.body, &task.payload);
        match result {
            Err(RuntimeError::Yield) => {
                let mut state = self.state.lock();
                state.running -= 1;
                if task.payload.is_blocked() {
                    debug!(task = task.handle.id(), "task blocked");
                    state.blocked.insert(task.handle.id(), task);
                } else {
                    state.queue.push_back(task);
                }
            }
            other => {
                self.state.lock().running -= 1;
                trace!(task = task.handle.id(), "task finished");
                apply_outcome(&task.handle, other);
            }
        }
    }

    fn drain(&self) {
        while let Some(task) = self.next_task() {
            self.run_task(task);
        }
    }
}

impl CooperativeExecutor {
    pub fn new(auto_drain: bool) -> Self {
        CooperativeExecutor {
            shared: Arc::new(CoopShared {
                state: Mutex::new(CoopState::default()),
                work_ready: Condvar::new(),
                auto_drain,
            }),
        }
    }

    /// Tasks parked waiting for an external wakeup
    pub fn blocked_count(&self) -> usize {
        self.shared.state.lock().blocked.len()
    }

    /// Tasks queued and ready to run
    pub fn queued_count(&self) -> usize {
        self.shared.state.lock().queue.len()
    }
}

impl Default for CooperativeExecutor {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Executor for CooperativeExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Cooperative
    }

    fn run(&self, body: TaskFn) -> FutureHandle {
        let handle = Future::new();

        let weak_shared: Weak<CoopShared> = Arc::downgrade(&self.shared);
        let resume_target = handle.clone();
        let hooks = PayloadHooks {
            resume: Some(Arc::new(move || {
                if let Some(shared) = weak_shared.upgrade() {
                    shared.resume(&resume_target);
                }
            })),
            blocking: None,
        };
        let payload = AsyncPayload::new(handle.clone(), ExecutorKind::Cooperative, hooks);

        let weak_payload = Arc::downgrade(&payload);
        handle.set_cancel_hook(Arc::new(move || {
            if let Some(payload) = weak_payload.upgrade() {
                payload.wake();
            }
        }));

        let mut state = self.shared.state.lock();
        state.queue.push_back(QueuedTask {
            handle: handle.clone(),
            payload,
            body,
        });
        debug!(task = handle.id(), queued = state.queue.len(), "task spawned");
        self.shared.work_ready.notify_all();
        handle
    }

    fn flush(&self) {
        self.shared.state.lock().forced += 1;
        self.shared.drain();
        self.shared.state.lock().forced -= 1;
    }

    fn pending_count(&self) -> usize {
        let state = self.shared.state.lock();
        state.queue.len() + state.blocked.len() + state.running
    }

    fn drive(&self, handle: &FutureHandle) -> bool {
        let task = {
            let mut state = self.shared.state.lock();
            let Some(position) = state
                .queue
                .iter()
                .position(|task| task.handle.id() == handle.id())
            else {
                return false;
            };
            let task = state.queue.remove(position);
            if task.is_some() {
                state.running += 1;
            }
            task
        };
        match task {
            Some(task) => {
                self.shared.run_task(task);
                true
            }
            None => false,
        }
    }

    fn resume_handle(&self, handle: &FutureHandle) {
        self.shared.resume(handle);
    }

    fn wait_for_work(&self, timeout: Duration) -> bool {
        let mut state = self.shared.state.lock();
        if state.queue.is_empty() {
            self.shared.work_ready.wait_for(&mut state, timeout);
        }
        !state.queue.is_empty()
    }

    fn begin_synchronous_section(&self) {
        self.shared.state.lock().sync_depth += 1;
    }

    fn end_synchronous_section(&self) {
        let drain = {
            let mut state = self.shared.state.lock();
            state.sync_depth = state.sync_depth.saturating_sub(1);
            state.sync_depth == 0 && self.shared.auto_drain
        };
        if drain {
            self.shared.drain();
        }
    }
}
