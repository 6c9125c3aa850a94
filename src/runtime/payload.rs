//! Per-task async context
//!
//! The payload rides on the task's root environment so natives and the
//! await evaluator can find the owning future without changing the calling
//! convention.

use super::await_eval::AwaitEvalState;
use super::channel::ChannelWait;
use super::future::FutureHandle;
use super::handoff::Parker;
use crate::ast::NodeId;
use crate::config::ExecutorKind;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Callbacks the owning executor installs on a payload
#[derive(Clone, Default)]
pub struct PayloadHooks {
    /// Cooperative mode: move the task from the blocked table back to the queue
    pub resume: Option<Arc<dyn Fn() + Send + Sync>>,
    /// Parallel mode: report entering (`true`) or leaving a blocking wait
    pub blocking: Option<Arc<dyn Fn(bool) + Send + Sync>>,
}

pub struct AsyncPayload {
    handle: FutureHandle,
    kind: ExecutorKind,
    blocked: AtomicBool,
    yielded: AtomicBool,
    await_states: Mutex<FxHashMap<NodeId, Arc<Mutex<AwaitEvalState>>>>,
    channel_waits: Mutex<FxHashMap<u64, ChannelWait>>,
    /// Futures this task already registered a wake-up with
    future_waits: Mutex<FxHashSet<u64>>,
    /// Set when the task runs on its own thread and suspends by parking
    parker: Mutex<Option<Arc<Parker>>>,
    hooks: PayloadHooks,
}

impl AsyncPayload {
    pub fn new(handle: FutureHandle, kind: ExecutorKind, hooks: PayloadHooks) -> Arc<Self> {
        Arc::new(AsyncPayload {
            handle,
            kind,
            blocked: AtomicBool::new(false),
            yielded: AtomicBool::new(false),
            await_states: Mutex::new(FxHashMap::default()),
            channel_waits: Mutex::new(FxHashMap::default()),
            future_waits: Mutex::new(FxHashSet::default()),
            parker: Mutex::new(None),
            hooks,
        })
    }

    pub fn handle(&self) -> &FutureHandle {
        &self.handle
    }

    pub fn kind(&self) -> ExecutorKind {
        self.kind
    }

    pub fn cancel_requested(&self) -> bool {
        self.handle.cancel_requested()
    }

    /// True while the task waits for an external event; the cooperative
    /// executor parks blocked tasks instead of requeuing them
    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::SeqCst)
    }

    pub fn set_blocked(&self, blocked: bool) {
        self.blocked.store(blocked, Ordering::SeqCst);
    }

    /// Clear the blocked flag and ask the executor to run the task again
    pub fn wake(&self) {
        self.set_blocked(false);
        if let Some(resume) = &self.hooks.resume {
            resume();
        }
    }

    /// Mark a blocking wait for the parallel executor's bookkeeping
    pub fn enter_blocking(&self) -> BlockingGuard<'_> {
        self.set_blocked(true);
        if let Some(hook) = &self.hooks.blocking {
            hook(true);
        }
        BlockingGuard { payload: self }
    }

    /// One-shot yield: the first call asks for a yield, the retry after
    /// resumption continues
    pub(crate) fn yield_once(&self) -> bool {
        if self.yielded.swap(false, Ordering::SeqCst) {
            false
        } else {
            self.yielded.store(true, Ordering::SeqCst);
            true
        }
    }

    pub(crate) fn await_state(&self, site: NodeId) -> Option<Arc<Mutex<AwaitEvalState>>> {
        self.await_states.lock().get(&site).cloned()
    }

    pub(crate) fn insert_await_state(&self, site: NodeId, state: Arc<Mutex<AwaitEvalState>>) {
        self.await_states.lock().insert(site, state);
    }

    pub(crate) fn remove_await_state(&self, site: NodeId) {
        self.await_states.lock().remove(&site);
    }

    pub(crate) fn take_channel_wait(&self, channel: u64) -> Option<ChannelWait> {
        self.channel_waits.lock().remove(&channel)
    }

    pub(crate) fn set_channel_wait(&self, channel: u64, wait: ChannelWait) {
        self.channel_waits.lock().insert(channel, wait);
    }

    /// Record a wait on `future`; false if one is already registered
    pub(crate) fn watch_future(&self, future: u64) -> bool {
        self.future_waits.lock().insert(future)
    }

    pub(crate) fn forget_future(&self, future: u64) {
        self.future_waits.lock().remove(&future);
    }

    pub(crate) fn set_parker(&self, parker: Parker) {
        *self.parker.lock() = Some(Arc::new(parker));
    }

    /// Suspend in place until the executor resumes the task; `None` when the
    /// task has no thread of its own and must unwind to yield
    pub(crate) fn park(&self) -> Option<Result<(), crate::error::RuntimeError>> {
        let parker = self.parker.lock().clone()?;
        Some(parker.park())
    }
}

/// Leaves the blocking state on drop
pub struct BlockingGuard<'a> {
    payload: &'a AsyncPayload,
}

impl Drop for BlockingGuard<'_> {
    fn drop(&mut self) {
        self.payload.set_blocked(false);
        if let Some(hook) = &self.payload.hooks.blocking {
            hook(false);
        }
    }
}
