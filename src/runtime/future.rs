//! Future / task state machine
//!
//! A future is a write-once outcome cell: it leaves `Pending` exactly once,
//! and every awaiter registered while pending fires exactly once, outside
//! the state lock.

use crate::error::RuntimeError;
use crate::value::Value;
use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::select;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

static NEXT_FUTURE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureStatus {
    Pending,
    Resolved,
    Cancelled,
    Failed,
}

impl FutureStatus {
    pub fn is_terminal(self) -> bool {
        self != FutureStatus::Pending
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FutureStatus::Pending => "pending",
            FutureStatus::Resolved => "resolved",
            FutureStatus::Cancelled => "cancelled",
            FutureStatus::Failed => "failed",
        }
    }
}

/// Snapshot returned by [`Future::outcome`] and [`Future::wait`]
#[derive(Debug, Clone)]
pub struct FutureOutcome {
    pub status: FutureStatus,
    pub value: Option<Value>,
    pub failure: Option<Value>,
}

impl FutureOutcome {
    /// Convert a terminal outcome into the value a waiter observes
    pub fn into_result(self) -> Result<Value, RuntimeError> {
        match self.status {
            FutureStatus::Resolved => Ok(self.value.unwrap_or_default()),
            FutureStatus::Failed => Err(RuntimeError::Raise(
                self.failure
                    .unwrap_or_else(|| Value::error("TaskFailure", "task failed")),
            )),
            FutureStatus::Cancelled => Err(RuntimeError::raise(
                "FutureCancelled",
                "future was cancelled",
            )),
            FutureStatus::Pending => Err(RuntimeError::internal("future is still pending")),
        }
    }
}

pub type Awaiter = Box<dyn FnOnce() + Send>;

pub type FutureHandle = Arc<Future>;

pub struct Future {
    id: u64,
    state: Mutex<FutureState>,
    settled: Condvar,
    token: CancelToken,
    cancel_hook: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
}

struct FutureState {
    status: FutureStatus,
    value: Option<Value>,
    failure: Option<Value>,
    cancel_requested: bool,
    started: bool,
    awaiters: Vec<Awaiter>,
}

impl Future {
    pub fn new() -> FutureHandle {
        Arc::new(Future {
            id: NEXT_FUTURE_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(FutureState {
                status: FutureStatus::Pending,
                value: None,
                failure: None,
                cancel_requested: false,
                started: false,
                awaiters: Vec::new(),
            }),
            settled: Condvar::new(),
            token: CancelToken::new(),
            cancel_hook: Mutex::new(None),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn status(&self) -> FutureStatus {
        self.state.lock().status
    }

    pub fn is_pending(&self) -> bool {
        self.status() == FutureStatus::Pending
    }

    pub fn resolve(&self, value: Value) -> bool {
        self.settle(FutureStatus::Resolved, Some(value), None)
    }

    pub fn fail(&self, failure: Value) -> bool {
        self.settle(FutureStatus::Failed, None, Some(failure))
    }

    pub fn cancel(&self, value: Option<Value>) -> bool {
        self.settle(FutureStatus::Cancelled, value, None)
    }

    /// Transition out of `Pending`; a no-op once terminal
    fn settle(&self, status: FutureStatus, value: Option<Value>, failure: Option<Value>) -> bool {
        let awaiters = {
            let mut state = self.state.lock();
            if state.status.is_terminal() {
                return false;
            }
            if status == FutureStatus::Cancelled {
                state.cancel_requested = true;
            }
            state.status = status;
            state.value = value;
            state.failure = failure;
            std::mem::take(&mut state.awaiters)
        };
        self.settled.notify_all();
        for awaiter in awaiters {
            awaiter();
        }
        true
    }

    pub fn outcome(&self) -> FutureOutcome {
        let state = self.state.lock();
        FutureOutcome {
            status: state.status,
            value: state.value.clone(),
            failure: state.failure.clone(),
        }
    }

    /// Awaiters still waiting for the future to settle
    pub fn awaiter_count(&self) -> usize {
        self.state.lock().awaiters.len()
    }

    /// Fire `awaiter` once the future settles (immediately if it already has)
    pub fn add_awaiter(&self, awaiter: Awaiter) {
        {
            let mut state = self.state.lock();
            if !state.status.is_terminal() {
                state.awaiters.push(awaiter);
                return;
            }
        }
        awaiter();
    }

    /// Block the calling thread until the future settles
    pub fn wait(&self) -> FutureOutcome {
        let mut state = self.state.lock();
        while !state.status.is_terminal() {
            self.settled.wait(&mut state);
        }
        FutureOutcome {
            status: state.status,
            value: state.value.clone(),
            failure: state.failure.clone(),
        }
    }

    /// Block until settled or `timeout` elapses; returns whether it settled
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if !state.status.is_terminal() {
            self.settled.wait_for(&mut state, timeout);
        }
        state.status.is_terminal()
    }

    /// Block until settled, giving up with `Cancelled` when `token` fires
    pub fn wait_cancellable(&self, token: &CancelToken) -> Result<FutureOutcome, RuntimeError> {
        let (tx, rx): (Sender<()>, Receiver<()>) = channel::bounded(1);
        self.add_awaiter(Box::new(move || {
            let _ = tx.try_send(());
        }));
        select! {
            recv(rx) -> _ => Ok(self.outcome()),
            recv(token.signal()) -> _ => Err(RuntimeError::Cancelled),
        }
    }

    /// Request cooperative cancellation.
    ///
    /// A task that has not started yet is cancelled immediately; a running
    /// task observes the request at its next suspension point.
    pub fn request_cancel(&self) {
        let started = {
            let mut state = self.state.lock();
            if state.cancel_requested || state.status.is_terminal() {
                return;
            }
            state.cancel_requested = true;
            state.started
        };
        self.token.cancel();
        if !started {
            self.settle(FutureStatus::Cancelled, None, None);
            return;
        }
        let hook = self.cancel_hook.lock().clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    pub fn cancel_requested(&self) -> bool {
        self.state.lock().cancel_requested
    }

    /// Mark the task as started; returns false if it already settled
    pub fn mark_started(&self) -> bool {
        let mut state = self.state.lock();
        if state.status.is_terminal() {
            return false;
        }
        state.started = true;
        true
    }

    pub fn started(&self) -> bool {
        self.state.lock().started
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Callback run when cancellation is requested for a started task
    pub fn set_cancel_hook(&self, hook: Arc<dyn Fn() + Send + Sync>) {
        *self.cancel_hook.lock() = Some(hook);
    }
}

/// Host cancellation token: a flag plus a channel that disconnects on cancel
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

struct TokenInner {
    cancelled: AtomicBool,
    trigger: Mutex<Option<Sender<()>>>,
    signal: Receiver<()>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = channel::bounded(0);
        CancelToken {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                trigger: Mutex::new(Some(tx)),
                signal: rx,
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.trigger.lock().take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Becomes ready (disconnected) once the token is cancelled
    pub fn signal(&self) -> &Receiver<()> {
        &self.inner.signal
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
