//! Mutexes
//!
//! Cooperative tasks that find the lock held park themselves and yield;
//! every unlock wakes all parked tasks and they race for the lock on retry.
//! Parallel tasks wait on a condition variable with a bounded poll so
//! cancellation is noticed.

use super::await_eval::{ArmContext, Awaitable, Registration, Waker};
use super::payload::AsyncPayload;
use crate::config::ExecutorKind;
use crate::error::RuntimeError;
use crate::value::Value;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

static NEXT_MUTEX_ID: AtomicU64 = AtomicU64::new(1);

pub type MutexHandle = Arc<MutexCell>;

pub struct MutexCell {
    id: u64,
    kind: ExecutorKind,
    poll_interval: Duration,
    state: Mutex<MutexState>,
    released: Condvar,
}

#[derive(Default)]
struct MutexState {
    locked: bool,
    owner: Option<u64>,
    waiters: Vec<Weak<AsyncPayload>>,
    blocked_threads: usize,
    arms: Vec<(u64, Waker)>,
    next_registration: u64,
}

impl MutexState {
    fn remove_waiter(&mut self, payload: &Arc<AsyncPayload>) {
        self.waiters
            .retain(|w| w.upgrade().is_some_and(|p| !Arc::ptr_eq(&p, payload)));
    }

    fn claim(&mut self, payload: Option<&Arc<AsyncPayload>>) {
        self.locked = true;
        self.owner = payload.map(|p| p.handle().id());
        if let Some(payload) = payload {
            self.remove_waiter(payload);
        }
    }
}

impl MutexCell {
    pub fn new(kind: ExecutorKind, poll_interval: Duration) -> MutexHandle {
        Arc::new(MutexCell {
            id: NEXT_MUTEX_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            poll_interval,
            state: Mutex::new(MutexState::default()),
            released: Condvar::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }

    /// Future id of the task holding the lock; `None` for host callers
    pub fn owner(&self) -> Option<u64> {
        self.state.lock().owner
    }

    /// Tasks and threads currently waiting for the lock
    pub fn waiter_count(&self) -> usize {
        let state = self.state.lock();
        state.waiters.iter().filter(|w| w.strong_count() > 0).count() + state.blocked_threads
    }

    /// Acquire the lock.
    ///
    /// A cooperative caller without a task payload gets
    /// [`RuntimeError::Yield`] when the lock is held.
    pub fn lock(&self, payload: Option<&Arc<AsyncPayload>>) -> Result<(), RuntimeError> {
        match self.kind {
            ExecutorKind::Cooperative => self.lock_cooperative(payload),
            ExecutorKind::Parallel => self.lock_parallel(payload),
        }
    }

    pub fn try_lock(&self, payload: Option<&Arc<AsyncPayload>>) -> bool {
        let mut state = self.state.lock();
        if state.locked {
            return false;
        }
        state.claim(payload);
        true
    }

    /// Release the lock and wake every waiter
    pub fn unlock(&self) -> Result<(), RuntimeError> {
        let (tasks, arms) = {
            let mut state = self.state.lock();
            if !state.locked {
                return Err(RuntimeError::raise(
                    "MutexUnlocked",
                    "unlock of unlocked mutex",
                ));
            }
            state.locked = false;
            state.owner = None;
            let tasks = std::mem::take(&mut state.waiters);
            let arms: Vec<Waker> = state.arms.iter().map(|(_, w)| w.clone()).collect();
            (tasks, arms)
        };
        self.released.notify_all();
        for task in tasks {
            if let Some(payload) = task.upgrade() {
                payload.wake();
            }
        }
        for waker in arms {
            waker.wake();
        }
        Ok(())
    }

    fn lock_cooperative(&self, payload: Option<&Arc<AsyncPayload>>) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        if !state.locked {
            state.claim(payload);
            return Ok(());
        }
        let Some(payload) = payload else {
            return Err(RuntimeError::Yield);
        };
        if payload.cancel_requested() {
            state.remove_waiter(payload);
            return Err(RuntimeError::Cancelled);
        }
        let parked = state
            .waiters
            .iter()
            .any(|w| w.upgrade().is_some_and(|p| Arc::ptr_eq(&p, payload)));
        if !parked {
            state.waiters.push(Arc::downgrade(payload));
        }
        payload.set_blocked(true);
        Err(RuntimeError::Yield)
    }

    fn lock_parallel(&self, payload: Option<&Arc<AsyncPayload>>) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        if !state.locked {
            state.claim(payload);
            return Ok(());
        }
        let _blocking = payload.map(|p| p.enter_blocking());
        state.blocked_threads += 1;
        let result = loop {
            if !state.locked {
                state.claim(payload);
                break Ok(());
            }
            if payload.is_some_and(|p| p.cancel_requested()) {
                break Err(RuntimeError::Cancelled);
            }
            self.released.wait_for(&mut state, self.poll_interval);
        };
        state.blocked_threads -= 1;
        result
    }

    fn register(self: &Arc<Self>, waker: &Waker) -> Registration {
        let id = {
            let mut state = self.state.lock();
            state.next_registration += 1;
            let id = state.next_registration;
            state.arms.push((id, waker.clone()));
            id
        };
        let mutex = self.clone();
        Registration::new(move || {
            mutex.state.lock().arms.retain(|(r, _)| *r != id);
        })
    }
}

/// `await` arm that acquires a mutex
pub struct MutexLockArm {
    mutex: MutexHandle,
}

impl MutexLockArm {
    pub fn new(mutex: MutexHandle) -> Self {
        MutexLockArm { mutex }
    }
}

impl Awaitable for MutexLockArm {
    fn is_ready(&self, _cx: &ArmContext<'_>) -> Result<bool, RuntimeError> {
        Ok(!self.mutex.is_locked())
    }

    fn register(&self, _cx: &ArmContext<'_>, waker: &Waker) -> Result<Registration, RuntimeError> {
        Ok(self.mutex.register(waker))
    }

    fn commit(&self, cx: &ArmContext<'_>) -> Result<Value, RuntimeError> {
        self.mutex.lock(Some(cx.payload))?;
        Ok(Value::Mutex(self.mutex.clone()))
    }

    fn describe(&self) -> String {
        format!("lock mutex#{}", self.mutex.id())
    }
}
