//! Await evaluation
//!
//! `await [arms...]` polls every arm in declaration order and commits the
//! first one that is ready. When none is ready it commits the default arm,
//! if present; otherwise it registers a shared waker with every arm and
//! suspends. Cooperative tasks suspend by yielding (the per-site state is
//! cached on the task payload so a retry resumes the same evaluation);
//! parallel tasks block on the waker signal or the task's cancel token.

use super::payload::AsyncPayload;
use crate::ast::NodeId;
use crate::config::ExecutorKind;
use crate::error::RuntimeError;
use crate::interpreter::Interpreter;
use crate::value::Value;
use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::select;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

/// What an arm sees while it is polled, registered or committed
pub struct ArmContext<'a> {
    pub interp: &'a Interpreter,
    pub payload: &'a Arc<AsyncPayload>,
}

/// Something an `await` can wait on
pub trait Awaitable: Send + Sync {
    /// Non-blocking readiness check
    fn is_ready(&self, cx: &ArmContext<'_>) -> Result<bool, RuntimeError>;

    /// Arrange for `waker` to fire when the arm may have become ready
    fn register(&self, cx: &ArmContext<'_>, waker: &Waker) -> Result<Registration, RuntimeError>;

    /// Perform the arm's operation and produce the await result
    fn commit(&self, cx: &ArmContext<'_>) -> Result<Value, RuntimeError>;

    /// The fallback arm chosen when nothing else is ready
    fn is_default(&self) -> bool {
        false
    }

    fn describe(&self) -> String;
}

impl fmt::Debug for dyn Awaitable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<awaitable {}>", self.describe())
    }
}

/// Waker shared by every arm of one await evaluation
#[derive(Clone)]
pub struct Waker {
    inner: Arc<WakerInner>,
}

struct WakerInner {
    pending: AtomicBool,
    payload: Weak<AsyncPayload>,
    signal_tx: Sender<()>,
    signal_rx: Receiver<()>,
}

impl Waker {
    pub(crate) fn new(payload: &Arc<AsyncPayload>) -> Self {
        let (signal_tx, signal_rx) = channel::bounded(1);
        Waker {
            inner: Arc::new(WakerInner {
                pending: AtomicBool::new(false),
                payload: Arc::downgrade(payload),
                signal_tx,
                signal_rx,
            }),
        }
    }

    /// Flag a wakeup and reschedule the awaiting task
    pub fn wake(&self) {
        self.inner.pending.store(true, Ordering::SeqCst);
        let _ = self.inner.signal_tx.try_send(());
        if let Some(payload) = self.inner.payload.upgrade() {
            if payload.kind() == ExecutorKind::Cooperative {
                payload.wake();
            }
        }
    }

    fn take_pending(&self) -> bool {
        self.inner.pending.swap(false, Ordering::SeqCst)
    }

    fn is_pending(&self) -> bool {
        self.inner.pending.load(Ordering::SeqCst)
    }

    fn signal(&self) -> &Receiver<()> {
        &self.inner.signal_rx
    }
}

/// Cancels an arm's registration; dropping it without `cancel` leaks nothing
/// but leaves the arm free to fire a stale wakeup
pub struct Registration {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Registration {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Registration {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn none() -> Self {
        Registration { cancel: None }
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// Per (task, await site) evaluation state
pub struct AwaitEvalState {
    arms: Vec<ArmSlot>,
    default_arm: Option<Arc<dyn Awaitable>>,
    waker: Waker,
}

struct ArmSlot {
    arm: Arc<dyn Awaitable>,
    registration: Option<Registration>,
}

impl AwaitEvalState {
    fn build(arms: &Value, payload: &Arc<AsyncPayload>) -> Result<Self, RuntimeError> {
        let values = match arms {
            Value::Array(items) => items.snapshot(),
            other => vec![other.clone()],
        };
        let mut slots = Vec::with_capacity(values.len());
        let mut default_arm = None;
        for value in values {
            let arm = to_awaitable(&value)?;
            if arm.is_default() {
                if default_arm.is_some() {
                    return Err(RuntimeError::raise(
                        "AwaitError",
                        "await accepts at most one default arm",
                    ));
                }
                default_arm = Some(arm);
            } else {
                slots.push(ArmSlot {
                    arm,
                    registration: None,
                });
            }
        }
        if slots.is_empty() && default_arm.is_none() {
            return Err(RuntimeError::raise(
                "AwaitError",
                "await requires at least one arm",
            ));
        }
        Ok(AwaitEvalState {
            arms: slots,
            default_arm,
            waker: Waker::new(payload),
        })
    }

    fn register_all(&mut self, cx: &ArmContext<'_>) -> Result<(), RuntimeError> {
        for slot in &mut self.arms {
            if slot.registration.is_none() {
                slot.registration = Some(slot.arm.register(cx, &self.waker)?);
            }
        }
        Ok(())
    }

    fn cancel_registrations(&mut self) {
        for slot in &mut self.arms {
            if let Some(registration) = slot.registration.take() {
                registration.cancel();
            }
        }
    }
}

/// Convert an arm value into an awaitable
pub fn to_awaitable(value: &Value) -> Result<Arc<dyn Awaitable>, RuntimeError> {
    use super::arms::{FutureArm, StructArm};
    use super::channel::ChannelReceiveArm;
    use super::mutex::MutexLockArm;

    match value {
        Value::Awaitable(arm) => Ok(arm.clone()),
        Value::Future(handle) => Ok(Arc::new(FutureArm::new(handle.clone()))),
        Value::Channel(channel) => Ok(Arc::new(ChannelReceiveArm::new(channel.clone()))),
        Value::Mutex(mutex) => Ok(Arc::new(MutexLockArm::new(mutex.clone()))),
        Value::Struct(_) => Ok(Arc::new(StructArm::new(value.clone()))),
        other => Err(RuntimeError::type_error(format!(
            "value of type {} is not awaitable",
            other.type_name()
        ))),
    }
}

/// Evaluate one await expression for the task owning `payload`
pub fn evaluate_await(
    interp: &Interpreter,
    payload: &Arc<AsyncPayload>,
    site: NodeId,
    arms: &Value,
) -> Result<Value, RuntimeError> {
    let state = match payload.await_state(site) {
        Some(state) => state,
        None => {
            let state = Arc::new(Mutex::new(AwaitEvalState::build(arms, payload)?));
            payload.insert_await_state(site, state.clone());
            state
        }
    };
    let cx = ArmContext { interp, payload };

    let selected = match poll_until_selected(&cx, site, &state) {
        // Registrations stay live across the yield
        Err(RuntimeError::Yield) => return Err(RuntimeError::Yield),
        other => other,
    };
    state.lock().cancel_registrations();
    payload.remove_await_state(site);
    payload.set_blocked(false);
    let arm = selected?;
    debug!(site = site.as_u32(), arm = %arm.describe(), "await arm selected");
    arm.commit(&cx)
}

fn poll_until_selected(
    cx: &ArmContext<'_>,
    site: NodeId,
    state: &Arc<Mutex<AwaitEvalState>>,
) -> Result<Arc<dyn Awaitable>, RuntimeError> {
    loop {
        let mut guard = state.lock();
        for slot in &guard.arms {
            if slot.arm.is_ready(cx)? {
                return Ok(slot.arm.clone());
            }
        }
        if let Some(default_arm) = &guard.default_arm {
            return Ok(default_arm.clone());
        }
        if cx.payload.cancel_requested() {
            return Err(RuntimeError::Cancelled);
        }
        if guard.waker.take_pending() {
            continue;
        }
        guard.register_all(cx)?;
        if guard.waker.take_pending() {
            continue;
        }

        match cx.payload.kind() {
            ExecutorKind::Cooperative => {
                cx.payload.set_blocked(true);
                if guard.waker.is_pending() {
                    cx.payload.set_blocked(false);
                    continue;
                }
                trace!(site = site.as_u32(), "await suspended");
                return Err(RuntimeError::Yield);
            }
            ExecutorKind::Parallel => {
                let waker = guard.waker.clone();
                drop(guard);
                let _blocking = cx.payload.enter_blocking();
                select! {
                    recv(waker.signal()) -> _ => {}
                    recv(cx.payload.handle().token().signal()) -> _ => {}
                }
            }
        }
    }
}
