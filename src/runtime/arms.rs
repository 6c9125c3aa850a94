//! Built-in await arms: futures, default, timers and user structs

use super::await_eval::{ArmContext, Awaitable, Registration, Waker};
use super::future::FutureHandle;
use crate::error::RuntimeError;
use crate::value::{NativeFunction, Value};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::warn;

/// Ready once the future settles; commits to its value or re-raises its
/// failure
pub struct FutureArm {
    handle: FutureHandle,
}

impl FutureArm {
    pub fn new(handle: FutureHandle) -> Self {
        FutureArm { handle }
    }
}

impl Awaitable for FutureArm {
    fn is_ready(&self, _cx: &ArmContext<'_>) -> Result<bool, RuntimeError> {
        Ok(!self.handle.is_pending())
    }

    fn register(&self, _cx: &ArmContext<'_>, waker: &Waker) -> Result<Registration, RuntimeError> {
        let active = Arc::new(AtomicBool::new(true));
        let live = active.clone();
        let waker = waker.clone();
        self.handle.add_awaiter(Box::new(move || {
            if live.load(Ordering::SeqCst) {
                waker.wake();
            }
        }));
        Ok(Registration::new(move || {
            active.store(false, Ordering::SeqCst)
        }))
    }

    fn commit(&self, _cx: &ArmContext<'_>) -> Result<Value, RuntimeError> {
        self.handle.outcome().into_result()
    }

    fn describe(&self) -> String {
        format!("future#{}", self.handle.id())
    }
}

/// Chosen only when no other arm is ready
pub struct DefaultArm {
    callback: Option<Value>,
}

impl DefaultArm {
    pub fn new(callback: Option<Value>) -> Self {
        DefaultArm { callback }
    }
}

impl Awaitable for DefaultArm {
    fn is_ready(&self, _cx: &ArmContext<'_>) -> Result<bool, RuntimeError> {
        Ok(false)
    }

    fn register(&self, _cx: &ArmContext<'_>, _waker: &Waker) -> Result<Registration, RuntimeError> {
        Ok(Registration::none())
    }

    fn commit(&self, cx: &ArmContext<'_>) -> Result<Value, RuntimeError> {
        match &self.callback {
            Some(callback) => cx.interp.call_value(callback, Vec::new(), Some(cx.payload)),
            None => Ok(Value::Nil),
        }
    }

    fn is_default(&self) -> bool {
        true
    }

    fn describe(&self) -> String {
        "default".to_string()
    }
}

/// Ready once its deadline passes; a timer thread fires the waker
pub struct SleepArm {
    deadline: Instant,
    value: Value,
}

impl SleepArm {
    pub fn new(duration: Duration, value: Value) -> Self {
        SleepArm {
            deadline: Instant::now() + duration,
            value,
        }
    }
}

impl Awaitable for SleepArm {
    fn is_ready(&self, _cx: &ArmContext<'_>) -> Result<bool, RuntimeError> {
        Ok(Instant::now() >= self.deadline)
    }

    fn register(&self, _cx: &ArmContext<'_>, waker: &Waker) -> Result<Registration, RuntimeError> {
        let active = Arc::new(AtomicBool::new(true));
        let live = active.clone();
        let waker = waker.clone();
        let deadline = self.deadline;
        let spawned = thread::Builder::new()
            .name("able-timer".to_string())
            .spawn(move || {
                let now = Instant::now();
                if deadline > now {
                    thread::sleep(deadline - now);
                }
                if live.load(Ordering::SeqCst) {
                    waker.wake();
                }
            });
        if let Err(err) = spawned {
            warn!(%err, "failed to spawn timer thread");
            return Err(RuntimeError::internal(format!(
                "failed to spawn timer thread: {}",
                err
            )));
        }
        Ok(Registration::new(move || {
            active.store(false, Ordering::SeqCst)
        }))
    }

    fn commit(&self, _cx: &ArmContext<'_>) -> Result<Value, RuntimeError> {
        Ok(self.value.clone())
    }

    fn describe(&self) -> String {
        "sleep".to_string()
    }
}

/// A user struct acting as an awaitable through its `is_ready`, `register`
/// and `commit` methods. `register` receives a native waker function and may
/// return a value with a `cancel` method.
pub struct StructArm {
    value: Value,
}

impl StructArm {
    pub fn new(value: Value) -> Self {
        StructArm { value }
    }
}

impl Awaitable for StructArm {
    fn is_ready(&self, cx: &ArmContext<'_>) -> Result<bool, RuntimeError> {
        let ready = cx
            .interp
            .call_method(&self.value, "is_ready", Vec::new(), Some(cx.payload))?;
        Ok(ready.is_truthy())
    }

    fn register(&self, cx: &ArmContext<'_>, waker: &Waker) -> Result<Registration, RuntimeError> {
        let waker = waker.clone();
        let wake_fn = NativeFunction::new("waker", Some(0), move |_, _| {
            waker.wake();
            Ok(Value::Nil)
        });
        let handle = cx.interp.call_method(
            &self.value,
            "register",
            vec![Value::Native(wake_fn)],
            Some(cx.payload),
        )?;
        if handle.is_nil() || cx.interp.member(&handle, "cancel", true).is_err() {
            return Ok(Registration::none());
        }
        let interp = cx.interp.clone();
        let payload = cx.payload.clone();
        Ok(Registration::new(move || {
            if let Err(err) = interp.call_method(&handle, "cancel", Vec::new(), Some(&payload)) {
                warn!(%err, "awaitable registration cancel failed");
            }
        }))
    }

    fn commit(&self, cx: &ArmContext<'_>) -> Result<Value, RuntimeError> {
        cx.interp
            .call_method(&self.value, "commit", Vec::new(), Some(cx.payload))
    }

    fn describe(&self) -> String {
        match &self.value {
            Value::Struct(s) => format!("struct {}", s.name),
            other => other.type_name().to_string(),
        }
    }
}
