//! Native entry points for tasks, channels, mutexes and await arms
//!
//! These are bound as globals and, for channels, mutexes and futures, also
//! registered as methods so `ch.send(v)` and `channel_send(ch, v)` agree.

use super::capabilities::MethodTable;
use super::NativeCall;
use crate::config::ExecutorKind;
use crate::environment::Env;
use crate::error::RuntimeError;
use crate::runtime::{
    Channel, ChannelHandle, ChannelReceiveArm, ChannelSendArm, DefaultArm, FutureHandle,
    MutexCell, MutexHandle, MutexLockArm, SleepArm,
};
use crate::value::{NativeFunction, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

type Native = fn(&NativeCall<'_>, &[Value]) -> Result<Value, RuntimeError>;

const NATIVES: &[(&str, Option<usize>, Native)] = &[
    ("future_yield", Some(0), future_yield),
    ("future_flush", Some(0), future_flush),
    ("future_cancelled", Some(0), future_cancelled),
    ("future_pending_tasks", Some(0), future_pending_tasks),
    ("future_value", Some(1), future_value),
    ("future_status", Some(1), future_status),
    ("future_cancel", Some(1), future_cancel),
    ("channel_new", Some(1), channel_new),
    ("channel_send", Some(2), channel_send),
    ("channel_receive", Some(1), channel_receive),
    ("channel_try_send", Some(2), channel_try_send),
    ("channel_try_receive", Some(1), channel_try_receive),
    ("channel_close", Some(1), channel_close),
    ("channel_send_arm", Some(2), channel_send_arm),
    ("channel_receive_arm", Some(1), channel_receive_arm),
    ("mutex_new", Some(0), mutex_new),
    ("mutex_lock", Some(1), mutex_lock),
    ("mutex_unlock", Some(1), mutex_unlock),
    ("mutex_try_lock", Some(1), mutex_try_lock),
    ("mutex_lock_arm", Some(1), mutex_lock_arm),
    ("await_default", None, await_default),
    ("await_sleep", None, await_sleep),
];

/// (type, method, native) triples exposed as methods
const METHODS: &[(&str, &str, &str)] = &[
    ("Future", "value", "future_value"),
    ("Future", "status", "future_status"),
    ("Future", "cancel", "future_cancel"),
    ("Channel", "send", "channel_send"),
    ("Channel", "receive", "channel_receive"),
    ("Channel", "try_send", "channel_try_send"),
    ("Channel", "try_receive", "channel_try_receive"),
    ("Channel", "close", "channel_close"),
    ("Channel", "send_arm", "channel_send_arm"),
    ("Channel", "receive_arm", "channel_receive_arm"),
    ("Mutex", "lock", "mutex_lock"),
    ("Mutex", "unlock", "mutex_unlock"),
    ("Mutex", "try_lock", "mutex_try_lock"),
    ("Mutex", "lock_arm", "mutex_lock_arm"),
];

pub(super) fn install(globals: &Env, methods: &MethodTable) {
    for (name, arity, func) in NATIVES {
        let func = *func;
        let native = Value::Native(NativeFunction::new(name, *arity, func));
        globals.define((*name).into(), native);
    }
    for (type_name, method, native) in METHODS {
        if let Some(value) = globals.get(native) {
            methods.register(type_name, method, value);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Argument helpers
// ═══════════════════════════════════════════════════════════════════════════════

fn arg<'a>(args: &'a [Value], index: usize, name: &str) -> Result<&'a Value, RuntimeError> {
    args.get(index).ok_or_else(|| {
        RuntimeError::type_error(format!("{} is missing argument {}", name, index + 1))
    })
}

fn expect_future(value: &Value, name: &str) -> Result<FutureHandle, RuntimeError> {
    match value {
        Value::Future(handle) => Ok(handle.clone()),
        other => Err(RuntimeError::type_error(format!(
            "{} expects a Future, got {}",
            name,
            other.type_name()
        ))),
    }
}

fn expect_channel(value: &Value, name: &str) -> Result<ChannelHandle, RuntimeError> {
    match value {
        Value::Channel(channel) => Ok(channel.clone()),
        other => Err(RuntimeError::type_error(format!(
            "{} expects a Channel, got {}",
            name,
            other.type_name()
        ))),
    }
}

fn expect_mutex(value: &Value, name: &str) -> Result<MutexHandle, RuntimeError> {
    match value {
        Value::Mutex(mutex) => Ok(mutex.clone()),
        other => Err(RuntimeError::type_error(format!(
            "{} expects a Mutex, got {}",
            name,
            other.type_name()
        ))),
    }
}

fn expect_non_negative(value: &Value, name: &str) -> Result<u64, RuntimeError> {
    match value {
        Value::Int(n) if *n >= 0 => Ok(*n as u64),
        Value::Int(n) => Err(RuntimeError::raise(
            "ValueError",
            format!("{} expects a non-negative Int, got {}", name, n),
        )),
        other => Err(RuntimeError::type_error(format!(
            "{} expects an Int, got {}",
            name,
            other.type_name()
        ))),
    }
}

fn require_task<'a>(
    cx: &NativeCall<'a>,
    name: &str,
) -> Result<&'a Arc<crate::runtime::AsyncPayload>, RuntimeError> {
    cx.payload.ok_or_else(|| {
        RuntimeError::raise(
            "AsyncContextError",
            format!("{} must be called inside an asynchronous task", name),
        )
    })
}

/// Host callers cannot suspend: a cooperative yield flushes the executor
/// once and retries before reporting a deadlock
fn block_on_host<T>(
    cx: &NativeCall<'_>,
    what: &str,
    mut op: impl FnMut() -> Result<T, RuntimeError>,
) -> Result<T, RuntimeError> {
    match op() {
        Err(RuntimeError::Yield) if cx.payload.is_none() => {
            trace!(operation = what, "host call would block; flushing");
            cx.interp.executor().flush();
            match op() {
                Err(RuntimeError::Yield) => Err(RuntimeError::raise(
                    "Deadlock",
                    format!("{} would block forever", what),
                )),
                other => other,
            }
        }
        other => other,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Futures & scheduling
// ═══════════════════════════════════════════════════════════════════════════════

fn future_yield(cx: &NativeCall<'_>, _args: &[Value]) -> Result<Value, RuntimeError> {
    match cx.payload {
        Some(payload) if payload.kind() == ExecutorKind::Cooperative => {
            if payload.cancel_requested() {
                return Err(RuntimeError::Cancelled);
            }
            if payload.yield_once() {
                return Err(RuntimeError::Yield);
            }
        }
        Some(_) => std::thread::yield_now(),
        None => {}
    }
    Ok(Value::Nil)
}

fn future_flush(cx: &NativeCall<'_>, _args: &[Value]) -> Result<Value, RuntimeError> {
    match cx.payload {
        Some(payload) if payload.kind() == ExecutorKind::Parallel => {
            let _blocking = payload.enter_blocking();
            cx.interp.executor().flush();
        }
        _ => cx.interp.executor().flush(),
    }
    Ok(Value::Nil)
}

fn future_cancelled(cx: &NativeCall<'_>, _args: &[Value]) -> Result<Value, RuntimeError> {
    let payload = require_task(cx, "future_cancelled")?;
    Ok(Value::Bool(payload.cancel_requested()))
}

fn future_pending_tasks(cx: &NativeCall<'_>, _args: &[Value]) -> Result<Value, RuntimeError> {
    let count = cx.interp.executor().pending_count();
    Ok(Value::Int(i64::try_from(count).unwrap_or(i64::MAX)))
}

fn future_value(cx: &NativeCall<'_>, args: &[Value]) -> Result<Value, RuntimeError> {
    let handle = expect_future(arg(args, 0, "future_value")?, "future_value")?;
    cx.interp.future_value(&handle, cx.payload)
}

fn future_status(_cx: &NativeCall<'_>, args: &[Value]) -> Result<Value, RuntimeError> {
    let handle = expect_future(arg(args, 0, "future_status")?, "future_status")?;
    Ok(Value::string(handle.status().as_str()))
}

fn future_cancel(_cx: &NativeCall<'_>, args: &[Value]) -> Result<Value, RuntimeError> {
    let handle = expect_future(arg(args, 0, "future_cancel")?, "future_cancel")?;
    handle.request_cancel();
    Ok(Value::Nil)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Channels
// ═══════════════════════════════════════════════════════════════════════════════

fn channel_new(cx: &NativeCall<'_>, args: &[Value]) -> Result<Value, RuntimeError> {
    let capacity = expect_non_negative(arg(args, 0, "channel_new")?, "channel_new")?;
    let capacity = usize::try_from(capacity)
        .map_err(|_| RuntimeError::raise("ValueError", "channel capacity is too large"))?;
    Ok(Value::Channel(Channel::new(
        capacity,
        cx.interp.executor_kind(),
    )))
}

fn channel_send(cx: &NativeCall<'_>, args: &[Value]) -> Result<Value, RuntimeError> {
    let channel = expect_channel(arg(args, 0, "channel_send")?, "channel_send")?;
    let value = arg(args, 1, "channel_send")?.clone();
    block_on_host(cx, "channel send", || channel.send(value.clone(), cx.payload))?;
    Ok(Value::Nil)
}

fn channel_receive(cx: &NativeCall<'_>, args: &[Value]) -> Result<Value, RuntimeError> {
    let channel = expect_channel(arg(args, 0, "channel_receive")?, "channel_receive")?;
    block_on_host(cx, "channel receive", || channel.receive(cx.payload))
}

fn channel_try_send(_cx: &NativeCall<'_>, args: &[Value]) -> Result<Value, RuntimeError> {
    let channel = expect_channel(arg(args, 0, "channel_try_send")?, "channel_try_send")?;
    let value = arg(args, 1, "channel_try_send")?.clone();
    Ok(Value::Bool(channel.try_send(value)?))
}

fn channel_try_receive(_cx: &NativeCall<'_>, args: &[Value]) -> Result<Value, RuntimeError> {
    let channel = expect_channel(arg(args, 0, "channel_try_receive")?, "channel_try_receive")?;
    Ok(channel.try_receive().unwrap_or_default())
}

fn channel_close(_cx: &NativeCall<'_>, args: &[Value]) -> Result<Value, RuntimeError> {
    let channel = expect_channel(arg(args, 0, "channel_close")?, "channel_close")?;
    channel.close()?;
    Ok(Value::Nil)
}

fn channel_send_arm(_cx: &NativeCall<'_>, args: &[Value]) -> Result<Value, RuntimeError> {
    let channel = expect_channel(arg(args, 0, "channel_send_arm")?, "channel_send_arm")?;
    let value = arg(args, 1, "channel_send_arm")?.clone();
    Ok(Value::Awaitable(Arc::new(ChannelSendArm::new(channel, value))))
}

fn channel_receive_arm(_cx: &NativeCall<'_>, args: &[Value]) -> Result<Value, RuntimeError> {
    let channel = expect_channel(arg(args, 0, "channel_receive_arm")?, "channel_receive_arm")?;
    Ok(Value::Awaitable(Arc::new(ChannelReceiveArm::new(channel))))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Mutexes
// ═══════════════════════════════════════════════════════════════════════════════

fn mutex_new(cx: &NativeCall<'_>, _args: &[Value]) -> Result<Value, RuntimeError> {
    let poll = Duration::from_millis(cx.interp.config().parallel_poll_interval_ms);
    Ok(Value::Mutex(MutexCell::new(cx.interp.executor_kind(), poll)))
}

fn mutex_lock(cx: &NativeCall<'_>, args: &[Value]) -> Result<Value, RuntimeError> {
    let mutex = expect_mutex(arg(args, 0, "mutex_lock")?, "mutex_lock")?;
    block_on_host(cx, "mutex lock", || mutex.lock(cx.payload))?;
    Ok(Value::Nil)
}

fn mutex_unlock(_cx: &NativeCall<'_>, args: &[Value]) -> Result<Value, RuntimeError> {
    let mutex = expect_mutex(arg(args, 0, "mutex_unlock")?, "mutex_unlock")?;
    mutex.unlock()?;
    Ok(Value::Nil)
}

fn mutex_try_lock(cx: &NativeCall<'_>, args: &[Value]) -> Result<Value, RuntimeError> {
    let mutex = expect_mutex(arg(args, 0, "mutex_try_lock")?, "mutex_try_lock")?;
    Ok(Value::Bool(mutex.try_lock(cx.payload)))
}

fn mutex_lock_arm(_cx: &NativeCall<'_>, args: &[Value]) -> Result<Value, RuntimeError> {
    let mutex = expect_mutex(arg(args, 0, "mutex_lock_arm")?, "mutex_lock_arm")?;
    Ok(Value::Awaitable(Arc::new(MutexLockArm::new(mutex))))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Await helpers
// ═══════════════════════════════════════════════════════════════════════════════

/// `await_default()` or `await_default(callback)`
fn await_default(_cx: &NativeCall<'_>, args: &[Value]) -> Result<Value, RuntimeError> {
    if args.len() > 1 {
        return Err(RuntimeError::type_error(format!(
            "await_default expects at most 1 argument(s), got {}",
            args.len()
        )));
    }
    Ok(Value::Awaitable(Arc::new(DefaultArm::new(
        args.first().cloned(),
    ))))
}

/// `await_sleep(ms)` or `await_sleep(ms, value)`
fn await_sleep(_cx: &NativeCall<'_>, args: &[Value]) -> Result<Value, RuntimeError> {
    if args.is_empty() || args.len() > 2 {
        return Err(RuntimeError::type_error(format!(
            "await_sleep expects 1 or 2 argument(s), got {}",
            args.len()
        )));
    }
    let millis = expect_non_negative(arg(args, 0, "await_sleep")?, "await_sleep")?;
    let value = args.get(1).cloned().unwrap_or_default();
    Ok(Value::Awaitable(Arc::new(SleepArm::new(
        Duration::from_millis(millis),
        value,
    ))))
}
