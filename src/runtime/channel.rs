//! Channels
//!
//! Under the cooperative executor a channel is a buffer plus FIFO queues of
//! parked senders and receivers; a task that cannot proceed parks a waiter
//! record on its payload and yields, and the retry after wakeup consumes the
//! record. Under the parallel executor the transport is a bounded crossbeam
//! channel; blocked receivers select against the task's cancel token and
//! blocked senders retry on a condvar.

use super::await_eval::{ArmContext, Awaitable, Registration, Waker};
use super::payload::AsyncPayload;
use crate::config::ExecutorKind;
use crate::error::RuntimeError;
use crate::value::Value;
use crossbeam::channel::{self, Receiver, Sender, TryRecvError, TrySendError};
use crossbeam::select;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::trace;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Upper bound on a blocked parallel sender's sleep between attempts
const SEND_RETRY_INTERVAL: Duration = Duration::from_millis(5);

pub type ChannelHandle = Arc<Channel>;

pub struct Channel {
    id: u64,
    capacity: usize,
    state: Mutex<ChannelState>,
    /// Signalled when a parallel receiver arrives or takes a value, and on close
    space: Condvar,
    transport: Option<Transport>,
}

struct Transport {
    tx: Mutex<Option<Sender<Value>>>,
    rx: Receiver<Value>,
}

#[derive(Default)]
struct ChannelState {
    closed: bool,
    queue: VecDeque<Value>,
    senders: VecDeque<Arc<SendWaiter>>,
    receivers: VecDeque<Arc<RecvWaiter>>,
    send_arms: Vec<(u64, Waker)>,
    recv_arms: Vec<(u64, Waker)>,
    next_registration: u64,
    waiting_senders: usize,
    waiting_receivers: usize,
}

/// A cooperative task parked in `send`
pub(crate) struct SendWaiter {
    payload: Weak<AsyncPayload>,
    value: Mutex<Option<Value>>,
    delivered: AtomicBool,
}

/// A cooperative task parked in `receive`
pub(crate) struct RecvWaiter {
    payload: Weak<AsyncPayload>,
    slot: Mutex<Option<Value>>,
    delivered: AtomicBool,
}

/// Pending waiter record stored on a task payload between retries
#[derive(Clone)]
pub(crate) enum ChannelWait {
    Send(Arc<SendWaiter>),
    Receive(Arc<RecvWaiter>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Send,
    Receive,
}

/// Wakeups collected under the state lock and fired after releasing it
#[derive(Default)]
struct Wakeups {
    arms: Vec<Waker>,
    tasks: Vec<Weak<AsyncPayload>>,
}

impl Wakeups {
    fn arms(&mut self, registrants: &[(u64, Waker)]) {
        self.arms
            .extend(registrants.iter().map(|(_, waker)| waker.clone()));
    }

    fn fire(self) {
        for waker in self.arms {
            waker.wake();
        }
        for task in self.tasks {
            if let Some(payload) = task.upgrade() {
                payload.wake();
            }
        }
    }
}

fn send_on_closed() -> RuntimeError {
    RuntimeError::raise("ChannelSendOnClosed", "send on closed channel")
}

impl ChannelState {
    fn pop_live_receiver(&mut self) -> Option<Arc<RecvWaiter>> {
        while let Some(waiter) = self.receivers.pop_front() {
            if waiter.payload.strong_count() > 0 && !waiter.delivered.load(Ordering::SeqCst) {
                return Some(waiter);
            }
        }
        None
    }

    fn pop_live_sender(&mut self) -> Option<Arc<SendWaiter>> {
        while let Some(waiter) = self.senders.pop_front() {
            if waiter.payload.strong_count() > 0 && !waiter.delivered.load(Ordering::SeqCst) {
                return Some(waiter);
            }
        }
        None
    }

    fn has_live_sender(&self) -> bool {
        self.senders
            .iter()
            .any(|w| w.payload.strong_count() > 0 && !w.delivered.load(Ordering::SeqCst))
    }

    fn has_live_receiver(&self) -> bool {
        self.receivers
            .iter()
            .any(|w| w.payload.strong_count() > 0 && !w.delivered.load(Ordering::SeqCst))
    }

    /// Take the value of the first parked sender and wake it
    fn take_from_sender(&mut self, wakeups: &mut Wakeups) -> Option<Value> {
        let sender = self.pop_live_sender()?;
        let value = sender.value.lock().take().unwrap_or_default();
        sender.delivered.store(true, Ordering::SeqCst);
        wakeups.tasks.push(sender.payload.clone());
        Some(value)
    }
}

impl Channel {
    /// Create a channel; `capacity` 0 is a rendezvous channel
    pub fn new(capacity: usize, kind: ExecutorKind) -> ChannelHandle {
        let transport = match kind {
            ExecutorKind::Parallel => {
                let (tx, rx) = channel::bounded(capacity);
                Some(Transport {
                    tx: Mutex::new(Some(tx)),
                    rx,
                })
            }
            ExecutorKind::Cooperative => None,
        };
        Arc::new(Channel {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            capacity,
            state: Mutex::new(ChannelState::default()),
            space: Condvar::new(),
            transport,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Buffered values not yet received
    pub fn len(&self) -> usize {
        match &self.transport {
            Some(transport) => transport.rx.len(),
            None => self.state.lock().queue.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send `value`, suspending the calling task while the channel is full.
    ///
    /// Without a task payload a send that cannot proceed returns
    /// [`RuntimeError::Yield`] so the synchronous caller can decide what to do.
    pub fn send(
        &self,
        value: Value,
        payload: Option<&Arc<AsyncPayload>>,
    ) -> Result<(), RuntimeError> {
        match &self.transport {
            Some(transport) => self.send_parallel(transport, value, payload),
            None => {
                let mut wakeups = Wakeups::default();
                let result = self.send_cooperative(value, payload, &mut wakeups);
                wakeups.fire();
                result
            }
        }
    }

    /// Receive a value; returns nil once the channel is closed and drained
    pub fn receive(&self, payload: Option<&Arc<AsyncPayload>>) -> Result<Value, RuntimeError> {
        match &self.transport {
            Some(transport) => self.receive_parallel(transport, payload),
            None => {
                let mut wakeups = Wakeups::default();
                let result = self.receive_cooperative(payload, &mut wakeups);
                wakeups.fire();
                result
            }
        }
    }

    /// Non-blocking send; `Ok(false)` when the value could not be delivered
    pub fn try_send(&self, value: Value) -> Result<bool, RuntimeError> {
        let mut wakeups = Wakeups::default();
        let result = match &self.transport {
            Some(transport) => {
                let state = self.state.lock();
                if state.closed {
                    return Err(send_on_closed());
                }
                match transport.tx.lock().as_ref().map(|tx| tx.try_send(value)) {
                    Some(Ok(())) => {
                        wakeups.arms(&state.recv_arms);
                        Ok(true)
                    }
                    Some(Err(TrySendError::Full(_))) => Ok(false),
                    Some(Err(TrySendError::Disconnected(_))) | None => Err(send_on_closed()),
                }
            }
            None => {
                let mut state = self.state.lock();
                if state.closed {
                    Err(send_on_closed())
                } else if let Some(receiver) = state.pop_live_receiver() {
                    *receiver.slot.lock() = Some(value);
                    receiver.delivered.store(true, Ordering::SeqCst);
                    wakeups.tasks.push(receiver.payload.clone());
                    Ok(true)
                } else if state.queue.len() < self.capacity {
                    state.queue.push_back(value);
                    wakeups.arms(&state.recv_arms);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        };
        wakeups.fire();
        result
    }

    /// Non-blocking receive
    pub fn try_receive(&self) -> Option<Value> {
        let mut wakeups = Wakeups::default();
        let value = match &self.transport {
            Some(transport) => {
                let value = transport.rx.try_recv().ok();
                if value.is_some() {
                    wakeups.arms(&self.state.lock().send_arms);
                }
                value
            }
            None => {
                let mut state = self.state.lock();
                let value = match state.queue.pop_front() {
                    Some(value) => {
                        if let Some(next) = state.take_from_sender(&mut wakeups) {
                            state.queue.push_back(next);
                        }
                        Some(value)
                    }
                    None => state.take_from_sender(&mut wakeups),
                };
                if value.is_some() {
                    wakeups.arms(&state.send_arms);
                }
                value
            }
        };
        wakeups.fire();
        value
    }

    /// Close the channel; parked receivers observe nil, parked senders raise
    pub fn close(&self) -> Result<(), RuntimeError> {
        let mut wakeups = Wakeups::default();
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(RuntimeError::raise(
                    "ChannelClosed",
                    "close of closed channel",
                ));
            }
            state.closed = true;
            if let Some(transport) = &self.transport {
                transport.tx.lock().take();
            }
            for receiver in state.receivers.drain(..) {
                wakeups.tasks.push(receiver.payload.clone());
            }
            // Parked senders stay undelivered; their retry raises
            for sender in state.senders.drain(..) {
                wakeups.tasks.push(sender.payload.clone());
            }
            wakeups.arms(&state.send_arms);
            wakeups.arms(&state.recv_arms);
        }
        self.space.notify_all();
        trace!(channel = self.id, "channel closed");
        wakeups.fire();
        Ok(())
    }

    pub(crate) fn receive_ready(&self) -> bool {
        let state = self.state.lock();
        match &self.transport {
            Some(transport) => {
                state.closed || !transport.rx.is_empty() || state.waiting_senders > 0
            }
            None => state.closed || !state.queue.is_empty() || state.has_live_sender(),
        }
    }

    pub(crate) fn send_ready(&self) -> bool {
        let state = self.state.lock();
        match &self.transport {
            Some(transport) => {
                state.closed
                    || state.waiting_receivers > 0
                    || (self.capacity > 0 && transport.rx.len() < self.capacity)
            }
            None => {
                state.closed || state.has_live_receiver() || state.queue.len() < self.capacity
            }
        }
    }

    fn register(self: &Arc<Self>, direction: Direction, waker: &Waker) -> Registration {
        let id = {
            let mut state = self.state.lock();
            state.next_registration += 1;
            let id = state.next_registration;
            match direction {
                Direction::Send => state.send_arms.push((id, waker.clone())),
                Direction::Receive => state.recv_arms.push((id, waker.clone())),
            }
            id
        };
        let channel = self.clone();
        Registration::new(move || {
            let mut state = channel.state.lock();
            match direction {
                Direction::Send => state.send_arms.retain(|(r, _)| *r != id),
                Direction::Receive => state.recv_arms.retain(|(r, _)| *r != id),
            }
        })
    }

    fn send_cooperative(
        &self,
        value: Value,
        payload: Option<&Arc<AsyncPayload>>,
        wakeups: &mut Wakeups,
    ) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();

        if let Some(payload) = payload {
            if let Some(ChannelWait::Send(waiter)) = payload.take_channel_wait(self.id) {
                if waiter.delivered.load(Ordering::SeqCst) {
                    return Ok(());
                }
                if state.closed || payload.cancel_requested() {
                    state.senders.retain(|w| !Arc::ptr_eq(w, &waiter));
                    return Err(if state.closed {
                        send_on_closed()
                    } else {
                        RuntimeError::Cancelled
                    });
                }
                payload.set_channel_wait(self.id, ChannelWait::Send(waiter));
                payload.set_blocked(true);
                return Err(RuntimeError::Yield);
            }
        }

        if state.closed {
            return Err(send_on_closed());
        }
        if let Some(receiver) = state.pop_live_receiver() {
            *receiver.slot.lock() = Some(value);
            receiver.delivered.store(true, Ordering::SeqCst);
            wakeups.tasks.push(receiver.payload.clone());
            return Ok(());
        }
        if state.queue.len() < self.capacity {
            state.queue.push_back(value);
            wakeups.arms(&state.recv_arms);
            return Ok(());
        }

        let Some(payload) = payload else {
            return Err(RuntimeError::Yield);
        };
        if payload.cancel_requested() {
            return Err(RuntimeError::Cancelled);
        }
        let waiter = Arc::new(SendWaiter {
            payload: Arc::downgrade(payload),
            value: Mutex::new(Some(value)),
            delivered: AtomicBool::new(false),
        });
        state.senders.push_back(waiter.clone());
        payload.set_channel_wait(self.id, ChannelWait::Send(waiter));
        payload.set_blocked(true);
        wakeups.arms(&state.recv_arms);
        trace!(channel = self.id, task = payload.handle().id(), "sender parked");
        Err(RuntimeError::Yield)
    }

    fn receive_cooperative(
        &self,
        payload: Option<&Arc<AsyncPayload>>,
        wakeups: &mut Wakeups,
    ) -> Result<Value, RuntimeError> {
        let mut state = self.state.lock();

        if let Some(payload) = payload {
            if let Some(ChannelWait::Receive(waiter)) = payload.take_channel_wait(self.id) {
                if waiter.delivered.load(Ordering::SeqCst) {
                    return Ok(waiter.slot.lock().take().unwrap_or_default());
                }
                if state.closed || payload.cancel_requested() {
                    state.receivers.retain(|w| !Arc::ptr_eq(w, &waiter));
                    return if state.closed {
                        Ok(Value::Nil)
                    } else {
                        Err(RuntimeError::Cancelled)
                    };
                }
                payload.set_channel_wait(self.id, ChannelWait::Receive(waiter));
                payload.set_blocked(true);
                return Err(RuntimeError::Yield);
            }
        }

        if let Some(value) = state.queue.pop_front() {
            if let Some(next) = state.take_from_sender(wakeups) {
                state.queue.push_back(next);
            }
            wakeups.arms(&state.send_arms);
            return Ok(value);
        }
        if let Some(value) = state.take_from_sender(wakeups) {
            wakeups.arms(&state.send_arms);
            return Ok(value);
        }
        if state.closed {
            return Ok(Value::Nil);
        }

        let Some(payload) = payload else {
            return Err(RuntimeError::Yield);
        };
        if payload.cancel_requested() {
            return Err(RuntimeError::Cancelled);
        }
        let waiter = Arc::new(RecvWaiter {
            payload: Arc::downgrade(payload),
            slot: Mutex::new(None),
            delivered: AtomicBool::new(false),
        });
        state.receivers.push_back(waiter.clone());
        payload.set_channel_wait(self.id, ChannelWait::Receive(waiter));
        payload.set_blocked(true);
        wakeups.arms(&state.send_arms);
        trace!(channel = self.id, task = payload.handle().id(), "receiver parked");
        Err(RuntimeError::Yield)
    }

    /// Each attempt runs under the state lock, so nothing is delivered once
    /// `close` has run. Blocked senders never hold a transport handle, which
    /// lets `close` disconnect waiting receivers.
    fn send_parallel(
        &self,
        transport: &Transport,
        value: Value,
        payload: Option<&Arc<AsyncPayload>>,
    ) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        let mut value = value;
        let mut blocking = None;
        let result = loop {
            if state.closed {
                break Err(send_on_closed());
            }
            let attempt = match transport.tx.lock().as_ref() {
                Some(tx) => tx.try_send(value),
                None => break Err(send_on_closed()),
            };
            match attempt {
                Ok(()) => break Ok(()),
                Err(TrySendError::Disconnected(_)) => break Err(send_on_closed()),
                Err(TrySendError::Full(returned)) => value = returned,
            }
            if payload.is_some_and(|p| p.cancel_requested()) {
                break Err(RuntimeError::Cancelled);
            }
            if blocking.is_none() {
                blocking = Some(payload.map(|p| p.enter_blocking()));
                state.waiting_senders += 1;
                let mut wakeups = Wakeups::default();
                wakeups.arms(&state.recv_arms);
                parking_lot::MutexGuard::unlocked(&mut state, || wakeups.fire());
                continue;
            }
            self.space.wait_for(&mut state, SEND_RETRY_INTERVAL);
        };
        if blocking.is_some() {
            state.waiting_senders -= 1;
        }
        drop(state);
        drop(blocking);
        if result.is_ok() {
            self.wake_arms(Direction::Receive);
        }
        result
    }

    fn receive_parallel(
        &self,
        transport: &Transport,
        payload: Option<&Arc<AsyncPayload>>,
    ) -> Result<Value, RuntimeError> {
        match transport.rx.try_recv() {
            Ok(value) => {
                self.space.notify_all();
                self.wake_arms(Direction::Send);
                return Ok(value);
            }
            Err(TryRecvError::Disconnected) => return Ok(Value::Nil),
            Err(TryRecvError::Empty) => {}
        }

        self.state.lock().waiting_receivers += 1;
        self.space.notify_all();
        self.wake_arms(Direction::Send);
        let result = match payload {
            Some(payload) => {
                let _blocking = payload.enter_blocking();
                select! {
                    recv(transport.rx) -> received => Ok(received.unwrap_or_default()),
                    recv(payload.handle().token().signal()) -> _ => Err(RuntimeError::Cancelled),
                }
            }
            None => Ok(transport.rx.recv().unwrap_or_default()),
        };
        self.state.lock().waiting_receivers -= 1;
        if result.is_ok() {
            self.space.notify_all();
            self.wake_arms(Direction::Send);
        }
        result
    }

    fn wake_arms(&self, direction: Direction) {
        let mut wakeups = Wakeups::default();
        {
            let state = self.state.lock();
            match direction {
                Direction::Send => wakeups.arms(&state.send_arms),
                Direction::Receive => wakeups.arms(&state.recv_arms),
            }
        }
        wakeups.fire();
    }
}

/// `await` arm that receives from a channel
pub struct ChannelReceiveArm {
    channel: ChannelHandle,
}

impl ChannelReceiveArm {
    pub fn new(channel: ChannelHandle) -> Self {
        ChannelReceiveArm { channel }
    }
}

impl Awaitable for ChannelReceiveArm {
    fn is_ready(&self, _cx: &ArmContext<'_>) -> Result<bool, RuntimeError> {
        Ok(self.channel.receive_ready())
    }

    fn register(&self, _cx: &ArmContext<'_>, waker: &Waker) -> Result<Registration, RuntimeError> {
        Ok(self.channel.register(Direction::Receive, waker))
    }

    fn commit(&self, cx: &ArmContext<'_>) -> Result<Value, RuntimeError> {
        self.channel.receive(Some(cx.payload))
    }

    fn describe(&self) -> String {
        format!("receive channel#{}", self.channel.id())
    }
}

/// `await` arm that sends a value into a channel
pub struct ChannelSendArm {
    channel: ChannelHandle,
    value: Value,
}

impl ChannelSendArm {
    pub fn new(channel: ChannelHandle, value: Value) -> Self {
        ChannelSendArm { channel, value }
    }
}

impl Awaitable for ChannelSendArm {
    fn is_ready(&self, _cx: &ArmContext<'_>) -> Result<bool, RuntimeError> {
        Ok(self.channel.send_ready())
    }

    fn register(&self, _cx: &ArmContext<'_>, waker: &Waker) -> Result<Registration, RuntimeError> {
        Ok(self.channel.register(Direction::Send, waker))
    }

    fn commit(&self, cx: &ArmContext<'_>) -> Result<Value, RuntimeError> {
        self.channel.send(self.value.clone(), Some(cx.payload))?;
        Ok(Value::Nil)
    }

    fn describe(&self) -> String {
        format!("send channel#{}", self.channel.id())
    }
}
