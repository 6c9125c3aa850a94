//! Concurrency runtime: futures, executors, await arms, channels and mutexes

mod arms;
mod await_eval;
mod channel;
mod cooperative;
mod executor;
mod future;
mod handoff;
mod mutex;
mod parallel;
mod payload;

pub use arms::{DefaultArm, FutureArm, SleepArm, StructArm};
pub use await_eval::{
    ArmContext, AwaitEvalState, Awaitable, Registration, Waker, evaluate_await, to_awaitable,
};
pub use channel::{Channel, ChannelHandle, ChannelReceiveArm, ChannelSendArm};
pub use cooperative::CooperativeExecutor;
pub use executor::{Executor, TaskFn};
pub use future::{
    Awaiter, CancelToken, Future, FutureHandle, FutureOutcome, FutureStatus,
};
pub use handoff::{HandoffBody, HandoffTask};
pub use mutex::{MutexCell, MutexHandle, MutexLockArm};
pub use parallel::ParallelExecutor;
pub use payload::{AsyncPayload, BlockingGuard, PayloadHooks};
