//! A Tokio-based worker pool that drains a fixed collection of tasks with a
//! bounded number of workers, collecting handler outputs for the caller.
//!
//! Two schedulers share one load/clamp/dispatch/drain lifecycle:
//! [`FiberPool`] runs workers as tasks on its own multi-threaded runtime and
//! blocks the caller, while [`EventLoopPool`] polls every worker from the
//! awaiting task and shares a single channel between them.

mod channel;
mod config;
mod error;
mod manager;
mod progress;
mod report;
mod scheduler;
mod sink;
mod task;
mod task_queue;

#[cfg(feature = "http")]
pub use channel::HttpClientFactory;
pub use channel::ChannelFactory;
pub use config::{ErrorPolicy, PoolConfig, Power};
pub use error::{FailureKind, PoolError, TaskFailure};
pub use manager::{EventLoopPool, FiberPool, WorkerPool};
pub use progress::{Progress, ProgressStyle, PENDING_SENTINEL};
pub use report::{RunReport, WorkerSummary};
pub use scheduler::{EventLoopScheduler, FiberScheduler, Scheduler, WorkerExit};
pub use task::{handler_fn, HandlerFn, HandlerResult, TaskHandler};
