use crate::error::PoolError;
use crate::report::WorkerSummary;

use std::fmt;
use std::future::Future;

use futures::future;
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, error};

/// Result of driving one worker to completion. `Err` carries the reason a
/// worker was torn down before returning its summary.
pub type WorkerExit = Result<WorkerSummary, String>;

/// Decides how the workers of a run are executed.
///
/// Each scheduler offers a `dispatch` that drives every worker to a terminal
/// state, reports their exits in the order the workers were given, and never
/// cancels siblings when one of them ends early. `dispatch` is inherent
/// rather than part of this trait because the schedulers put different
/// bounds on the worker futures: fibers must be `Send`, event-loop workers
/// need not be.
pub trait Scheduler: 'static {
  fn name(&self) -> &'static str;
}

/// Spawns every worker as a Tokio task (a green thread) on a multi-threaded
/// runtime owned by the scheduler.
pub struct FiberScheduler {
  runtime: Runtime,
  threads: usize,
}

impl fmt::Debug for FiberScheduler {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FiberScheduler")
      .field("threads", &self.threads)
      .finish()
  }
}

impl FiberScheduler {
  pub fn new(threads: usize, pool_name: &str) -> Result<Self, PoolError> {
    if threads == 0 {
      return Err(PoolError::Configuration(
        "runtime_threads must be at least 1".to_string(),
      ));
    }
    let runtime = Builder::new_multi_thread()
      .worker_threads(threads)
      .thread_name(format!("{}-fiber", pool_name))
      .enable_all()
      .build()
      .map_err(|e| PoolError::Configuration(format!("failed to build fiber runtime: {}", e)))?;
    debug!(pool_name = %pool_name, threads, "Fiber runtime started.");
    Ok(Self { runtime, threads })
  }

  /// Blocks the current thread on `fut`. Panics if called from within an
  /// async context, like any Tokio `block_on`.
  pub(crate) fn block_on<F: Future>(&self, fut: F) -> F::Output {
    self.runtime.block_on(fut)
  }

  /// Spawns every worker onto the runtime, then waits for all of them.
  pub async fn dispatch<W>(&self, workers: Vec<W>) -> Vec<WorkerExit>
  where
    W: Future<Output = WorkerSummary> + Send + 'static,
  {
    let handles: Vec<_> = workers
      .into_iter()
      .map(|worker| self.runtime.spawn(worker))
      .collect();

    future::join_all(handles)
      .await
      .into_iter()
      .map(|joined| {
        joined.map_err(|join_error| {
          error!("Fiber worker did not finish cleanly: {}", join_error);
          join_error.to_string()
        })
      })
      .collect()
  }
}

impl Scheduler for FiberScheduler {
  fn name(&self) -> &'static str {
    "fiber"
  }
}

/// Polls every worker from the awaiting task itself: one logical thread,
/// switching only where a handler awaits.
#[derive(Debug)]
pub struct EventLoopScheduler<F> {
  factory: F,
}

impl<F> EventLoopScheduler<F> {
  pub fn new(factory: F) -> Self {
    Self { factory }
  }

  pub fn factory(&self) -> &F {
    &self.factory
  }

  /// Polls every worker from the current task until all have finished.
  pub async fn dispatch<W>(&self, workers: Vec<W>) -> Vec<WorkerExit>
  where
    W: Future<Output = WorkerSummary>,
  {
    future::join_all(workers).await.into_iter().map(Ok).collect()
  }
}

impl<F: 'static> Scheduler for EventLoopScheduler<F> {
  fn name(&self) -> &'static str {
    "event_loop"
  }
}
