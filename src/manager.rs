use crate::channel::ChannelFactory;
use crate::config::{ErrorPolicy, PoolConfig, Power};
use crate::error::{FailureKind, PoolError, TaskFailure};
use crate::progress::Progress;
use crate::report::{RunReport, WorkerSummary};
use crate::scheduler::{EventLoopScheduler, FiberScheduler, Scheduler, WorkerExit};
use crate::sink::ResultSink;
use crate::task::TaskHandler;
use crate::task_queue::{PendingQueue, TaskLoader};

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument, Span};

lazy_static::lazy_static! {
  static ref NEXT_RUN_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

/// Workers are Tokio tasks on a runtime owned by the pool; `speedup` blocks.
pub type FiberPool<T, H> = WorkerPool<T, H, FiberScheduler>;

/// Workers share one channel and are polled by the awaiting task; `subvert` is async.
/// Neither the handler nor the channel has to be `Send`.
pub type EventLoopPool<T, H, F> = WorkerPool<T, H, EventLoopScheduler<F>>;

/// Worker id -> tasks taken so far in the current run.
type ActiveWorkers = Arc<DashMap<usize, usize>>;

/// Drains a fixed task collection with a bounded number of workers.
///
/// Each run reloads the collection, so a pool can be run repeatedly. Outputs
/// accumulate across runs until [`WorkerPool::drain`] is called.
pub struct WorkerPool<T, H: TaskHandler<T>, S> {
  pool_name: Arc<String>,
  config: PoolConfig,
  loader: TaskLoader<T>,
  sink: ResultSink<H::Output>,
  handler: Arc<H>,
  scheduler: S,
  effective_power: AtomicUsize,
  active_workers: ActiveWorkers,
  running: AtomicBool,
}

impl<T, H: TaskHandler<T>, S: Scheduler> fmt::Debug for WorkerPool<T, H, S> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("WorkerPool")
      .field("pool_name", &self.pool_name)
      .field("scheduler", &self.scheduler.name())
      .field("max_queue_size", &self.loader.max_queue_size())
      .field("pending", &self.loader.pending())
      .field("results", &self.sink.len())
      .field("effective_power", &self.effective_power.load(AtomicOrdering::SeqCst))
      .field("running", &self.running.load(AtomicOrdering::SeqCst))
      .finish_non_exhaustive()
  }
}

/// The parameters of one non-empty run, fixed before any worker starts.
#[derive(Debug, Clone, Copy)]
struct RunPlan {
  run_id: u64,
  total: usize,
  power: usize,
}

impl RunPlan {
  fn is_empty(&self) -> bool {
    self.total == 0
  }

  fn span(&self, pool_name: &str) -> Span {
    info_span!(
      "pool_run",
      pool_name = %pool_name,
      run_id = self.run_id,
      total = self.total,
      power = self.power
    )
  }
}

/// Clears the pool's `running` flag however the run ends.
struct RunGuard<'a> {
  running: &'a AtomicBool,
}

impl Drop for RunGuard<'_> {
  fn drop(&mut self) {
    self.running.store(false, AtomicOrdering::SeqCst);
  }
}

/// Keeps a worker listed as active until its loop is left or its future is dropped.
struct ActiveWorkerGuard {
  active: ActiveWorkers,
  worker_id: usize,
}

impl ActiveWorkerGuard {
  fn enter(active: ActiveWorkers, worker_id: usize) -> Self {
    active.insert(worker_id, 0);
    Self { active, worker_id }
  }

  fn record_task(&self) {
    if let Some(mut taken) = self.active.get_mut(&self.worker_id) {
      *taken += 1;
    }
  }
}

impl Drop for ActiveWorkerGuard {
  fn drop(&mut self) {
    self.active.remove(&self.worker_id);
  }
}

/// Closes the run's shared channel through its factory when dropped, which
/// covers a `subvert` future abandoned mid-run as well as every normal exit.
struct ChannelGuard<'a, F: ChannelFactory> {
  factory: &'a F,
  channel: Arc<F::Channel>,
  pool_name: &'a str,
}

impl<F: ChannelFactory> ChannelGuard<'_, F> {
  fn shared(&self) -> Arc<F::Channel> {
    self.channel.clone()
  }
}

impl<F: ChannelFactory> Drop for ChannelGuard<'_, F> {
  fn drop(&mut self) {
    let factory = self.factory;
    let channel = &self.channel;
    if std::panic::catch_unwind(AssertUnwindSafe(|| factory.close(channel))).is_err() {
      error!(pool_name = %self.pool_name, "Closing the shared channel panicked. Ignoring.");
    } else {
      debug!(pool_name = %self.pool_name, "Shared channel closed.");
    }
  }
}

/// Everything a worker needs, detached from the pool so the loop is `'static`.
struct WorkerParts<T, H: TaskHandler<T>> {
  worker_id: usize,
  queue: PendingQueue<T>,
  sink: ResultSink<H::Output>,
  handler: Arc<H>,
  ctx: Arc<H::Context>,
  active: ActiveWorkers,
  policy: ErrorPolicy,
  cancel: CancellationToken,
  span: Span,
}

/// The worker loop of `parts`, instrumented with its `pool_worker` span.
fn worker_loop<T, H>(parts: WorkerParts<T, H>) -> impl Future<Output = WorkerSummary> + 'static
where
  T: 'static,
  H: TaskHandler<T>,
{
  let span = parts.span.clone();
  run_worker_loop(parts).instrument(span)
}

async fn run_worker_loop<T, H>(parts: WorkerParts<T, H>) -> WorkerSummary
where
  T: 'static,
  H: TaskHandler<T>,
{
  let WorkerParts {
    worker_id,
    queue,
    sink,
    handler,
    ctx,
    active,
    policy,
    cancel,
    span: _,
  } = parts;
  let active_guard = ActiveWorkerGuard::enter(active, worker_id);
  let mut summary = WorkerSummary::new(worker_id);
  debug!("Worker started.");

  loop {
    if cancel.is_cancelled() {
      debug!("Run cancelled. Worker stops taking tasks.");
      break;
    }
    // An empty pop ends the loop; it is never an error.
    let Some(task) = queue.pop() else {
      break;
    };
    summary.handled += 1;
    active_guard.record_task();

    let outcome = AssertUnwindSafe(async { handler.handle(task, ctx.clone()).await })
      .catch_unwind()
      .await;

    let failure = match outcome {
      Ok(Ok(Some(output))) => {
        sink.push(output);
        summary.produced += 1;
        None
      }
      Ok(Ok(None)) => None,
      Ok(Err(handler_error)) => {
        warn!(error = %handler_error, "Task handler returned an error.");
        Some(FailureKind::Error(handler_error.to_string()))
      }
      Err(_panic_payload) => {
        error!("Task handler panicked.");
        Some(FailureKind::Panicked)
      }
    };

    match failure {
      None => trace!(handled = summary.handled, "Task completed."),
      Some(kind) => {
        summary.failures.push(TaskFailure { worker_id, kind });
        if policy == ErrorPolicy::FailFast {
          debug!("Fail-fast policy: cancelling the run.");
          cancel.cancel();
          break;
        }
      }
    }
  }

  debug!(
    handled = summary.handled,
    produced = summary.produced,
    failures = summary.failures.len(),
    "Worker finished."
  );
  summary
}

impl<T, H, S> WorkerPool<T, H, S>
where
  T: Clone + 'static,
  H: TaskHandler<T>,
  S: Scheduler,
{
  fn assemble(tasks: Vec<T>, handler: H, scheduler: S, config: PoolConfig) -> Self {
    info!(
      pool_name = %config.pool_name,
      tasks = tasks.len(),
      power = config.power,
      scheduler = scheduler.name(),
      "Worker pool created."
    );
    Self {
      pool_name: Arc::new(config.pool_name.clone()),
      effective_power: AtomicUsize::new(config.power),
      config,
      loader: TaskLoader::new(tasks),
      sink: ResultSink::new(),
      handler: Arc::new(handler),
      scheduler,
      active_workers: Arc::new(DashMap::new()),
      running: AtomicBool::new(false),
    }
  }

  pub fn name(&self) -> &str {
    &self.pool_name
  }

  pub fn config(&self) -> &PoolConfig {
    &self.config
  }

  pub fn handler(&self) -> &H {
    &self.handler
  }

  pub fn scheduler(&self) -> &S {
    &self.scheduler
  }

  /// Number of tasks the pool was constructed with.
  pub fn task_count(&self) -> usize {
    self.loader.task_count()
  }

  /// Size of the pending queue right after the most recent load.
  pub fn max_queue_size(&self) -> usize {
    self.loader.max_queue_size()
  }

  /// Tasks still waiting for a worker.
  pub fn pending_count(&self) -> usize {
    self.loader.pending()
  }

  /// Workers used by the most recent non-empty run, or the configured
  /// default before the first one.
  pub fn effective_power(&self) -> usize {
    self.effective_power.load(AtomicOrdering::SeqCst)
  }

  /// Workers currently inside their task loop.
  pub fn active_worker_count(&self) -> usize {
    self.active_workers.len()
  }

  /// Results waiting to be drained.
  pub fn result_count(&self) -> usize {
    self.sink.len()
  }

  pub fn progress(&self) -> Progress {
    Progress::compute(
      self.config.progress_style,
      self.loader.max_queue_size(),
      self.loader.pending(),
      self.effective_power(),
    )
  }

  /// Takes every accumulated result. A second call returns an empty `Vec`.
  pub fn drain(&self) -> Vec<H::Output> {
    let drained = self.sink.drain();
    debug!(pool_name = %self.pool_name, count = drained.len(), "Drained results.");
    drained
  }

  fn begin_run(&self) -> Result<RunGuard<'_>, PoolError> {
    self
      .running
      .compare_exchange(false, true, AtomicOrdering::SeqCst, AtomicOrdering::SeqCst)
      .map_err(|_| {
        warn!(pool_name = %self.pool_name, "Run requested while another run is in progress.");
        PoolError::RunInProgress
      })?;
    Ok(RunGuard {
      running: &self.running,
    })
  }

  /// Validates the request, loads the tasks and fixes the worker count.
  fn prepare(&self, requested: Option<Power>) -> Result<RunPlan, PoolError> {
    let requested = requested.map(Power::validate).transpose()?;
    let run_id = NEXT_RUN_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
    let total = self.loader.load();

    if total == 0 {
      info!(pool_name = %self.pool_name, %run_id, "No tasks loaded. Skipping run.");
      return Ok(RunPlan {
        run_id,
        total,
        power: 0,
      });
    }

    let power = requested
      .unwrap_or(Power::Fixed(self.config.power))
      .clamp_to(total);
    self.effective_power.store(power, AtomicOrdering::SeqCst);
    debug!(pool_name = %self.pool_name, %run_id, total, power, ?requested, "Tasks loaded.");

    Ok(RunPlan { run_id, total, power })
  }

  /// Builds one set of worker parts per worker of `plan`, all sharing `ctx`.
  fn worker_parts(
    &self,
    plan: &RunPlan,
    ctx: Arc<H::Context>,
    cancel: &CancellationToken,
  ) -> Vec<WorkerParts<T, H>> {
    info!(pool_name = %self.pool_name, scheduler = self.scheduler.name(), "Dispatching workers.");
    (0..plan.power)
      .map(|worker_id| WorkerParts {
        worker_id,
        queue: self.loader.queue().clone(),
        sink: self.sink.clone(),
        handler: self.handler.clone(),
        ctx: ctx.clone(),
        active: self.active_workers.clone(),
        policy: self.config.error_policy,
        cancel: cancel.clone(),
        span: info_span!(
          "pool_worker",
          pool_name = %self.pool_name,
          run_id = plan.run_id,
          %worker_id
        ),
      })
      .collect()
  }

  /// Runs the cleanup hook once every worker has exited, then turns the
  /// exits into a report.
  fn finish_run(&self, plan: RunPlan, exits: Vec<WorkerExit>, started: Instant) -> Result<RunReport, PoolError> {
    self.run_cleanup();

    let mut report = RunReport {
      run_id: plan.run_id,
      total: plan.total,
      power: plan.power,
      ..RunReport::default()
    };
    for (worker_id, exit) in exits.into_iter().enumerate() {
      match exit {
        Ok(summary) => report.absorb(summary),
        Err(reason) => report.failures.push(TaskFailure {
          worker_id,
          kind: FailureKind::Aborted(reason),
        }),
      }
    }
    report.elapsed = started.elapsed();

    self.conclude(report)
  }

  fn run_cleanup(&self) {
    let handler = &self.handler;
    if std::panic::catch_unwind(AssertUnwindSafe(|| handler.cleanup())).is_err() {
      error!(pool_name = %self.pool_name, "Cleanup hook panicked. Ignoring.");
    }
  }

  fn conclude(&self, report: RunReport) -> Result<RunReport, PoolError> {
    if self.config.error_policy == ErrorPolicy::FailFast && !report.failures.is_empty() {
      let handler_failed = report.failures.iter().any(|f| f.kind.is_handler_failure());
      error!(
        pool_name = %self.pool_name,
        handled = report.handled,
        failures = report.failures.len(),
        handler_failed,
        left_pending = self.loader.pending(),
        "Run failed."
      );
      let failures = report.failures;
      return Err(if handler_failed {
        PoolError::HandlerFailed { failures }
      } else {
        PoolError::WorkerAborted { failures }
      });
    }

    info!(
      pool_name = %self.pool_name,
      handled = report.handled,
      produced = report.produced,
      failures = report.failures.len(),
      elapsed_ms = report.elapsed.as_millis() as u64,
      "Run finished."
    );
    Ok(report)
  }
}

impl<T, H> WorkerPool<T, H, FiberScheduler>
where
  T: Clone + Send + 'static,
  H: TaskHandler<T> + Send + Sync,
  H::Context: Send + Sync,
  H::Output: Send,
  H::Error: Send,
  H::Future: Send,
{
  /// Builds a fiber pool and its runtime. Fails on an invalid config.
  ///
  /// The pool owns a Tokio runtime, so it must be dropped outside of any
  /// async context.
  pub fn new(tasks: Vec<T>, handler: H, config: PoolConfig) -> Result<Self, PoolError> {
    config.validate()?;
    let scheduler = FiberScheduler::new(config.runtime_threads, &config.pool_name)?;
    Ok(Self::assemble(tasks, handler, scheduler, config))
  }

  /// Runs every task with a default-constructed context, blocking the
  /// calling thread until all workers have finished.
  pub fn speedup(&self, power: Option<Power>) -> Result<RunReport, PoolError>
  where
    H::Context: Default,
  {
    self.speedup_with(power, H::Context::default())
  }

  /// Runs every task, handing `args` to each handler call. Blocks the calling
  /// thread; must not be called from inside an async context.
  pub fn speedup_with(&self, power: Option<Power>, args: H::Context) -> Result<RunReport, PoolError> {
    let _guard = self.begin_run()?;
    let plan = self.prepare(power)?;
    if plan.is_empty() {
      return Ok(RunReport::empty(plan.run_id));
    }
    let span = plan.span(&self.pool_name);
    let _entered = span.enter();

    let started = Instant::now();
    let cancel = CancellationToken::new();
    let workers: Vec<_> = self
      .worker_parts(&plan, Arc::new(args), &cancel)
      .into_iter()
      .map(worker_loop)
      .collect();
    let exits = self.scheduler.block_on(self.scheduler.dispatch(workers));
    self.finish_run(plan, exits, started)
  }
}

impl<T, H, F> WorkerPool<T, H, EventLoopScheduler<F>>
where
  T: Clone + 'static,
  H: TaskHandler<T>,
  F: ChannelFactory<Channel = H::Context>,
{
  pub fn new(tasks: Vec<T>, handler: H, factory: F, config: PoolConfig) -> Result<Self, PoolError> {
    config.validate()?;
    Ok(Self::assemble(tasks, handler, EventLoopScheduler::new(factory), config))
  }

  pub fn factory(&self) -> &F {
    self.scheduler.factory()
  }

  /// Runs every task on the calling task, sharing one freshly opened channel
  /// between all workers. Once opened, the channel is closed through the
  /// factory on every exit, including when this future is dropped early.
  pub async fn subvert(&self, power: Option<Power>) -> Result<RunReport, PoolError> {
    let _guard = self.begin_run()?;
    let plan = self.prepare(power)?;
    if plan.is_empty() {
      return Ok(RunReport::empty(plan.run_id));
    }
    let span = plan.span(&self.pool_name);
    self.run_with_channel(plan).instrument(span).await
  }

  async fn run_with_channel(&self, plan: RunPlan) -> Result<RunReport, PoolError> {
    let factory = self.scheduler.factory();
    let channel = match factory.open().await {
      Ok(channel) => ChannelGuard {
        factory,
        channel: Arc::new(channel),
        pool_name: &self.pool_name,
      },
      Err(open_error) => {
        error!(pool_name = %self.pool_name, error = %open_error, "Failed to open shared channel. No workers dispatched.");
        return Err(PoolError::ResourceAcquisition(open_error.to_string()));
      }
    };
    debug!(pool_name = %self.pool_name, "Shared channel opened.");

    let started = Instant::now();
    let cancel = CancellationToken::new();
    let workers: Vec<_> = self
      .worker_parts(&plan, channel.shared(), &cancel)
      .into_iter()
      .map(worker_loop)
      .collect();
    let exits = self.scheduler.dispatch(workers).await;
    let outcome = self.finish_run(plan, exits, started);
    drop(channel);
    outcome
  }
}
