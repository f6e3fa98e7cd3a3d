use accelerator::{
  handler_fn, ErrorPolicy, FailureKind, FiberPool, HandlerResult, PoolConfig, PoolError, Power, Progress, TaskHandler,
};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashSet;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

// Helper to initialize tracing for tests (call once per test run, not per test function)
fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,accelerator=debug"));

    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

fn test_config(pool_name: &str) -> PoolConfig {
  PoolConfig::new().with_pool_name(pool_name).with_runtime_threads(2)
}

/// Tracks how many handler calls overlap, and every task it saw.
#[derive(Default)]
struct Recorder {
  seen: Mutex<Vec<u32>>,
  in_flight: AtomicUsize,
  peak: AtomicUsize,
}

impl Recorder {
  fn enter(&self, task: u32) {
    self.seen.lock().push(task);
    let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    self.peak.fetch_max(now, Ordering::SeqCst);
  }

  fn leave(&self) {
    self.in_flight.fetch_sub(1, Ordering::SeqCst);
  }
}

/// What a [`PageFetcher`] fails on, and what it has done so far.
#[derive(Default)]
struct FetchState {
  fail_on: HashSet<u32>,
  panic_on: HashSet<u32>,
  calls: AtomicUsize,
  cleanups: AtomicUsize,
  panic_in_cleanup: bool,
}

/// A handler with a cleanup hook, failing on selected tasks.
#[derive(Clone)]
struct PageFetcher(Arc<FetchState>);

impl PageFetcher {
  fn new() -> Self {
    Self::with(FetchState::default())
  }

  fn with(state: FetchState) -> Self {
    Self(Arc::new(state))
  }
}

impl Deref for PageFetcher {
  type Target = FetchState;

  fn deref(&self) -> &FetchState {
    &self.0
  }
}

impl TaskHandler<u32> for PageFetcher {
  type Context = ();
  type Output = String;
  type Error = String;
  type Future = BoxFuture<'static, HandlerResult<String, String>>;

  fn handle(&self, task: u32, _ctx: Arc<()>) -> Self::Future {
    let state = self.0.clone();
    Box::pin(async move {
      state.calls.fetch_add(1, Ordering::SeqCst);
      tokio::time::sleep(Duration::from_millis(2)).await;
      if state.panic_on.contains(&task) {
        panic!("page {} exploded", task);
      }
      if state.fail_on.contains(&task) {
        return Err(format!("page {} unreachable", task));
      }
      Ok(Some(format!("page-{}", task)))
    })
  }

  fn cleanup(&self) {
    self.cleanups.fetch_add(1, Ordering::SeqCst);
    if self.panic_in_cleanup {
      panic!("cleanup failed");
    }
  }
}

#[test]
fn test_doubling_scenario_yields_permutation() {
  setup_tracing_for_test();
  let handler = handler_fn(|n: u64, _ctx: Arc<()>| async move { Ok::<_, String>(Some(n * 2)) });
  let pool = FiberPool::new(vec![1u64, 2, 3, 4, 5], handler, test_config("fiber_doubling")).unwrap();

  let report = pool.speedup(Some(Power::Fixed(2))).unwrap();
  assert_eq!(report.total, 5);
  assert_eq!(report.power, 2);
  assert_eq!(report.handled, 5);
  assert_eq!(report.produced, 5);
  assert!(report.is_clean());
  assert_eq!(pool.max_queue_size(), 5);
  assert_eq!(pool.pending_count(), 0);

  let mut results = pool.drain();
  results.sort_unstable();
  assert_eq!(results, vec![2, 4, 6, 8, 10]);
}

#[test]
fn test_speedup_with_forwards_args_to_every_call() {
  setup_tracing_for_test();
  let num_tasks = 300u32;
  let handler = handler_fn(|n: u32, recorder: Arc<Arc<Recorder>>| async move {
    recorder.enter(n);
    let delay_ms = rand::rng().random_range(0..3u64);
    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    recorder.leave();
    Ok::<_, String>(None::<()>)
  });
  let pool = FiberPool::new((0..num_tasks).collect(), handler, test_config("fiber_args")).unwrap();

  let recorder = Arc::new(Recorder::default());
  let report = pool.speedup_with(Some(Power::Fixed(8)), recorder.clone()).unwrap();
  assert_eq!(report.handled, num_tasks as usize);
  assert_eq!(report.produced, 0);
  assert!(pool.drain().is_empty(), "handlers returning None produce no results");
  assert_eq!(pool.max_queue_size(), num_tasks as usize);

  let seen = recorder.seen.lock().clone();
  let unique: HashSet<_> = seen.iter().copied().collect();
  assert_eq!(seen.len(), num_tasks as usize);
  assert_eq!(unique.len(), num_tasks as usize);
  assert!(recorder.peak.load(Ordering::SeqCst) <= 8);
  assert_eq!(recorder.in_flight.load(Ordering::SeqCst), 0);
}

#[test]
fn test_tasks_seen_once_and_concurrency_bounded() {
  setup_tracing_for_test();
  let recorder = Arc::new(Recorder::default());
  let handler = {
    let recorder = recorder.clone();
    handler_fn(move |n: u32, _ctx: Arc<()>| {
      let recorder = recorder.clone();
      async move {
        recorder.enter(n);
        tokio::time::sleep(Duration::from_millis(5)).await;
        recorder.leave();
        Ok::<_, String>(Some(n))
      }
    })
  };
  let pool = FiberPool::new((0..40).collect(), handler, test_config("fiber_bounded")).unwrap();

  pool.speedup(Some(Power::Fixed(4))).unwrap();

  let seen = recorder.seen.lock().clone();
  let unique: HashSet<_> = seen.iter().copied().collect();
  assert_eq!(seen.len(), 40);
  assert_eq!(unique.len(), 40);
  assert!(recorder.peak.load(Ordering::SeqCst) <= 4);
  assert_eq!(pool.drain().len(), 40);
}

#[test]
fn test_requested_power_clamps_to_task_count() {
  setup_tracing_for_test();
  let recorder = Arc::new(Recorder::default());
  let handler = {
    let recorder = recorder.clone();
    handler_fn(move |n: u32, _ctx: Arc<()>| {
      let recorder = recorder.clone();
      async move {
        recorder.enter(n);
        tokio::time::sleep(Duration::from_millis(20)).await;
        recorder.leave();
        Ok::<_, String>(Some(n))
      }
    })
  };
  let pool = FiberPool::new(vec![1, 2, 3], handler, test_config("fiber_clamp")).unwrap();

  let report = pool.speedup(Some(Power::Fixed(100))).unwrap();
  assert_eq!(report.power, 3);
  assert_eq!(pool.effective_power(), 3);
  assert!(recorder.peak.load(Ordering::SeqCst) <= 3);

  let report = pool.speedup(Some(Power::Full)).unwrap();
  assert_eq!(report.power, 3);
}

#[test]
fn test_default_power_comes_from_config() {
  setup_tracing_for_test();
  let handler = handler_fn(|n: u32, _ctx: Arc<()>| async move { Ok::<_, String>(Some(n)) });
  let config = test_config("fiber_default_power").with_power(3);
  let pool = FiberPool::new((0..10).collect(), handler, config).unwrap();
  assert_eq!(pool.effective_power(), 3);

  let report = pool.speedup(None).unwrap();
  assert_eq!(report.power, 3);
}

#[test]
fn test_empty_collection_returns_immediately() {
  setup_tracing_for_test();
  let pool = FiberPool::new(Vec::<u32>::new(), PageFetcher::new(), test_config("fiber_empty")).unwrap();
  let before = pool.progress().to_string();

  let report = pool.speedup(Some(Power::Fixed(4))).unwrap();
  assert!(report.is_empty_run());
  assert_eq!(report.handled, 0);
  assert_eq!(pool.max_queue_size(), 0);
  assert_eq!(pool.progress().to_string(), before);
  assert!(pool.drain().is_empty());
  assert_eq!(pool.handler().calls.load(Ordering::SeqCst), 0);
  assert_eq!(pool.handler().cleanups.load(Ordering::SeqCst), 0, "no cleanup for an empty run");
}

#[test]
fn test_drain_twice_returns_everything_then_nothing() {
  setup_tracing_for_test();
  let pool = FiberPool::new(vec![1, 2, 3, 4], PageFetcher::new(), test_config("fiber_drain_twice")).unwrap();
  pool.speedup(Some(Power::Fixed(2))).unwrap();

  let first = pool.drain();
  assert_eq!(first.len(), 4);
  assert!(first.contains(&"page-3".to_string()));
  assert!(pool.drain().is_empty());
  assert_eq!(pool.result_count(), 0);
}

#[test]
fn test_reuse_reloads_tasks_and_keeps_undrained_results() {
  setup_tracing_for_test();
  let pool = FiberPool::new(vec![10, 20, 30], PageFetcher::new(), test_config("fiber_reuse")).unwrap();

  pool.speedup(Some(Power::Fixed(2))).unwrap();
  assert_eq!(pool.result_count(), 3);

  let second = pool.speedup(Some(Power::Fixed(3))).unwrap();
  assert_eq!(second.total, 3);
  assert_eq!(pool.max_queue_size(), 3);
  assert_eq!(pool.result_count(), 6, "results are not cleared between runs");
  assert_eq!(pool.handler().cleanups.load(Ordering::SeqCst), 2);

  assert_eq!(pool.drain().len(), 6);
  pool.speedup(None).unwrap();
  assert_eq!(pool.drain().len(), 3);
}

#[test]
fn test_collect_policy_records_failures_and_continues() {
  setup_tracing_for_test();
  let handler = PageFetcher::with(FetchState {
    fail_on: HashSet::from([2]),
    panic_on: HashSet::from([4]),
    ..FetchState::default()
  });
  let pool = FiberPool::new(vec![1, 2, 3, 4, 5], handler, test_config("fiber_collect")).unwrap();

  let report = pool.speedup(Some(Power::Fixed(2))).unwrap();
  assert_eq!(report.handled, 5);
  assert_eq!(report.produced, 3);
  assert_eq!(report.succeeded(), 3);
  assert_eq!(report.failures.len(), 2);
  assert!(report
    .failures
    .iter()
    .any(|f| f.kind == FailureKind::Error("page 2 unreachable".to_string())));
  assert!(report.failures.iter().any(|f| f.kind == FailureKind::Panicked));
  assert_eq!(pool.handler().cleanups.load(Ordering::SeqCst), 1);

  let mut pages = pool.drain();
  pages.sort();
  assert_eq!(pages, vec!["page-1", "page-3", "page-5"]);
}

#[test]
fn test_fail_fast_stops_dispatch_and_still_cleans_up() {
  setup_tracing_for_test();
  let handler = PageFetcher::with(FetchState {
    fail_on: HashSet::from([3]),
    ..FetchState::default()
  });
  let config = test_config("fiber_fail_fast").with_error_policy(ErrorPolicy::FailFast);
  let pool = FiberPool::new((1..=10).collect(), handler, config).unwrap();

  let result = pool.speedup(Some(Power::Fixed(1)));
  match result {
    Err(PoolError::HandlerFailed { failures }) => {
      assert_eq!(failures.len(), 1);
      assert_eq!(failures[0].kind, FailureKind::Error("page 3 unreachable".to_string()));
    }
    other => panic!("Expected HandlerFailed, got {:?}", other),
  }
  assert_eq!(pool.handler().calls.load(Ordering::SeqCst), 3);
  assert_eq!(pool.pending_count(), 7, "tasks after the failure are never dispatched");
  assert_eq!(pool.handler().cleanups.load(Ordering::SeqCst), 1);
  assert_eq!(pool.drain(), vec!["page-1", "page-2"]);

  // The next run starts from a fresh snapshot.
  let _ = pool.speedup(Some(Power::Fixed(1)));
  assert_eq!(pool.max_queue_size(), 10);
}

#[test]
fn test_panicking_cleanup_does_not_escape() {
  setup_tracing_for_test();
  let handler = PageFetcher::with(FetchState {
    panic_in_cleanup: true,
    ..FetchState::default()
  });
  let pool = FiberPool::new(vec![1, 2], handler, test_config("fiber_cleanup_panic")).unwrap();

  let report = pool.speedup(None).unwrap();
  assert_eq!(report.produced, 2);
  assert_eq!(pool.handler().cleanups.load(Ordering::SeqCst), 1);
}

#[test]
fn test_zero_power_is_rejected_before_dispatch() {
  setup_tracing_for_test();
  let pool = FiberPool::new(vec![1, 2, 3], PageFetcher::new(), test_config("fiber_zero_power")).unwrap();

  let result = pool.speedup(Some(Power::Fixed(0)));
  assert!(matches!(result, Err(PoolError::Configuration(_))));
  assert_eq!(pool.handler().calls.load(Ordering::SeqCst), 0);
  assert_eq!(pool.max_queue_size(), 0, "nothing is loaded for a rejected run");

  let bad_config = test_config("fiber_zero_default").with_power(0);
  assert!(matches!(
    FiberPool::new(vec![1u32], PageFetcher::new(), bad_config),
    Err(PoolError::Configuration(_))
  ));
}

#[test]
fn test_progress_reports_ramp_up_then_fraction() {
  setup_tracing_for_test();
  let pool = FiberPool::new((0..6).collect(), PageFetcher::new(), test_config("fiber_progress").with_power(2)).unwrap();
  assert!(pool.progress().is_pending());
  assert_eq!(pool.progress().to_string(), "__pending__");

  pool.speedup(None).unwrap();
  assert_eq!(pool.progress().to_string(), "6/6");
}

#[test]
fn test_overlapping_run_is_rejected() {
  setup_tracing_for_test();
  let handler = handler_fn(|n: u32, _ctx: Arc<()>| async move {
    tokio::time::sleep(Duration::from_millis(30)).await;
    Ok::<_, String>(Some(n))
  });
  let pool = Arc::new(FiberPool::new((0..10).collect(), handler, test_config("fiber_overlap")).unwrap());

  let background = {
    let pool = pool.clone();
    thread::spawn(move || pool.speedup(Some(Power::Fixed(2))))
  };

  while pool.active_worker_count() == 0 {
    thread::sleep(Duration::from_millis(1));
  }
  assert!(pool.active_worker_count() <= 2);
  assert_eq!(pool.speedup(None), Err(PoolError::RunInProgress));

  let report = background.join().unwrap().unwrap();
  assert_eq!(report.produced, 10);
  assert_eq!(pool.active_worker_count(), 0);
}

#[test]
fn test_progress_advances_while_workers_run() {
  setup_tracing_for_test();
  let handler = handler_fn(|n: u32, _ctx: Arc<()>| async move {
    tokio::time::sleep(Duration::from_millis(15)).await;
    Ok::<_, String>(Some(n))
  });
  let pool = Arc::new(FiberPool::new((0..20).collect(), handler, test_config("fiber_live_progress")).unwrap());

  let background = {
    let pool = pool.clone();
    thread::spawn(move || pool.speedup(Some(Power::Fixed(2))))
  };

  while pool.active_worker_count() == 0 {
    thread::sleep(Duration::from_millis(1));
  }
  let mut samples = Vec::new();
  let mut pending_counts = Vec::new();
  while pool.active_worker_count() > 0 {
    pending_counts.push(pool.pending_count());
    samples.push(pool.progress());
    thread::sleep(Duration::from_millis(2));
  }
  background.join().unwrap().unwrap();

  assert!(pending_counts.windows(2).all(|w| w[0] >= w[1]), "pending never grows during a run");
  let first_fraction = samples.iter().position(|p| !p.is_pending());
  if let Some(first) = first_fraction {
    assert!(samples[first..].iter().all(|p| !p.is_pending()), "no ramp-up once both workers took a task");
  }
  let consumed: Vec<usize> = samples
    .iter()
    .filter_map(|p| match p {
      Progress::Fraction { consumed, total } => {
        assert_eq!(*total, 20);
        assert!(*consumed >= 2);
        Some(*consumed)
      }
      Progress::Pending => None,
    })
    .collect();
  assert!(consumed.windows(2).all(|w| w[0] <= w[1]), "consumed count only grows");
  assert!(consumed.iter().any(|&c| c < 20), "some samples were taken mid-run");
  assert_eq!(pool.progress().to_string(), "20/20");
}
