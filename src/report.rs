use crate::error::TaskFailure;

use std::time::Duration;

/// What one worker did before it left its loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerSummary {
  pub worker_id: usize,
  /// Tasks popped from the queue, including failed ones.
  pub handled: usize,
  pub produced: usize,
  pub failures: Vec<TaskFailure>,
}

impl WorkerSummary {
  pub fn new(worker_id: usize) -> Self {
    Self {
      worker_id,
      ..Self::default()
    }
  }
}

/// Outcome of one run, returned by `speedup` and `subvert`.
///
/// Results themselves are not part of the report; fetch them with `drain`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunReport {
  /// Monotonic id of the run, also recorded on its tracing span.
  pub run_id: u64,
  /// Tasks loaded for this run (`max_queue_size`).
  pub total: usize,
  /// Effective concurrency degree after clamping.
  pub power: usize,
  /// Tasks taken off the queue by a worker, successful or not.
  pub handled: usize,
  /// Outputs pushed into the result sink during this run.
  pub produced: usize,
  pub failures: Vec<TaskFailure>,
  pub elapsed: Duration,
}

impl RunReport {
  pub(crate) fn empty(run_id: u64) -> Self {
    Self {
      run_id,
      ..Self::default()
    }
  }

  pub(crate) fn absorb(&mut self, summary: WorkerSummary) {
    self.handled += summary.handled;
    self.produced += summary.produced;
    self.failures.extend(summary.failures);
  }

  /// `true` when nothing was loaded and no worker ran.
  pub fn is_empty_run(&self) -> bool {
    self.total == 0
  }

  pub fn succeeded(&self) -> usize {
    self.handled.saturating_sub(self.failures.len())
  }

  pub fn is_clean(&self) -> bool {
    self.failures.is_empty()
  }
}
