use std::fmt;

use thiserror::Error;

/// Errors that can occur while running an `accelerator` pool.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoolError {
  #[error("Invalid pool configuration: {0}")]
  Configuration(String),

  #[error("Failed to acquire the shared channel for this run: {0}")]
  ResourceAcquisition(String),

  #[error("Run aborted after {} task failure(s); first: {}", .failures.len(), first_failure(.failures))]
  HandlerFailed { failures: Vec<TaskFailure> },

  /// Workers were torn down by the scheduler but no handler failed.
  #[error("Run lost {} worker(s) before they finished; first: {}", .failures.len(), first_failure(.failures))]
  WorkerAborted { failures: Vec<TaskFailure> },

  #[error("A run is already in progress on this pool")]
  RunInProgress,
}

fn first_failure(failures: &[TaskFailure]) -> String {
  failures
    .first()
    .map_or_else(|| "<none>".to_string(), ToString::to_string)
}

/// Why a single task did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
  /// The handler returned an error; holds its rendered message.
  Error(String),
  /// The handler panicked while processing the task.
  Panicked,
  /// The worker itself was torn down by the scheduler (e.g. runtime shutdown).
  Aborted(String),
}

impl FailureKind {
  /// `true` when the handler itself failed, as opposed to its worker being lost.
  pub fn is_handler_failure(&self) -> bool {
    matches!(self, FailureKind::Error(_) | FailureKind::Panicked)
  }
}

/// A failure recorded by a worker during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
  pub worker_id: usize,
  pub kind: FailureKind,
}

impl fmt::Display for TaskFailure {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.kind {
      FailureKind::Error(msg) => write!(f, "worker {} handler error: {}", self.worker_id, msg),
      FailureKind::Panicked => write!(f, "worker {} handler panicked", self.worker_id),
      FailureKind::Aborted(reason) => write!(f, "worker {} aborted: {}", self.worker_id, reason),
    }
  }
}
