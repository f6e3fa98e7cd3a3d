use crate::error::PoolError;
use crate::progress::ProgressStyle;

use std::fmt;
use std::num::NonZeroUsize;
use std::str::FromStr;

const DEFAULT_POOL_NAME: &str = "accelerator";
const MIN_DEFAULT_POWER: usize = 2;

/// Requested concurrency degree ("power") for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Power {
  /// Exactly this many workers, clamped to the number of loaded tasks.
  Fixed(usize),
  /// One worker per loaded task.
  Full,
}

impl Power {
  pub(crate) fn validate(self) -> Result<Self, PoolError> {
    match self {
      Power::Fixed(0) => Err(PoolError::Configuration(
        "concurrency degree must be at least 1".to_string(),
      )),
      other => Ok(other),
    }
  }

  /// Resolves the number of workers for a run over `total` tasks.
  pub(crate) fn clamp_to(self, total: usize) -> usize {
    match self {
      Power::Fixed(n) => n.min(total),
      Power::Full => total,
    }
  }
}

impl From<usize> for Power {
  fn from(n: usize) -> Self {
    Power::Fixed(n)
  }
}

impl fmt::Display for Power {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Power::Fixed(n) => write!(f, "{}", n),
      Power::Full => f.write_str("full"),
    }
  }
}

impl FromStr for Power {
  type Err = PoolError;

  /// Accepts a positive integer, or `fast`/`full` for the clamped maximum.
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let trimmed = s.trim();
    if trimmed.eq_ignore_ascii_case("fast") || trimmed.eq_ignore_ascii_case("full") {
      return Ok(Power::Full);
    }
    trimmed
      .parse::<usize>()
      .map_err(|e| PoolError::Configuration(format!("invalid concurrency degree {:?}: {}", s, e)))
      .and_then(|n| Power::Fixed(n).validate())
  }
}

/// How a failing task affects the rest of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
  /// Record the failure in the run report and keep draining the queue.
  /// Workers lost to the scheduler are recorded the same way.
  #[default]
  Collect,
  /// Stop handing out new tasks after the first handler failure and fail
  /// the run with `PoolError::HandlerFailed`. A run whose handlers all
  /// succeeded but which lost workers fails with `PoolError::WorkerAborted`.
  FailFast,
}

/// Construction-time settings shared by both pool variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
  pub pool_name: String,
  /// Default number of workers when a run does not request one.
  pub power: usize,
  pub progress_style: ProgressStyle,
  pub error_policy: ErrorPolicy,
  /// Worker threads of the runtime owned by a `FiberPool`. Unused by the event-loop pool.
  pub runtime_threads: usize,
}

fn available_cores() -> usize {
  std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
}

impl Default for PoolConfig {
  /// Snapshots the core count once; `power` defaults to `max(cores, 2)`.
  fn default() -> Self {
    let cores = available_cores();
    Self {
      pool_name: DEFAULT_POOL_NAME.to_string(),
      power: cores.max(MIN_DEFAULT_POWER),
      progress_style: ProgressStyle::default(),
      error_policy: ErrorPolicy::default(),
      runtime_threads: cores,
    }
  }
}

impl PoolConfig {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_pool_name(mut self, name: impl Into<String>) -> Self {
    self.pool_name = name.into();
    self
  }

  pub fn with_power(mut self, power: usize) -> Self {
    self.power = power;
    self
  }

  pub fn with_progress_style(mut self, style: ProgressStyle) -> Self {
    self.progress_style = style;
    self
  }

  pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
    self.error_policy = policy;
    self
  }

  pub fn with_runtime_threads(mut self, threads: usize) -> Self {
    self.runtime_threads = threads;
    self
  }

  pub fn validate(&self) -> Result<(), PoolError> {
    if self.power == 0 {
      return Err(PoolError::Configuration(
        "default concurrency degree must be at least 1".to_string(),
      ));
    }
    if self.runtime_threads == 0 {
      return Err(PoolError::Configuration(
        "runtime_threads must be at least 1".to_string(),
      ));
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_power_is_at_least_two() {
    let config = PoolConfig::default();
    assert!(config.power >= 2);
    assert!(config.runtime_threads >= 1);
    assert_eq!(config.pool_name, "accelerator");
    assert_eq!(config.error_policy, ErrorPolicy::Collect);
    assert!(config.validate().is_ok());
  }

  #[test]
  fn zero_power_is_rejected() {
    let config = PoolConfig::new().with_power(0);
    assert!(matches!(config.validate(), Err(PoolError::Configuration(_))));
    assert!(matches!(Power::Fixed(0).validate(), Err(PoolError::Configuration(_))));
  }

  #[test]
  fn power_parses_sentinels_and_numbers() {
    assert_eq!("fast".parse::<Power>().unwrap(), Power::Full);
    assert_eq!(" FULL ".parse::<Power>().unwrap(), Power::Full);
    assert_eq!("8".parse::<Power>().unwrap(), Power::Fixed(8));
    assert!("0".parse::<Power>().is_err());
    assert!("-3".parse::<Power>().is_err());
    assert!("lots".parse::<Power>().is_err());
  }

  #[test]
  fn clamp_never_exceeds_task_count() {
    assert_eq!(Power::Fixed(100).clamp_to(3), 3);
    assert_eq!(Power::Fixed(2).clamp_to(5), 2);
    assert_eq!(Power::Full.clamp_to(7), 7);
  }
}
