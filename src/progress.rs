use std::fmt;

/// Rendered while a run has not yet dispatched one task per worker.
pub const PENDING_SENTINEL: &str = "__pending__";

/// How [`Progress`] is derived from the queue counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProgressStyle {
  /// Report [`Progress::Pending`] until at least one task per worker has been
  /// taken, so the first few noisy samples are hidden.
  #[default]
  RampUp,
  /// Always report the raw `consumed/total` fraction.
  Fraction,
}

/// A snapshot of how far the current (or last) run has got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
  Pending,
  Fraction { consumed: usize, total: usize },
}

impl Progress {
  /// `consumed` is `max_queue_size - pending`; `power` is the effective
  /// concurrency degree of the run.
  pub(crate) fn compute(style: ProgressStyle, total: usize, pending: usize, power: usize) -> Self {
    let consumed = total.saturating_sub(pending);
    match style {
      ProgressStyle::RampUp if consumed < power => Progress::Pending,
      _ => Progress::Fraction { consumed, total },
    }
  }

  pub fn is_pending(&self) -> bool {
    matches!(self, Progress::Pending)
  }
}

impl fmt::Display for Progress {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Progress::Pending => f.write_str(PENDING_SENTINEL),
      Progress::Fraction { consumed, total } => write!(f, "{}/{}", consumed, total),
    }
  }
}
