use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

/// Accumulates handler outputs until the caller drains them.
///
/// Results survive across runs; only `drain` empties the sink.
pub(crate) struct ResultSink<R> {
  done: Arc<Mutex<VecDeque<R>>>,
}

impl<R> Clone for ResultSink<R> {
  fn clone(&self) -> Self {
    Self {
      done: self.done.clone(),
    }
  }
}

impl<R> fmt::Debug for ResultSink<R> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ResultSink").field("len", &self.len()).finish()
  }
}

impl<R> ResultSink<R> {
  pub(crate) fn new() -> Self {
    Self {
      done: Arc::new(Mutex::new(VecDeque::new())),
    }
  }

  pub(crate) fn push(&self, result: R) {
    self.done.lock().push_back(result);
  }

  pub(crate) fn len(&self) -> usize {
    self.done.lock().len()
  }

  /// Moves every queued result out, oldest first.
  pub(crate) fn drain(&self) -> Vec<R> {
    let mut guard = self.done.lock();
    guard.drain(..).collect()
  }
}
