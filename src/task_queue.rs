use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// A FIFO of tasks waiting for a worker.
///
/// Cloning yields another handle to the same queue. `pop` is the only point
/// where a task changes owner, so no two workers can ever observe the same task.
pub(crate) struct PendingQueue<T> {
  inner: Arc<Mutex<VecDeque<T>>>,
}

impl<T> Clone for PendingQueue<T> {
  fn clone(&self) -> Self {
    Self {
      inner: self.inner.clone(),
    }
  }
}

impl<T> fmt::Debug for PendingQueue<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PendingQueue")
      .field("len", &self.len())
      .finish_non_exhaustive()
  }
}

impl<T> PendingQueue<T> {
  pub(crate) fn new() -> Self {
    Self {
      inner: Arc::new(Mutex::new(VecDeque::new())),
    }
  }

  /// Takes the next task without waiting. `None` means the queue is drained.
  pub(crate) fn pop(&self) -> Option<T> {
    self.inner.lock().pop_front()
  }

  pub(crate) fn len(&self) -> usize {
    self.inner.lock().len()
  }

  /// Replaces whatever is queued with `tasks`, keeping their order.
  /// Returns the new length.
  fn refill(&self, tasks: impl IntoIterator<Item = T>) -> usize {
    let mut guard = self.inner.lock();
    guard.clear();
    guard.extend(tasks);
    guard.len()
  }
}

/// Holds the caller's task collection and moves it into the pending queue
/// at the start of every run.
pub(crate) struct TaskLoader<T> {
  tasks: Vec<T>,
  pending: PendingQueue<T>,
  max_queue_size: AtomicUsize,
}

impl<T> fmt::Debug for TaskLoader<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TaskLoader")
      .field("tasks", &self.tasks.len())
      .field("pending", &self.pending.len())
      .field("max_queue_size", &self.max_queue_size())
      .finish()
  }
}

impl<T: Clone> TaskLoader<T> {
  pub(crate) fn new(tasks: Vec<T>) -> Self {
    Self {
      tasks,
      pending: PendingQueue::new(),
      max_queue_size: AtomicUsize::new(0),
    }
  }

  /// Loads a fresh snapshot of the collection and records its size.
  ///
  /// Leftovers from an earlier run that stopped early are discarded first.
  /// Returns `0` for an empty collection, in which case there is nothing to run.
  pub(crate) fn load(&self) -> usize {
    let loaded = self.pending.refill(self.tasks.iter().cloned());
    self.max_queue_size.store(loaded, Ordering::SeqCst);
    loaded
  }
}

impl<T> TaskLoader<T> {
  pub(crate) fn queue(&self) -> &PendingQueue<T> {
    &self.pending
  }

  pub(crate) fn max_queue_size(&self) -> usize {
    self.max_queue_size.load(Ordering::SeqCst)
  }

  pub(crate) fn pending(&self) -> usize {
    self.pending.len()
  }

  pub(crate) fn task_count(&self) -> usize {
    self.tasks.len()
  }
}
