use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// What a handler produces for one task: an optional value for the result
/// sink, or an error that the pool records according to its `ErrorPolicy`.
pub type HandlerResult<R, E> = Result<Option<R>, E>;

/// The per-task logic injected into a pool.
///
/// `Context` is shared by every worker of a run. For a `FiberPool` it is the
/// argument value passed to `speedup_with`; for an `EventLoopPool` it is the
/// channel opened by the pool's `ChannelFactory`.
///
/// The trait itself asks for no thread-safety. A `FiberPool` additionally
/// requires the handler, its context and `Self::Future` to be `Send`, since
/// its workers may move between runtime threads. An `EventLoopPool` polls
/// every worker on the awaiting task, so `Rc`/`RefCell` contexts are fine there.
pub trait TaskHandler<T>: 'static {
  type Context: 'static;
  type Output: 'static;
  type Error: fmt::Display + 'static;
  /// The in-flight work for one task. It owns what it needs; clone shared
  /// state out of `self` before building it.
  type Future: Future<Output = HandlerResult<Self::Output, Self::Error>> + 'static;

  /// Processes one task. Resolving to `Ok(Some(value))` pushes `value` into
  /// the pool's result sink; `Ok(None)` marks the task done without output.
  fn handle(&self, task: T, ctx: Arc<Self::Context>) -> Self::Future;

  /// Called once after every worker of a non-empty run has finished, whatever
  /// the outcome. Panics are caught and logged by the pool.
  fn cleanup(&self) {}
}

/// A [`TaskHandler`] built from an async closure. See [`handler_fn`].
pub struct HandlerFn<F, C> {
  f: F,
  _ctx: PhantomData<fn() -> C>,
}

impl<F, C> fmt::Debug for HandlerFn<F, C> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("HandlerFn").finish_non_exhaustive()
  }
}

/// Wraps `f(task, ctx)` as a handler.
///
/// ```
/// use accelerator::{handler_fn, HandlerResult};
/// use std::sync::Arc;
///
/// let double = handler_fn::<_, ()>(|n: u64, _ctx: Arc<()>| async move {
///   HandlerResult::<u64, std::convert::Infallible>::Ok(Some(n * 2))
/// });
/// # let _ = double;
/// ```
pub fn handler_fn<F, C>(f: F) -> HandlerFn<F, C> {
  HandlerFn { f, _ctx: PhantomData }
}

impl<T, C, F, Fut, R, E> TaskHandler<T> for HandlerFn<F, C>
where
  C: 'static,
  F: Fn(T, Arc<C>) -> Fut + 'static,
  Fut: Future<Output = HandlerResult<R, E>> + 'static,
  R: 'static,
  E: fmt::Display + 'static,
{
  type Context = C;
  type Output = R;
  type Error = E;
  type Future = Fut;

  fn handle(&self, task: T, ctx: Arc<C>) -> Fut {
    (self.f)(task, ctx)
  }
}
