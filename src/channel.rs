use std::fmt;

use futures::future::LocalBoxFuture;

/// Opens the I/O channel shared by every worker of one `EventLoopPool` run,
/// and releases it when the run ends.
///
/// The channel is used from many workers on the same event loop, so it only
/// needs to tolerate interleaved use, not parallel use. It does not have to
/// be `Send` or `Sync`: an `Rc<RefCell<..>>` session works. Pooled HTTP
/// clients and database handles are typical channels.
pub trait ChannelFactory: 'static {
  type Channel: 'static;
  type Error: fmt::Display;

  fn open(&self) -> LocalBoxFuture<'_, Result<Self::Channel, Self::Error>>;

  /// Releases the channel once the run is over. Called exactly once for every
  /// successful `open`: after the workers finish, after a failed run, and
  /// when the `subvert` future is dropped mid-run. Must not block.
  ///
  /// The pool drops its own handle right after. The default does nothing.
  fn close(&self, _channel: &Self::Channel) {}
}

/// Opens one pooled `reqwest::Client` per run.
#[cfg(feature = "http")]
#[derive(Debug, Clone, Default)]
pub struct HttpClientFactory {
  user_agent: Option<String>,
  timeout: Option<std::time::Duration>,
}

#[cfg(feature = "http")]
impl HttpClientFactory {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
    self.user_agent = Some(user_agent.into());
    self
  }

  pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }
}

#[cfg(feature = "http")]
impl ChannelFactory for HttpClientFactory {
  type Channel = reqwest::Client;
  type Error = reqwest::Error;

  fn open(&self) -> LocalBoxFuture<'_, Result<reqwest::Client, reqwest::Error>> {
    Box::pin(async move {
      let mut builder = reqwest::Client::builder();
      if let Some(agent) = &self.user_agent {
        builder = builder.user_agent(agent.as_str());
      }
      if let Some(timeout) = self.timeout {
        builder = builder.timeout(timeout);
      }
      builder.build()
    })
  }
}
