use accelerator::{handler_fn, ChannelFactory, EventLoopPool, PoolConfig, Power, ProgressStyle};
use futures::future::LocalBoxFuture;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Pretends to be a pooled HTTP session.
#[derive(Debug, Default)]
struct Session {
  requests: AtomicUsize,
}

struct SessionFactory;

impl ChannelFactory for SessionFactory {
  type Channel = Session;
  type Error = std::convert::Infallible;

  fn open(&self) -> LocalBoxFuture<'_, Result<Session, Self::Error>> {
    Box::pin(async {
      info!("Opening shared session.");
      Ok(Session::default())
    })
  }

  fn close(&self, session: &Session) {
    info!(
      "Closing shared session after {} requests.",
      session.requests.load(Ordering::SeqCst)
    );
  }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Event Loop Subvert Example ---");

  let urls: Vec<String> = (0..8).map(|i| format!("https://example.test/item/{}", i)).collect();
  let handler = handler_fn(|url: String, session: Arc<Session>| async move {
    let n = session.requests.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(150 + (n as u64 % 4) * 25)).await;
    Ok::<_, String>(Some(format!("{} -> 200", url)))
  });

  let config = PoolConfig::new()
    .with_pool_name("event_loop_demo")
    .with_progress_style(ProgressStyle::Fraction);
  let pool = EventLoopPool::new(urls, handler, SessionFactory, config).expect("Failed to build pool");

  let report = pool.subvert(Some(Power::Full)).await.expect("Run failed");
  info!("Workers: {}, progress: {}", report.power, pool.progress());

  for line in pool.drain() {
    info!("{}", line);
  }
  info!("--- Event Loop Subvert Example End ---");
}
