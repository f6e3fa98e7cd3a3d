use accelerator::{handler_fn, FiberPool, PoolConfig, Power};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Settings every handler call receives.
#[derive(Debug)]
struct FetchSettings {
  base_delay_ms: u64,
}

fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Fiber Speedup Example ---");

  let handler = handler_fn(|page: u32, settings: Arc<FetchSettings>| async move {
    let delay = settings.base_delay_ms + u64::from(page % 3) * 50;
    tokio::time::sleep(Duration::from_millis(delay)).await;
    info!("Fetched page {} after {}ms", page, delay);
    Ok::<_, String>(Some(format!("page-{}.html", page)))
  });

  let config = PoolConfig::new().with_pool_name("fiber_demo").with_power(3);
  let pool = FiberPool::new((1..=12).collect(), handler, config).expect("Failed to build pool");

  info!("Progress before run: {}", pool.progress());
  let report = pool
    .speedup_with(Some(Power::Fixed(4)), FetchSettings { base_delay_ms: 100 })
    .expect("Run failed");

  info!(
    "Run {} finished: {} tasks with {} workers in {:?}",
    report.run_id, report.handled, report.power, report.elapsed
  );
  info!("Progress after run: {}", pool.progress());

  for page in pool.drain() {
    info!("Result: {}", page);
  }
  info!("--- Fiber Speedup Example End ---");
}
