use accelerator::{handler_fn, ErrorPolicy, FiberPool, PoolConfig, PoolError, Power};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::INFO)
    .with_target(false)
    .init();

  info!("--- Fail Fast Example ---");

  for policy in [ErrorPolicy::Collect, ErrorPolicy::FailFast] {
    let handler = handler_fn(|n: u32, _ctx: Arc<()>| async move {
      tokio::time::sleep(Duration::from_millis(50)).await;
      if n == 4 {
        return Err(format!("record {} is corrupt", n));
      }
      Ok(Some(n * 10))
    });
    let config = PoolConfig::new()
      .with_pool_name(format!("{:?}_pool", policy).to_lowercase())
      .with_error_policy(policy);
    let pool = FiberPool::new((1..=10).collect(), handler, config).expect("Failed to build pool");

    match pool.speedup(Some(Power::Fixed(2))) {
      Ok(report) => info!(
        "{:?}: {} succeeded, {} failed",
        policy,
        report.succeeded(),
        report.failures.len()
      ),
      Err(PoolError::HandlerFailed { failures }) => error!(
        "{:?}: run aborted ({}), {} tasks never dispatched",
        policy,
        failures[0],
        pool.pending_count()
      ),
      Err(other) => error!("{:?}: {}", policy, other),
    }
    info!("{:?}: drained {:?}", policy, pool.drain());
  }
  info!("--- Fail Fast Example End ---");
}
