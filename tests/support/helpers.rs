use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use once_cell::sync::Lazy;
use protoqueue::{ConsumerConfig, MemoryQueueOptions};
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

static TRACING_SUBSCRIBER: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
});

pub fn init_tracing() {
    Lazy::force(&TRACING_SUBSCRIBER);
}

/// Queue options with a short long-poll so idle lanes cycle quickly.
pub fn fast_queue_options() -> MemoryQueueOptions {
    MemoryQueueOptions {
        wait_time: Duration::from_millis(20),
        ..MemoryQueueOptions::default()
    }
}

pub fn test_config(concurrency: usize, batch_await_timeout: Duration) -> ConsumerConfig {
    ConsumerConfig::builder()
        .queue_name("integration")
        .concurrency(concurrency)
        .batch_await_timeout(batch_await_timeout)
        .shutdown_grace(Duration::from_secs(2))
        .metrics_interval(Duration::from_millis(100))
        .build()
        .expect("test config should be valid")
}

/// Polls `condition` every 10ms until it holds or `timeout` elapses.
pub async fn wait_until<F>(description: &str, timeout: Duration, mut condition: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    loop {
        if condition() {
            return Ok(());
        }
        if start.elapsed() > timeout {
            bail!("{description} did not happen within {:?}", timeout);
        }
        sleep(Duration::from_millis(10)).await;
    }
}
