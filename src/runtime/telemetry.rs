use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default interval used by the metrics reporter task.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(5);

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls back to `info`.
/// Calling this function multiple times is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Rolling counters for every stage of the pipeline.
#[derive(Default, Debug)]
pub struct Telemetry {
    fetched_messages: AtomicU64,
    empty_fetches: AtomicU64,
    fetch_errors: AtomicU64,
    jobs_succeeded: AtomicU64,
    jobs_failed: AtomicU64,
    batch_timeouts: AtomicU64,
    deleted_messages: AtomicU64,
    delete_errors: AtomicU64,
}

impl Telemetry {
    pub fn record_fetch(&self, count: usize) {
        if count == 0 {
            self.empty_fetches.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.fetched_messages
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_fetch_error(&self) {
        self.fetch_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job(&self, success: bool) {
        if success {
            self.jobs_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.jobs_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_batch_timeout(&self) {
        self.batch_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deleted(&self, count: usize) {
        if count == 0 {
            return;
        }
        self.deleted_messages
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_delete_error(&self) {
        self.delete_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            fetched_messages: self.fetched_messages.load(Ordering::Relaxed),
            empty_fetches: self.empty_fetches.load(Ordering::Relaxed),
            fetch_errors: self.fetch_errors.load(Ordering::Relaxed),
            jobs_succeeded: self.jobs_succeeded.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            batch_timeouts: self.batch_timeouts.load(Ordering::Relaxed),
            deleted_messages: self.deleted_messages.load(Ordering::Relaxed),
            delete_errors: self.delete_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub fetched_messages: u64,
    pub empty_fetches: u64,
    pub fetch_errors: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub batch_timeouts: u64,
    pub deleted_messages: u64,
    pub delete_errors: u64,
}

/// Spawns a background task that periodically logs throughput and error counters.
pub fn spawn_metrics_reporter(
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_snapshot = telemetry.snapshot();
        let mut last_tick = Instant::now();

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(target: "protoqueue::metrics", "metrics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let current = telemetry.snapshot();
                    let jobs_delta = (current.jobs_succeeded + current.jobs_failed)
                        .saturating_sub(last_snapshot.jobs_succeeded + last_snapshot.jobs_failed);
                    let elapsed = last_tick.elapsed().as_secs_f64();
                    let throughput = if elapsed <= f64::EPSILON {
                        0.0
                    } else {
                        jobs_delta as f64 / elapsed
                    };

                    tracing::info!(
                        target: "protoqueue::metrics",
                        throughput = format!("{throughput:.2}"),
                        fetched = current.fetched_messages,
                        empty_fetches = current.empty_fetches,
                        succeeded = current.jobs_succeeded,
                        failed = current.jobs_failed,
                        batch_timeouts = current.batch_timeouts,
                        deleted = current.deleted_messages,
                        delete_errors = current.delete_errors,
                        "runtime metrics snapshot"
                    );

                    last_snapshot = current;
                    last_tick = Instant::now();
                }
            }
        }
    })
}
