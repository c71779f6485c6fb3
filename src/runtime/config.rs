use crate::runtime::telemetry;
use anyhow::{bail, Context, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_CONCURRENCY: usize = 10;
const DEFAULT_BATCH_AWAIT_TIMEOUT_SECS: u64 = 120;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 10;
/// Each lane keeps roughly one service-sized batch worth of jobs busy.
const JOBS_PER_LANE: usize = 10;

pub const ENV_QUEUE_NAME: &str = "PROTOQUEUE_QUEUE_NAME";
pub const ENV_CONCURRENCY: &str = "PROTOQUEUE_CONCURRENCY";
pub const ENV_BATCH_AWAIT_TIMEOUT_SECS: &str = "PROTOQUEUE_BATCH_AWAIT_TIMEOUT_SECS";
pub const ENV_SHUTDOWN_GRACE_SECS: &str = "PROTOQUEUE_SHUTDOWN_GRACE_SECS";
pub const ENV_METRICS_INTERVAL_SECS: &str = "PROTOQUEUE_METRICS_INTERVAL_SECS";
pub const ENV_ENDPOINT: &str = "PROTOQUEUE_ENDPOINT";
pub const ENV_REGION: &str = "PROTOQUEUE_REGION";

/// Runtime configuration for the queue consumer pipeline.
///
/// All instances must be constructed via [`ConsumerConfig::builder`], [`ConsumerConfig::new`]
/// or [`ConsumerConfig::from_env`] so invariants are validated before any consumer observes
/// the values. The configuration is read once at startup and never changes afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    queue_name: String,
    concurrency: usize,
    batch_await_timeout: Duration,
    shutdown_grace: Duration,
    metrics_interval: Duration,
    endpoint: Option<String>,
    region: Option<String>,
}

pub struct ConsumerConfigParams {
    pub queue_name: String,
    pub concurrency: usize,
    pub batch_await_timeout: Duration,
    pub shutdown_grace: Duration,
    pub metrics_interval: Duration,
    pub endpoint: Option<String>,
    pub region: Option<String>,
}

impl ConsumerConfig {
    /// Returns a builder to incrementally construct and validate a configuration.
    pub fn builder() -> ConsumerConfigBuilder {
        ConsumerConfigBuilder::default()
    }

    /// Constructs a configuration directly from the provided values.
    pub fn new(params: ConsumerConfigParams) -> Result<Self> {
        let ConsumerConfigParams {
            queue_name,
            concurrency,
            batch_await_timeout,
            shutdown_grace,
            metrics_interval,
            endpoint,
            region,
        } = params;

        let config = Self {
            queue_name: trimmed_string(queue_name),
            concurrency,
            batch_await_timeout,
            shutdown_grace,
            metrics_interval,
            endpoint: endpoint.map(trimmed_string).filter(|value| !value.is_empty()),
            region: region.map(trimmed_string).filter(|value| !value.is_empty()),
        };

        config.validate()?;
        Ok(config)
    }

    /// Builds a configuration from the `PROTOQUEUE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary key lookup using the same keys as
    /// [`ConsumerConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = Self::builder();

        if let Some(name) = lookup(ENV_QUEUE_NAME) {
            builder = builder.queue_name(name);
        }
        if let Some(concurrency) = parse_var::<usize, _>(&lookup, ENV_CONCURRENCY)? {
            builder = builder.concurrency(concurrency);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, ENV_BATCH_AWAIT_TIMEOUT_SECS)? {
            builder = builder.batch_await_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, ENV_SHUTDOWN_GRACE_SECS)? {
            builder = builder.shutdown_grace(Duration::from_secs(secs));
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, ENV_METRICS_INTERVAL_SECS)? {
            builder = builder.metrics_interval(Duration::from_secs(secs));
        }
        if let Some(endpoint) = lookup(ENV_ENDPOINT) {
            builder = builder.endpoint(endpoint);
        }
        if let Some(region) = lookup(ENV_REGION) {
            builder = builder.region(region);
        }

        builder
            .build()
            .context("invalid queue consumer environment configuration")
    }

    /// Name of the queue the consumer pulls from.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Width of the shared job pool.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Number of concurrent fetch/process/delete lanes.
    ///
    /// Derived as `concurrency / 10 + 1`, so every valid configuration has at
    /// least one lane. Fetch, batch and delete pools each get this width.
    pub fn batches(&self) -> usize {
        lanes_for_concurrency(self.concurrency)
    }

    /// Single timeout covering the whole fan-out of one batch.
    pub fn batch_await_timeout(&self) -> Duration {
        self.batch_await_timeout
    }

    /// Time each pool is given to finish in-flight work during shutdown.
    pub fn shutdown_grace(&self) -> Duration {
        self.shutdown_grace
    }

    /// Interval used by the telemetry reporter.
    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    /// Optional queue service endpoint, passed through to client constructors.
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    /// Optional service region, passed through to client constructors.
    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    /// Performs validation on an existing configuration instance.
    pub fn validate(&self) -> Result<()> {
        ensure_not_empty(&self.queue_name, "queue_name")?;

        if self.concurrency == 0 {
            bail!("concurrency must be greater than 0");
        }

        if self.batch_await_timeout.is_zero() {
            bail!("batch_await_timeout must be greater than 0");
        }

        if self.shutdown_grace.is_zero() {
            bail!("shutdown_grace must be greater than 0");
        }

        if self.metrics_interval.is_zero() {
            bail!("metrics_interval must be greater than 0");
        }

        if let Some(endpoint) = &self.endpoint {
            validate_url(endpoint)?;
        }

        Ok(())
    }
}

/// Lane count for a given job pool width: `concurrency / 10 + 1`.
pub fn lanes_for_concurrency(concurrency: usize) -> usize {
    concurrency / JOBS_PER_LANE + 1
}

#[derive(Debug, Default, Clone)]
pub struct ConsumerConfigBuilder {
    queue_name: Option<String>,
    concurrency: Option<usize>,
    batch_await_timeout: Option<Duration>,
    shutdown_grace: Option<Duration>,
    metrics_interval: Option<Duration>,
    endpoint: Option<String>,
    region: Option<String>,
}

impl ConsumerConfigBuilder {
    pub fn queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = Some(name.into());
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn batch_await_timeout(mut self, timeout: Duration) -> Self {
        self.batch_await_timeout = Some(timeout);
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = Some(grace);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn build(self) -> Result<ConsumerConfig> {
        let params = ConsumerConfigParams {
            queue_name: self.queue_name.context("queue_name is required")?,
            concurrency: self.concurrency.unwrap_or(DEFAULT_CONCURRENCY),
            batch_await_timeout: self
                .batch_await_timeout
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_BATCH_AWAIT_TIMEOUT_SECS)),
            shutdown_grace: self
                .shutdown_grace
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS)),
            metrics_interval: self
                .metrics_interval
                .unwrap_or(telemetry::DEFAULT_METRICS_INTERVAL),
            endpoint: self.endpoint,
            region: self.region,
        };

        ConsumerConfig::new(params)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => {
            let value = raw
                .trim()
                .parse::<T>()
                .with_context(|| format!("{key} has invalid value {raw:?}"))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

fn trimmed_string(value: String) -> String {
    value.trim().to_owned()
}

fn ensure_not_empty(value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        bail!("{field} cannot be empty");
    }
    Ok(())
}

fn validate_url(url: &str) -> Result<()> {
    let url = url.trim();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        bail!("endpoint must start with http:// or https://");
    }
    Ok(())
}
