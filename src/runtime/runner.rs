use crate::queue::QueueClient;
use crate::runtime::job::Job;
use crate::{Consumer, ConsumerConfig};
use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Hosts a [`Consumer`] for a process: starts it, waits for SIGINT/SIGTERM or a fatal
/// pipeline error, and runs the ordered shutdown.
pub struct Runner<J: Job> {
    consumer: Consumer<J>,
    shutdown: CancellationToken,
    started: bool,
}

impl<J: Job> Runner<J> {
    /// Creates a new runner and wires a root [`CancellationToken`] that propagates
    /// through the entire pipeline (lanes, pools, metrics reporter).
    pub fn new(config: ConsumerConfig, client: Arc<dyn QueueClient>, job: J) -> Self {
        let shutdown = CancellationToken::new();
        let consumer = Consumer::with_cancellation_token(config, client, job, shutdown.clone());
        Self {
            consumer,
            shutdown,
            started: false,
        }
    }

    /// Returns a clone of the root shutdown token so external callers can integrate
    /// with their own signal handlers or cancellation strategies.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn consumer(&self) -> &Consumer<J> {
        &self.consumer
    }

    /// Starts the underlying consumer pipeline.
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }

        self.consumer.start().await?;
        self.started = true;
        Ok(())
    }

    /// Stops the consumer and arms a fresh root token so the runner can be started again,
    /// even when the run ended because of a fatal pipeline error.
    pub async fn stop(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }

        self.shutdown.cancel();
        let outcome = self.consumer.stop().await;
        self.started = false;
        self.reinitialize_shutdown_token();

        match &outcome {
            Ok(()) => tracing::info!(
                queue = self.consumer.config().queue_name(),
                "runner stopped"
            ),
            Err(err) => tracing::error!(
                queue = self.consumer.config().queue_name(),
                error = format!("{err:#}"),
                "runner stopped after pipeline failure"
            ),
        }
        outcome
    }

    /// Runs until SIGINT or SIGTERM is received or the shutdown token is cancelled elsewhere.
    ///
    /// A fatal pipeline error cancels the shutdown token too, so it ends this call
    /// and is returned from it.
    pub async fn run_until_signal(&mut self) -> Result<()> {
        self.start().await?;
        tracing::info!("runner started; waiting for SIGINT/SIGTERM to initiate shutdown");

        tokio::select! {
            _ = shutdown_signal() => {
                tracing::info!("shutdown signal received; shutting down runner");
            }
            _ = self.shutdown.cancelled() => {
                tracing::info!("runner shutdown token cancelled");
            }
        }

        self.stop().await
    }

    fn reinitialize_shutdown_token(&mut self) {
        self.shutdown = CancellationToken::new();
        self.consumer.replace_shutdown_root(self.shutdown.clone());
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal as unix_signal, SignalKind};

    match unix_signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, "failed to install SIGTERM handler; listening for Ctrl-C only");
            let _ = signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
