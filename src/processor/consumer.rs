//! Queue consumer orchestration.
//!
//! `Consumer` sizes the pools from the configuration, starts one lane per
//! fetch worker and routes lane events between the stages:
//! - `Fetched` messages go to the batch pool, empty batches included.
//! - `Processed` batches re-trigger a fetch for their lane and, when the batch
//!   completed in time, hand the successful messages to the delete pool.
//! - `FetchFailed` aborts the run through the fatal error handler.
//!
//! Stopping cancels the run token first so no lane starts another fetch, then
//! stops the pools in pipeline order (fetch, batch, delete) so every message
//! already in flight gets its chance to be deleted.

use super::coordinator::BatchCoordinator;
use super::job_pool::JobPool;
use super::lifecycle::LifecycleHandles;
use super::stage_pool::{StagePool, StageSender};
use super::stages::{
    batch_stage, delete_stage, fetch_stage, BatchRequest, DeleteRequest, FetchRequest, LaneEvent,
    LaneEventReceiver,
};
use crate::queue::QueueClient;
use crate::runtime::config::ConsumerConfig;
use crate::runtime::fatal::FatalErrorHandler;
use crate::runtime::job::Job;
use crate::runtime::telemetry::Telemetry;
use anyhow::{bail, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

pub struct Consumer<J: Job> {
    config: ConsumerConfig,
    client: Arc<dyn QueueClient>,
    job: Arc<J>,
    telemetry: Arc<Telemetry>,
    shutdown_root: CancellationToken,
    pipeline: Option<Pipeline>,
    lifecycle: Option<LifecycleHandles>,
}

/// Pools and router task of one run.
struct Pipeline {
    fetch: StagePool<FetchRequest>,
    batch: StagePool<BatchRequest>,
    delete: StagePool<DeleteRequest>,
    jobs: JobPool,
    router: JoinHandle<()>,
}

struct Router {
    events: LaneEventReceiver,
    fetch: StageSender<FetchRequest>,
    batch: StageSender<BatchRequest>,
    delete: StageSender<DeleteRequest>,
    run_token: CancellationToken,
    fatal_handler: Arc<FatalErrorHandler>,
}

impl<J: Job> Consumer<J> {
    /// Creates a consumer with its own root cancellation token.
    pub fn new(config: ConsumerConfig, client: Arc<dyn QueueClient>, job: J) -> Self {
        Self::with_cancellation_token(config, client, job, CancellationToken::new())
    }

    /// Creates a consumer whose runs are children of `shutdown_token`.
    ///
    /// A fatal pipeline error cancels `shutdown_token` as well, so a host
    /// waiting on it learns that the consumer needs to be stopped.
    pub fn with_cancellation_token(
        config: ConsumerConfig,
        client: Arc<dyn QueueClient>,
        job: J,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            config,
            client,
            job: Arc::new(job),
            telemetry: Arc::new(Telemetry::default()),
            shutdown_root: shutdown_token,
            pipeline: None,
            lifecycle: None,
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Returns a clone of the telemetry handle for observability.
    pub fn telemetry(&self) -> Arc<Telemetry> {
        self.telemetry.clone()
    }

    pub fn is_running(&self) -> bool {
        self.pipeline.is_some()
    }

    /// Replaces the root shutdown token used to derive per-run cancellation tokens.
    /// This must only be called while the consumer is idle (i.e. between `stop` and `start`).
    pub fn replace_shutdown_root(&mut self, shutdown: CancellationToken) {
        debug_assert!(
            self.pipeline.is_none(),
            "shutdown token should not change while the consumer is running"
        );
        self.shutdown_root = shutdown;
    }

    /// Spawns the pools and starts every lane with a fetch.
    ///
    /// Returns an error if the consumer is already running or its root
    /// shutdown token has been cancelled (see [`Self::replace_shutdown_root`]).
    pub async fn start(&mut self) -> Result<()> {
        if self.pipeline.is_some() {
            bail!("consumer already running");
        }
        if self.shutdown_root.is_cancelled() {
            bail!("shutdown token already cancelled; replace it before starting again");
        }

        debug_assert!(
            self.config.validate().is_ok(),
            "ConsumerConfig should have been validated at construction time"
        );

        let lanes = self.config.batches();
        tracing::info!(
            queue = self.config.queue_name(),
            concurrency = self.config.concurrency(),
            lanes,
            batch_await_timeout_ms = self.config.batch_await_timeout().as_millis() as u64,
            "starting queue consumer"
        );

        let lifecycle = LifecycleHandles::spawn(
            &self.shutdown_root,
            self.telemetry.clone(),
            self.config.metrics_interval(),
        );
        let run_token = lifecycle.run_token.clone();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<LaneEvent>();

        let jobs = JobPool::spawn(
            self.config.concurrency(),
            self.job.clone(),
            self.telemetry.clone(),
        );
        tracing::debug!(job_slots = jobs.width(), "job pool spawned");
        let coordinator = BatchCoordinator::new(
            jobs.handle(),
            self.config.batch_await_timeout(),
            self.telemetry.clone(),
        );

        let fetch = {
            let client = self.client.clone();
            let telemetry = self.telemetry.clone();
            let run_token = run_token.clone();
            let events = event_tx.clone();
            StagePool::spawn("fetch", lanes, move |_, request: FetchRequest| {
                let client = client.clone();
                let telemetry = telemetry.clone();
                let run_token = run_token.clone();
                let events = events.clone();
                async move {
                    fetch_stage(client.as_ref(), request, &run_token, &telemetry, &events).await
                }
            })
        };

        let batch = {
            let events = event_tx;
            StagePool::spawn("batch", lanes, move |_, request: BatchRequest| {
                let coordinator = coordinator.clone();
                let events = events.clone();
                async move { batch_stage(&coordinator, request, &events).await }
            })
        };

        let delete = {
            let client = self.client.clone();
            let telemetry = self.telemetry.clone();
            StagePool::spawn("delete", lanes, move |_, request: DeleteRequest| {
                let client = client.clone();
                let telemetry = telemetry.clone();
                async move { delete_stage(client.as_ref(), request, &telemetry).await }
            })
        };

        let router = Router {
            events: event_rx,
            fetch: fetch.sender(),
            batch: batch.sender(),
            delete: delete.sender(),
            run_token: run_token.clone(),
            fatal_handler: lifecycle.fatal_handler(),
        };
        let pipeline = Pipeline {
            router: tokio::spawn(router.run()),
            fetch,
            batch,
            delete,
            jobs,
        };

        let bootstrap = pipeline.fetch.sender();
        for lane in 0..lanes {
            if let Err(err) = bootstrap.dispatch(FetchRequest { lane }) {
                tracing::error!(lane, error = %err, "failed to start lane; shutting down partial pipeline");
                pipeline.shutdown(self.config.shutdown_grace()).await;
                lifecycle.shutdown().await;
                return Err(err).context("failed to start queue consumer");
            }
        }

        self.pipeline = Some(pipeline);
        self.lifecycle = Some(lifecycle);
        Ok(())
    }

    /// Stops the consumer gracefully.
    ///
    /// No fetch starts after this is called. In-flight batches finish (or time
    /// out) and their successful messages are deleted before the pools go
    /// away. Returns the fatal error that aborted the run, if any.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(pipeline) = self.pipeline.take() else {
            return Ok(());
        };

        tracing::info!(queue = self.config.queue_name(), "stopping queue consumer");

        let lifecycle = self.lifecycle.take();
        if let Some(handles) = &lifecycle {
            handles.run_token.cancel();
        }

        pipeline.shutdown(self.config.shutdown_grace()).await;

        let lifecycle_error = lifecycle.as_ref().and_then(LifecycleHandles::error);
        if let Some(handles) = lifecycle {
            handles.shutdown().await;
        }

        if let Some(err) = lifecycle_error {
            return Err(err).context("queue consumer pipeline aborted");
        }

        tracing::info!(queue = self.config.queue_name(), "queue consumer stopped");
        Ok(())
    }
}

impl<J: Job> Drop for Consumer<J> {
    fn drop(&mut self) {
        if let Some(handles) = &self.lifecycle {
            handles.run_token.cancel();
        }
        // The router holds the stage senders; aborting it lets the pools wind down.
        if let Some(pipeline) = &self.pipeline {
            pipeline.router.abort();
        }
    }
}

impl Pipeline {
    async fn shutdown(self, grace: Duration) {
        let Pipeline {
            fetch,
            batch,
            delete,
            jobs,
            mut router,
        } = self;

        fetch.stop(grace).await;
        batch.stop(grace).await;

        // Fetch and batch workers own every event sender, so the router ends
        // once it has routed what they produced.
        match timeout(grace, &mut router).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "lane event router terminated unexpectedly");
            }
            Err(_) => {
                tracing::warn!(
                    grace_ms = grace.as_millis() as u64,
                    "lane event router did not drain within grace period; aborting"
                );
                router.abort();
            }
        }

        delete.stop(grace).await;
        jobs.stop(grace).await;
    }
}

impl Router {
    async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            match event {
                LaneEvent::Fetched { lane, messages } => {
                    let count = messages.len();
                    if let Err(err) = self.batch.dispatch(BatchRequest { lane, messages }) {
                        tracing::warn!(
                            lane,
                            count,
                            error = %err,
                            "dropping fetched messages; they will be redelivered"
                        );
                    }
                }
                LaneEvent::FetchFailed { lane, error } => {
                    if self.run_token.is_cancelled() {
                        tracing::warn!(lane, error = %error, "fetch failed during shutdown");
                    } else {
                        self.fatal_handler
                            .trigger(&format!("lane {lane} fetch failed"), error);
                    }
                }
                LaneEvent::Processed { lane, result } => {
                    self.refetch(lane);
                    match result {
                        Ok(succeeded) => {
                            let count = succeeded.len();
                            let request = DeleteRequest {
                                lane,
                                messages: succeeded,
                            };
                            if let Err(err) = self.delete.dispatch(request) {
                                tracing::warn!(
                                    lane,
                                    count,
                                    error = %err,
                                    "dropping delete request; messages will be redelivered"
                                );
                            }
                        }
                        Err(err) => {
                            tracing::error!(
                                lane,
                                error = %err,
                                "batch failed; no message of it is deleted this cycle"
                            );
                        }
                    }
                }
            }
        }
        tracing::debug!("lane event router exited");
    }

    fn refetch(&self, lane: usize) {
        if self.run_token.is_cancelled() {
            tracing::debug!(lane, "lane finished after cancellation");
            return;
        }
        if let Err(err) = self.fetch.dispatch(FetchRequest { lane }) {
            tracing::debug!(lane, error = %err, "lane not re-triggered");
        }
    }
}
