//! Shared job runner pool. Its width is the consumer's `concurrency`, and all
//! lanes compete for the same slots, so a saturated pool naturally throttles
//! every batch fan-out.

use super::stage_pool::{panic_message, StagePool, StageSender};
use crate::queue::Message;
use crate::runtime::job::Job;
use crate::runtime::telemetry::Telemetry;
use anyhow::Result;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Result of running the job for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    message: Message,
    success: bool,
}

impl Outcome {
    pub fn new(message: Message, success: bool) -> Self {
        Self { message, success }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn into_message(self) -> Message {
        self.message
    }
}

pub(crate) struct JobTask {
    message: Message,
    reply: oneshot::Sender<Outcome>,
}

pub(crate) struct JobPool {
    pool: StagePool<JobTask>,
}

/// Submission handle shared by every batch coordinator.
#[derive(Clone)]
pub(crate) struct JobPoolHandle {
    sender: StageSender<JobTask>,
}

impl JobPool {
    pub(crate) fn spawn<J: Job>(width: usize, job: Arc<J>, telemetry: Arc<Telemetry>) -> Self {
        let pool = StagePool::spawn("jobs", width, move |_, task: JobTask| {
            let job = Arc::clone(&job);
            let telemetry = Arc::clone(&telemetry);
            async move {
                let JobTask { message, reply } = task;
                if reply.is_closed() {
                    tracing::debug!(
                        message_id = message.id(),
                        "batch already abandoned; skipping job"
                    );
                    return;
                }
                let outcome = run_job(job.as_ref(), message, &telemetry).await;
                // The coordinator may have given up on this batch already.
                let _ = reply.send(outcome);
            }
        });
        Self { pool }
    }

    pub(crate) fn handle(&self) -> JobPoolHandle {
        JobPoolHandle {
            sender: self.pool.sender(),
        }
    }

    pub(crate) fn width(&self) -> usize {
        self.pool.width()
    }

    pub(crate) async fn stop(self, grace: Duration) -> bool {
        self.pool.stop(grace).await
    }
}

impl JobPoolHandle {
    /// Queues one job invocation; the receiver resolves once a worker ran it.
    pub(crate) fn submit(&self, message: Message) -> Result<oneshot::Receiver<Outcome>> {
        let (reply, outcome) = oneshot::channel();
        self.sender.dispatch(JobTask { message, reply })?;
        Ok(outcome)
    }
}

/// Runs `job` for one message. Errors and panics become a failed [`Outcome`]
/// and never escape this boundary.
pub(crate) async fn run_job<J: Job + ?Sized>(
    job: &J,
    message: Message,
    telemetry: &Telemetry,
) -> Outcome {
    let result = AssertUnwindSafe(async { job.handle(&message).await })
        .catch_unwind()
        .await;

    let success = match result {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            tracing::warn!(
                message_id = message.id(),
                receive_count = message.receive_count(),
                error = %err,
                "job failed; leaving message for redelivery"
            );
            false
        }
        Err(panic_payload) => {
            tracing::warn!(
                message_id = message.id(),
                receive_count = message.receive_count(),
                panic = %panic_message(panic_payload.as_ref()),
                "job panicked; leaving message for redelivery"
            );
            false
        }
    };

    telemetry.record_job(success);
    Outcome::new(message, success)
}
