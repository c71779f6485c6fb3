//! Batch fan-out/fan-in over the shared job pool.

use super::job_pool::{JobPoolHandle, Outcome};
use crate::queue::Message;
use crate::runtime::telemetry::Telemetry;
use futures::future::join_all;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

#[derive(Debug)]
pub enum BatchError {
    /// Not every job of the batch finished within the batch window. Outcomes
    /// that did complete are discarded along with the rest. Jobs already
    /// running finish in the background; jobs still queued for a slot are
    /// skipped.
    TimedOut { size: usize, timeout: Duration },
    /// The job pool stopped accepting work.
    PoolClosed,
}

impl fmt::Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchError::TimedOut { size, timeout } => write!(
                f,
                "batch of {size} message(s) did not finish within {}ms",
                timeout.as_millis()
            ),
            BatchError::PoolClosed => write!(f, "job pool is closed"),
        }
    }
}

impl std::error::Error for BatchError {}

#[derive(Clone)]
pub(crate) struct BatchCoordinator {
    jobs: JobPoolHandle,
    await_timeout: Duration,
    telemetry: Arc<Telemetry>,
}

impl BatchCoordinator {
    pub(crate) fn new(jobs: JobPoolHandle, await_timeout: Duration, telemetry: Arc<Telemetry>) -> Self {
        Self {
            jobs,
            await_timeout,
            telemetry,
        }
    }

    /// Runs the job for every message and returns the ones that succeeded.
    ///
    /// A single timeout covers the whole batch, including time spent waiting
    /// for a free job slot. When it expires the batch yields
    /// [`BatchError::TimedOut`] and no message of it is reported, even those
    /// whose job already finished.
    pub(crate) async fn process(&self, batch: Vec<Message>) -> Result<Vec<Message>, BatchError> {
        let size = batch.len();
        let mut pending = Vec::with_capacity(size);
        for message in batch {
            let receiver = self
                .jobs
                .submit(message)
                .map_err(|_| BatchError::PoolClosed)?;
            pending.push(receiver);
        }

        let outcomes = match timeout(self.await_timeout, join_all(pending)).await {
            Ok(outcomes) => outcomes,
            Err(_) => {
                self.telemetry.record_batch_timeout();
                return Err(BatchError::TimedOut {
                    size,
                    timeout: self.await_timeout,
                });
            }
        };

        // A dropped reply means the worker was torn down mid-job.
        let succeeded: Vec<Message> = outcomes
            .into_iter()
            .filter_map(Result::ok)
            .filter(Outcome::success)
            .map(Outcome::into_message)
            .collect();

        tracing::debug!(
            size,
            succeeded = succeeded.len(),
            failed = size - succeeded.len(),
            "batch completed"
        );
        Ok(succeeded)
    }
}
