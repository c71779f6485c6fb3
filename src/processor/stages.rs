//! Stage handlers run by the fetch, batch and delete pools.
//!
//! Each handler does one unit of work for one lane and reports back to the
//! router through a [`LaneEvent`]. Delete is the exception: it is fire and
//! forget, so nothing waits for it.

use super::coordinator::{BatchCoordinator, BatchError};
use crate::queue::{Message, QueueClient};
use crate::runtime::telemetry::Telemetry;
use anyhow::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FetchRequest {
    pub lane: usize,
}

#[derive(Debug)]
pub(crate) struct BatchRequest {
    pub lane: usize,
    pub messages: Vec<Message>,
}

#[derive(Debug)]
pub(crate) struct DeleteRequest {
    pub lane: usize,
    pub messages: Vec<Message>,
}

#[derive(Debug)]
pub(crate) enum LaneEvent {
    Fetched {
        lane: usize,
        messages: Vec<Message>,
    },
    FetchFailed {
        lane: usize,
        error: Error,
    },
    Processed {
        lane: usize,
        result: Result<Vec<Message>, BatchError>,
    },
}

pub(crate) type LaneEventSender = mpsc::UnboundedSender<LaneEvent>;
pub(crate) type LaneEventReceiver = mpsc::UnboundedReceiver<LaneEvent>;

pub(crate) async fn fetch_stage(
    client: &dyn QueueClient,
    request: FetchRequest,
    run_token: &CancellationToken,
    telemetry: &Telemetry,
    events: &LaneEventSender,
) {
    let FetchRequest { lane } = request;
    if run_token.is_cancelled() {
        tracing::debug!(lane, "run cancelled; skipping fetch");
        return;
    }

    let event = match client.fetch_messages().await {
        Ok(messages) => {
            telemetry.record_fetch(messages.len());
            tracing::trace!(lane, count = messages.len(), "fetched messages");
            LaneEvent::Fetched { lane, messages }
        }
        Err(error) => {
            telemetry.record_fetch_error();
            LaneEvent::FetchFailed { lane, error }
        }
    };

    if events.send(event).is_err() {
        tracing::debug!(lane, "router gone; dropping fetch result");
    }
}

pub(crate) async fn batch_stage(
    coordinator: &BatchCoordinator,
    request: BatchRequest,
    events: &LaneEventSender,
) {
    let BatchRequest { lane, messages } = request;
    let result = coordinator.process(messages).await;
    if events.send(LaneEvent::Processed { lane, result }).is_err() {
        tracing::debug!(lane, "router gone; dropping batch result");
    }
}

pub(crate) async fn delete_stage(
    client: &dyn QueueClient,
    request: DeleteRequest,
    telemetry: &Telemetry,
) {
    let DeleteRequest { lane, messages } = request;
    match client.delete_messages(&messages).await {
        Ok(()) => {
            telemetry.record_deleted(messages.len());
            if !messages.is_empty() {
                tracing::debug!(lane, count = messages.len(), "deleted messages");
            }
        }
        Err(err) => {
            telemetry.record_delete_error();
            tracing::warn!(
                lane,
                count = messages.len(),
                error = %err,
                "failed to delete messages; they will be redelivered"
            );
        }
    }
}
