use std::fmt;
use std::sync::Arc;

/// Opaque token handed out by the queue service on every receive.
///
/// Only the handle from the most recent receive of a message can delete it.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(Arc<str>);

impl ReceiptHandle {
    pub fn new(handle: impl Into<Arc<str>>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ReceiptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ReceiptHandle").field(&self.as_str()).finish()
    }
}

impl fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message received from the queue service.
///
/// Messages are immutable once fetched and move by value through the
/// pipeline: fetch stage, batch coordinator, job runner, delete stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    id: String,
    receipt_handle: ReceiptHandle,
    body: String,
    receive_count: u32,
}

impl Message {
    pub fn new(
        id: impl Into<String>,
        receipt_handle: ReceiptHandle,
        body: impl Into<String>,
        receive_count: u32,
    ) -> Self {
        Self {
            id: id.into(),
            receipt_handle,
            body: body.into(),
            receive_count,
        }
    }

    /// Service-assigned message id; stable across redeliveries.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn receipt_handle(&self) -> &ReceiptHandle {
        &self.receipt_handle
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Number of times the service has handed this message out, starting at 1.
    pub fn receive_count(&self) -> u32 {
        self.receive_count
    }
}
