//! Client abstraction over the remote queue service. The pipeline only ever
//! fetches and deletes; everything else about the service stays behind this
//! trait.

use super::message::Message;
use anyhow::Result;
use futures::future::BoxFuture;

/// Per-call receive limit enforced by managed queue services.
pub const MAX_MESSAGES_PER_FETCH: usize = 10;

pub type QueueFuture<'a, T> = BoxFuture<'a, Result<T>>;

pub trait QueueClient: Send + Sync {
    /// Receives up to [`MAX_MESSAGES_PER_FETCH`] messages.
    ///
    /// May suspend until messages are available or a service-defined wait
    /// elapses, in which case the returned batch is empty.
    fn fetch_messages(&self) -> QueueFuture<'_, Vec<Message>>;

    /// Deletes the given messages using their receipt handles.
    ///
    /// Empty input is a no-op and deleting an already removed message is not
    /// an error.
    fn delete_messages<'a>(&'a self, messages: &'a [Message]) -> QueueFuture<'a, ()>;
}
