//! Queue service boundary: message types, the client trait consumed by the
//! pipeline stages, and an in-memory queue with visibility-timeout semantics.

pub mod client;
pub mod memory;
pub mod message;

pub use client::{QueueClient, QueueFuture, MAX_MESSAGES_PER_FETCH};
pub use memory::{MemoryQueue, MemoryQueueOptions};
pub use message::{Message, ReceiptHandle};
