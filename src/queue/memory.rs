//! In-process queue that mimics a managed at-least-once queue service:
//! long-poll receives, per-receive receipt handles, a visibility timeout that
//! redelivers undeleted messages, and idempotent deletes.

use super::client::{QueueClient, QueueFuture, MAX_MESSAGES_PER_FETCH};
use super::message::{Message, ReceiptHandle};
use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};

const DEFAULT_VISIBILITY_TIMEOUT_SECS: u64 = 30;
const DEFAULT_WAIT_TIME_MS: u64 = 1_000;

#[derive(Debug, Clone)]
pub struct MemoryQueueOptions {
    /// How long a received message stays hidden before it is redelivered.
    pub visibility_timeout: Duration,
    /// Long-poll duration of a receive that finds no visible message.
    pub wait_time: Duration,
    /// Receive limit, capped at [`MAX_MESSAGES_PER_FETCH`].
    pub max_messages: usize,
}

impl Default for MemoryQueueOptions {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(DEFAULT_VISIBILITY_TIMEOUT_SECS),
            wait_time: Duration::from_millis(DEFAULT_WAIT_TIME_MS),
            max_messages: MAX_MESSAGES_PER_FETCH,
        }
    }
}

#[derive(Debug)]
struct Entry {
    id: String,
    body: String,
    receive_count: u32,
    visible_at: Instant,
    receipt: Option<ReceiptHandle>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: VecDeque<Entry>,
    next_id: u64,
    next_receipt: u64,
}

#[derive(Debug)]
pub struct MemoryQueue {
    name: String,
    options: MemoryQueueOptions,
    inner: Mutex<Inner>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_options(name, MemoryQueueOptions::default())
    }

    pub fn with_options(name: impl Into<String>, mut options: MemoryQueueOptions) -> Self {
        options.max_messages = options.max_messages.clamp(1, MAX_MESSAGES_PER_FETCH);
        Self {
            name: name.into(),
            options,
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &MemoryQueueOptions {
        &self.options
    }

    /// Enqueues a message and returns its id.
    pub fn send(&self, body: impl Into<String>) -> String {
        let id = {
            let mut inner = self.lock();
            inner.next_id += 1;
            let id = format!("{}-{}", self.name, inner.next_id);
            inner.entries.push_back(Entry {
                id: id.clone(),
                body: body.into(),
                receive_count: 0,
                visible_at: Instant::now(),
                receipt: None,
            });
            id
        };
        self.notify.notify_waiters();
        id
    }

    /// Number of stored messages, visible or not.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of messages currently hidden by an unexpired visibility timeout.
    pub fn in_flight(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .entries
            .iter()
            .filter(|entry| entry.visible_at > now)
            .count()
    }

    /// Long-poll receive. Returns as soon as at least one message is visible,
    /// or an empty batch once `wait_time` has elapsed.
    pub async fn receive(&self) -> Vec<Message> {
        let deadline = Instant::now() + self.options.wait_time;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (messages, next_visible) = self.take_visible(Instant::now());
            if !messages.is_empty() || Instant::now() >= deadline {
                return messages;
            }

            let wake_at = next_visible.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = &mut notified => {}
                _ = sleep_until(wake_at) => {}
            }
        }
    }

    /// Removes every message whose latest receipt handle is in `messages`.
    /// Returns how many were removed; stale or unknown handles are skipped.
    pub fn delete(&self, messages: &[Message]) -> usize {
        if messages.is_empty() {
            return 0;
        }

        let handles: HashSet<&ReceiptHandle> =
            messages.iter().map(Message::receipt_handle).collect();
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner.entries.retain(|entry| {
            entry
                .receipt
                .as_ref()
                .map_or(true, |receipt| !handles.contains(receipt))
        });
        let removed = before - inner.entries.len();
        if removed < messages.len() {
            tracing::debug!(
                queue = %self.name,
                requested = messages.len(),
                removed,
                "ignored delete for stale or already removed receipt handles"
            );
        }
        removed
    }

    fn take_visible(&self, now: Instant) -> (Vec<Message>, Option<Instant>) {
        let mut guard = self.lock();
        let Inner {
            entries,
            next_receipt,
            ..
        } = &mut *guard;

        let mut taken = Vec::new();
        let mut next_visible: Option<Instant> = None;
        for entry in entries.iter_mut() {
            if entry.visible_at > now {
                let at = entry.visible_at;
                next_visible = Some(next_visible.map_or(at, |current| current.min(at)));
                continue;
            }
            if taken.len() >= self.options.max_messages {
                continue;
            }

            *next_receipt += 1;
            let receipt = ReceiptHandle::new(format!("{}#{}", entry.id, next_receipt));
            entry.receive_count = entry.receive_count.saturating_add(1);
            entry.visible_at = now + self.options.visibility_timeout;
            entry.receipt = Some(receipt.clone());
            taken.push(Message::new(
                entry.id.clone(),
                receipt,
                entry.body.clone(),
                entry.receive_count,
            ));
        }

        (taken, next_visible)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl QueueClient for MemoryQueue {
    fn fetch_messages(&self) -> QueueFuture<'_, Vec<Message>> {
        Box::pin(async move { Ok(self.receive().await) })
    }

    fn delete_messages<'a>(&'a self, messages: &'a [Message]) -> QueueFuture<'a, ()> {
        Box::pin(async move {
            self.delete(messages);
            Ok(())
        })
    }
}
