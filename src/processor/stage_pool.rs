//! Fixed-width worker pools fed by a multi-consumer channel.
//!
//! Every pipeline role (fetch, batch, delete, jobs) runs on one of these
//! pools. Workers pull items until the input channel is closed and drained;
//! stopping a pool closes the channel, waits a bounded grace period for the
//! workers to finish, and aborts whatever is still running afterwards.

use anyhow::{bail, Result};
use futures::future::join_all;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::timeout;

pub(crate) struct StagePool<T> {
    name: &'static str,
    tx: async_channel::Sender<T>,
    workers: Vec<JoinHandle<()>>,
}

/// Cloneable submission side of a [`StagePool`].
pub(crate) struct StageSender<T> {
    name: &'static str,
    tx: async_channel::Sender<T>,
}

impl<T> Clone for StageSender<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
        }
    }
}

impl<T> StageSender<T> {
    /// Queues `item` for the next free worker. Never waits; fails once the pool is stopping.
    pub(crate) fn dispatch(&self, item: T) -> Result<()> {
        if self.tx.try_send(item).is_err() {
            bail!("{} pool is closed", self.name);
        }
        Ok(())
    }
}

impl<T: Send + 'static> StagePool<T> {
    pub(crate) fn spawn<H, Fut>(name: &'static str, width: usize, handler: H) -> Self
    where
        H: Fn(usize, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let width = width.max(1);
        let (tx, rx) = async_channel::unbounded::<T>();
        let handler = Arc::new(handler);

        let workers = (0..width)
            .map(|worker_id| {
                let rx = rx.clone();
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    while let Ok(item) = rx.recv().await {
                        let result = AssertUnwindSafe((*handler)(worker_id, item))
                            .catch_unwind()
                            .await;
                        if let Err(panic_payload) = result {
                            tracing::error!(
                                pool = name,
                                worker = worker_id,
                                panic = %panic_message(panic_payload.as_ref()),
                                "stage handler panicked"
                            );
                        }
                    }
                    tracing::debug!(pool = name, worker = worker_id, "stage worker exited");
                })
            })
            .collect();

        tracing::debug!(pool = name, width, "stage pool started");
        Self { name, tx, workers }
    }

    pub(crate) fn sender(&self) -> StageSender<T> {
        StageSender {
            name: self.name,
            tx: self.tx.clone(),
        }
    }

    pub(crate) fn width(&self) -> usize {
        self.workers.len()
    }

    /// Closes the input channel and waits up to `grace` for workers to drain it.
    ///
    /// Returns `false` when the grace period expired and the workers were aborted.
    pub(crate) async fn stop(mut self, grace: Duration) -> bool {
        self.tx.close();
        let pending = self.tx.len();
        tracing::debug!(pool = self.name, pending, "stopping stage pool");

        let handles = std::mem::take(&mut self.workers);
        let abort_handles: Vec<AbortHandle> =
            handles.iter().map(JoinHandle::abort_handle).collect();

        match timeout(grace, join_all(handles)).await {
            Ok(results) => {
                for (worker_id, result) in results.into_iter().enumerate() {
                    if let Err(err) = result {
                        tracing::warn!(
                            pool = self.name,
                            worker = worker_id,
                            error = %err,
                            "stage worker terminated unexpectedly"
                        );
                    }
                }
                tracing::debug!(pool = self.name, "stage pool stopped");
                true
            }
            Err(_) => {
                tracing::warn!(
                    pool = self.name,
                    grace_ms = grace.as_millis() as u64,
                    "stage pool did not stop within grace period; aborting workers"
                );
                for handle in abort_handles {
                    handle.abort();
                }
                false
            }
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
