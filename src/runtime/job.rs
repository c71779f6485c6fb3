use crate::queue::Message;
use anyhow::Result;
use core::future::Future;
use core::pin::Pin;

pub type JobFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// User-supplied work executed once per fetched message.
///
/// Returning `Ok` marks the message for deletion. Any error or panic leaves the
/// message on the queue so the service redelivers it after its visibility
/// timeout; the pipeline itself never retries.
pub trait Job: Send + Sync + 'static {
    fn handle<'a>(&'a self, message: &'a Message) -> JobFuture<'a>;
}

/// [`Job`] backed by an async closure that receives its own copy of the message.
#[derive(Clone)]
pub struct FnJob<F> {
    f: F,
}

/// Wraps an async closure into a [`Job`].
pub fn job_fn<F, Fut>(f: F) -> FnJob<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    FnJob { f }
}

impl<F, Fut> Job for FnJob<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn handle<'a>(&'a self, message: &'a Message) -> JobFuture<'a> {
        Box::pin((self.f)(message.clone()))
    }
}
