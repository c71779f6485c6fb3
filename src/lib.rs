pub mod processor;
pub mod queue;
pub mod runtime;

pub use processor::consumer::Consumer;
pub use processor::coordinator::BatchError;
pub use processor::job_pool::Outcome;
pub use queue::{
    Message, MemoryQueue, MemoryQueueOptions, QueueClient, QueueFuture, ReceiptHandle,
    MAX_MESSAGES_PER_FETCH,
};
pub use runtime::config::{
    lanes_for_concurrency, ConsumerConfig, ConsumerConfigBuilder, ConsumerConfigParams,
};
pub use runtime::job::{job_fn, FnJob, Job, JobFuture};
pub use runtime::runner::Runner;
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
