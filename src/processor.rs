//! Pipeline orchestration: stage pools, the shared job pool, batch
//! coordination and the consumer that wires them into lanes.

pub mod consumer;
pub mod coordinator;
pub mod job_pool;
pub(crate) mod lifecycle;
pub(crate) mod stage_pool;
pub(crate) mod stages;
