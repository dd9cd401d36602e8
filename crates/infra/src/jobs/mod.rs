//! Bounded worker pool with in-place retries and caller-thread fallback.
//!
//! ## Components
//!
//! - `Job`: attempt bookkeeping for a unit of work
//! - `JobHandler`: executes a job and receives its terminal failure
//! - `WorkerPool`: fixed worker threads over a bounded FIFO queue
//! - `PoolMetrics`: processed / failed / retried counters per pool and worker

pub mod metrics;
pub mod pool;
pub mod types;

pub use metrics::{PoolMetrics, WorkerStats};
pub use pool::{JobHandler, PoolConfig, SpawnError, SubmitError, Submitted, WorkerId, WorkerPool};
pub use types::{Attempts, BackoffStrategy, Job, RetryPolicy};
