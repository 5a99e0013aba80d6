//! Transaction submission jobs: persistence, ready queue, workers, retries.
//!
//! ## Lifecycle
//!
//! `queued → active → completed | delayed | failed`, with `delayed → queued`
//! once the retry time passes and `active → queued | failed` when a lease
//! expires. Every transition is a compare-and-set against the job's
//! (state, lease token) revision.
//!
//! ## Components
//!
//! - `types`: `Job`, `RetryPolicy`, the state machine
//! - `store`: `JobStore` and the in-memory implementation with retention caps
//! - `queue`: `JobQueue`, the FIFO of ready job ids
//! - `pipeline`: `SubmitPipeline`, the entry points callers use
//! - `worker`: `WorkerPool`, bounded-concurrency execution
//! - `scheduler`: promotes due retries and reclaims expired leases
//! - `redis`: durable store + queue (feature `redis`)

pub mod pipeline;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod types;
pub mod worker;

#[cfg(feature = "redis")]
pub mod redis;

#[cfg(test)]
pub(crate) mod testing;

pub use pipeline::{PipelineError, SubmitPipeline};
pub use queue::{InMemoryJobQueue, JobQueue};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerHandle, TickReport};
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError, Retention};
pub use types::{BackoffStrategy, Job, JobResult, JobState, JobSummary, Lease, Revision, RetryPolicy};
pub use worker::{PoolStats, WorkerPool, WorkerPoolConfig, WorkerPoolHandle};

#[cfg(feature = "redis")]
pub use self::redis::RedisJobStore;
