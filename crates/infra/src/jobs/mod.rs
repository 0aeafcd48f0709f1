//! Background job system with retry, backoff, and dead-letter handling.
//!
//! - `on_enter` hooks return `JobRequest`s; the processor enqueues them only
//!   after the command's batch has committed
//! - handlers are registered per job kind (exact, `prefix.*`, `*`)
//! - failed jobs are retried per `RetryPolicy` and dead-lettered afterwards

pub mod executor;
pub mod store;
pub mod types;

pub use executor::{ExecutorStats, JobExecutor, JobExecutorConfig, JobExecutorHandle, JobHandler};
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use types::{BackoffStrategy, DeadLetterEntry, Job, JobId, JobKind, JobResult, JobStatus, RetryPolicy};
