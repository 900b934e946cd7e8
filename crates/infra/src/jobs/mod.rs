//! Submission jobs: retry policies, the per-job state machine and the
//! registry that keeps jobs reachable for a bounded time.
//!
//! ## Components
//!
//! - `RetryPolicy` / `Retry`: attempt, delay and duration bounds for one stage
//! - `Job`: runs upload, poll and (optionally) finalize in the background
//! - `Registry`: handle to job lookup with expiry-driven cleanup

pub mod job;
pub mod registry;
pub mod retry;

pub use job::{Job, StageContext, StageFuture, Stages};
pub use registry::{Registry, RegistryStats};
pub use retry::{BackoffStrategy, Retry, RetryPolicy, RetryStats};
