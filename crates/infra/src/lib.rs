//! Submission engine: runs uploaded payloads through an external service in
//! three stages (upload, poll, optional finalize) and keeps them reachable by
//! handle for a bounded time.

pub mod adapter;
pub mod config;
pub mod jobs;
pub mod process;
pub mod service;

pub use adapter::{CommandAdapter, CommandTemplate, StageError, ToolAdapter};
pub use config::{ConfigError, EngineConfig};
pub use jobs::{Job, Registry, Retry, RetryPolicy, Stages};
pub use process::{ProcessError, ProcessOutput, ProcessRunner, ProcessSpec};
pub use service::{Artifact, ServiceError, SubmissionService};
