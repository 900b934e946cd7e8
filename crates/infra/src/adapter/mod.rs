//! The seam between the engine and the remote service tooling.
//!
//! The engine only knows that a payload gets uploaded, its remote processing
//! polled, and the result optionally finalized. Everything tool specific
//! (command lines, output formats, credentials) lives behind [`ToolAdapter`].

mod command;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use notary_core::{FinalizeResult, InfoResult, JobOptions, UploadResult};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::process::ProcessError;

pub use command::{CommandAdapter, CommandTemplate};

/// Why a stage attempt produced no result at all.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StageError {
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("i/o failure: {0}")]
    Io(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("unexpected tool output: {0}")]
    Parse(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl StageError {
    /// Failures worth another attempt under the stage's retry policy.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StageError::Timeout(_) | StageError::Io(_) | StageError::Execution(_)
        )
    }
}

impl From<ProcessError> for StageError {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::Timeout { .. } => StageError::Timeout(err.to_string()),
            ProcessError::Spawn { .. } | ProcessError::Io { .. } => StageError::Io(err.to_string()),
            ProcessError::Cancelled { .. } => StageError::Cancelled,
            ProcessError::Unkillable { .. } => StageError::Internal(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub file: PathBuf,
    pub options: JobOptions,
    /// Budget for one attempt.
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollRequest {
    pub correlation_id: String,
    pub options: JobOptions,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeRequest {
    pub file: PathBuf,
    pub options: JobOptions,
    pub timeout: Duration,
}

/// One attempt of each stage against the remote service.
///
/// Implementations must return promptly (with [`StageError::Cancelled`] or
/// whatever they have) once `cancel` fires. Retrying is the caller's job.
#[async_trait]
pub trait ToolAdapter: Send + Sync + 'static {
    async fn submit(
        &self,
        request: &UploadRequest,
        cancel: &CancellationToken,
    ) -> Result<UploadResult, StageError>;

    async fn poll_once(
        &self,
        request: &PollRequest,
        cancel: &CancellationToken,
    ) -> Result<InfoResult, StageError>;

    async fn finalize(
        &self,
        request: &FinalizeRequest,
        cancel: &CancellationToken,
    ) -> Result<FinalizeResult, StageError>;
}

#[async_trait]
impl<A> ToolAdapter for Arc<A>
where
    A: ToolAdapter + ?Sized,
{
    async fn submit(
        &self,
        request: &UploadRequest,
        cancel: &CancellationToken,
    ) -> Result<UploadResult, StageError> {
        (**self).submit(request, cancel).await
    }

    async fn poll_once(
        &self,
        request: &PollRequest,
        cancel: &CancellationToken,
    ) -> Result<InfoResult, StageError> {
        (**self).poll_once(request, cancel).await
    }

    async fn finalize(
        &self,
        request: &FinalizeRequest,
        cancel: &CancellationToken,
    ) -> Result<FinalizeResult, StageError> {
        (**self).finalize(request, cancel).await
    }
}
