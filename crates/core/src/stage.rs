//! Per-stage result records.
//!
//! Each stage attempt produces exactly one of these values. They are consumed
//! by retry predicates (should this attempt be repeated?) and by the job's
//! status-update logic (what does the outside world see now?).

use serde::{Deserialize, Serialize};

/// Outcome of the upload stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Successful,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResult {
    pub status: UploadStatus,
    pub message: String,
    /// Id assigned by the remote service; required by the poll stage.
    pub correlation_id: Option<String>,
}

impl UploadResult {
    pub fn successful(correlation_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: UploadStatus::Successful,
            message: message.into(),
            correlation_id: Some(correlation_id.into()),
        }
    }

    /// The remote service already knows this payload. Treated as a success
    /// that continues with the id it reported.
    pub fn already_uploaded(correlation_id: impl Into<String>) -> Self {
        Self::successful(
            correlation_id,
            "Signing in progress (file had already been uploaded to the signing service)",
        )
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: UploadStatus::Failed,
            message: message.into(),
            correlation_id: None,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == UploadStatus::Failed
    }
}

/// Outcome of one poll of the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InfoStatus {
    /// Remote processing not finished yet.
    InProgress,
    Successful,
    /// Remote processing finished and rejected the payload.
    Failed,
    /// The service could not tell us anything (transient).
    RetrievalFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoResult {
    pub status: InfoStatus,
    pub message: String,
    pub log: Option<String>,
}

impl InfoResult {
    pub fn new(status: InfoStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            log: None,
        }
    }

    pub fn in_progress(message: impl Into<String>) -> Self {
        Self::new(InfoStatus::InProgress, message)
    }

    pub fn successful(message: impl Into<String>) -> Self {
        Self::new(InfoStatus::Successful, message)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(InfoStatus::Failed, message)
    }

    pub fn retrieval_failed(message: impl Into<String>) -> Self {
        Self::new(InfoStatus::RetrievalFailed, message)
    }

    pub fn with_log(mut self, log: impl Into<String>) -> Self {
        self.log = Some(log.into());
        self
    }

    pub fn is_in_progress(&self) -> bool {
        self.status == InfoStatus::InProgress
    }

    pub fn is_retrieval_failure(&self) -> bool {
        self.status == InfoStatus::RetrievalFailed
    }
}

/// Outcome of the optional finalize stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizeStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeResult {
    pub status: FinalizeStatus,
    pub message: String,
}

impl FinalizeResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: FinalizeStatus::Success,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: FinalizeStatus::Error,
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == FinalizeStatus::Error
    }
}
