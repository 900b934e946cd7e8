//! Externally observable job status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::Handle;

/// Coarse lifecycle state of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    /// Some stage is still running (or about to run).
    InProgress,
    /// Every requested stage succeeded; the artifact can be fetched.
    Complete,
    /// A stage failed for good. Carries a message and optional detail.
    Error,
}

impl State {
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Complete | State::Error)
    }

    /// Position in the forward-only ordering `IN_PROGRESS < {COMPLETE, ERROR}`.
    pub fn rank(&self) -> u8 {
        match self {
            State::InProgress => 0,
            State::Complete | State::Error => 1,
        }
    }
}

impl core::fmt::Display for State {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            State::InProgress => "IN_PROGRESS",
            State::Complete => "COMPLETE",
            State::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Snapshot of a job's progress.
///
/// Values are immutable; every transition publishes a new `Status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    #[serde(rename = "status")]
    pub state: State,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub more_info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Status {
    fn new(state: State, message: impl Into<String>) -> Self {
        Self {
            state,
            message: message.into(),
            more_info: None,
            log: None,
            updated_at: Utc::now(),
        }
    }

    pub fn in_progress(message: impl Into<String>) -> Self {
        Self::new(State::InProgress, message)
    }

    pub fn complete(message: impl Into<String>) -> Self {
        Self::new(State::Complete, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(State::Error, message)
    }

    /// Status every job starts with, before its first stage has run.
    pub fn initial() -> Self {
        Self::in_progress("Uploading file to the signing service")
    }

    pub fn with_more_info(mut self, more_info: impl Into<String>) -> Self {
        self.more_info = Some(more_info.into());
        self
    }

    /// Attach a log blob. `None` leaves any existing log in place.
    pub fn with_log(mut self, log: Option<String>) -> Self {
        if log.is_some() {
            self.log = log;
        }
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether moving from `self` to `next` respects the forward-only rule.
    pub fn can_transition_to(&self, next: &Status) -> bool {
        !self.is_terminal() && next.state.rank() >= self.state.rank()
    }
}

/// A status paired with the handle it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusWithHandle {
    pub handle: Handle,
    pub status: Status,
}

impl StatusWithHandle {
    pub fn new(handle: Handle, status: Status) -> Self {
        Self { handle, status }
    }
}
