//! `notary-core`: domain values shared by the submission engine.
//!
//! This crate contains **pure values** (no I/O, no runtime): handles, the
//! externally observable job status, the per-stage result records and the
//! options a caller attaches to a submission.

pub mod error;
pub mod id;
pub mod options;
pub mod stage;
pub mod status;

pub use error::{DomainError, DomainResult};
pub use id::Handle;
pub use options::JobOptions;
pub use stage::{
    FinalizeResult, FinalizeStatus, InfoResult, InfoStatus, UploadResult, UploadStatus,
};
pub use status::{State, Status, StatusWithHandle};
