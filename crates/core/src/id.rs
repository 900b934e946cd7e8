//! Opaque submission handles.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Identifier handed back to callers after a submission.
///
/// 128 bits of randomness (UUIDv4): handles must not be guessable, so unlike
/// time-ordered ids they carry no creation timestamp.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(Uuid);

impl Handle {
    /// Generate a fresh random handle.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl core::fmt::Display for Handle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for Handle {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<Handle> for Uuid {
    fn from(value: Handle) -> Self {
        value.0
    }
}

impl FromStr for Handle {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::from_str(s.trim())
            .map_err(|e| DomainError::invalid_id(format!("Handle: {e}")))?;
        Ok(Self(uuid))
    }
}
