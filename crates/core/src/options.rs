//! Caller-supplied submission options.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Options attached to a submission.
///
/// `params` are opaque to the engine and forwarded to the tool adapter
/// (e.g. a bundle identifier).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Run the finalize stage after a successful poll.
    #[serde(default)]
    pub finalize: bool,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_finalize(mut self, finalize: bool) -> Self {
        self.finalize = finalize;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Parse the JSON options document sent alongside an uploaded file.
    pub fn from_json(raw: &str) -> DomainResult<Self> {
        serde_json::from_str(raw).map_err(|e| DomainError::validation(format!("options: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalize_defaults_to_false() {
        let opts = JobOptions::from_json(r#"{"params":{"bundle_id":"org.example"}}"#).unwrap();
        assert!(!opts.finalize);
        assert_eq!(opts.param("bundle_id"), Some("org.example"));
    }

    #[test]
    fn malformed_json_is_a_validation_error() {
        let err = JobOptions::from_json("{finalize:").unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn builder_sets_fields() {
        let opts = JobOptions::new().with_finalize(true).with_param("k", "v");
        assert!(opts.finalize);
        assert_eq!(opts.param("k"), Some("v"));
        assert_eq!(opts.param("missing"), None);
    }
}
