//! Engine configuration.
//!
//! Every knob has a default. Values can be overridden from `NOTARY_*`
//! environment variables or loaded from a JSON document; durations are written
//! in humantime form (`90s`, `6h`, `1h 30m`).

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::jobs::RetryPolicy;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },

    #[error("malformed configuration document: {0}")]
    Malformed(String),
}

impl ConfigError {
    fn invalid(key: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub min_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60 * 60),
            max_attempts: 4,
            min_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl UploadConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.max_attempts, self.min_backoff, self.max_backoff)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Give up waiting for the remote service after this long.
    #[serde(with = "humantime_serde")]
    pub max_total_duration: Duration,
    /// Pause between two polls that reported "still in progress".
    #[serde(with = "humantime_serde")]
    pub delay_between_attempts: Duration,
    /// Attempts per poll when the service cannot be reached.
    pub max_failed_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub min_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub attempt_timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            max_total_duration: Duration::from_secs(6 * 60 * 60),
            delay_between_attempts: Duration::from_secs(20),
            max_failed_attempts: 16,
            min_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            attempt_timeout: Duration::from_secs(2 * 60),
        }
    }
}

impl PollConfig {
    /// Policy that keeps polling while the remote service reports progress.
    pub fn progress_policy(&self) -> RetryPolicy {
        RetryPolicy::until(self.max_total_duration, self.delay_between_attempts)
    }

    /// Policy applied to a single poll that could not retrieve anything.
    pub fn failure_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.max_failed_attempts, self.min_backoff, self.max_backoff)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FinalizeConfig {
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub min_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for FinalizeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(4 * 60),
            max_attempts: 3,
            min_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl FinalizeConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.max_attempts, self.min_backoff, self.max_backoff)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Lifetime of a submission from the moment it is registered.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// How long eviction waits for a cancelled job to settle before deleting its file.
    #[serde(with = "humantime_serde")]
    pub cancel_wait: Duration,
}

impl RegistryConfig {
    /// Longest accepted `ttl`.
    pub const MAX_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            cancel_wait: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Wait after each termination signal before escalating.
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Where uploaded payloads are kept while their job lives.
    pub pending_dir: PathBuf,
    pub upload: UploadConfig,
    pub poll: PollConfig,
    pub finalize: FinalizeConfig,
    pub registry: RegistryConfig,
    pub process: ProcessConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pending_dir: PathBuf::from("/tmp/notary/pending-files"),
            upload: UploadConfig::default(),
            poll: PollConfig::default(),
            finalize: FinalizeConfig::default(),
            registry: RegistryConfig::default(),
            process: ProcessConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by any `NOTARY_*` variable present in the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each known key.
    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let env = Overrides { lookup: &lookup };

        env.path("NOTARY_PENDING_DIR", &mut cfg.pending_dir);

        env.duration("NOTARY_UPLOAD_TIMEOUT", &mut cfg.upload.timeout)?;
        env.number("NOTARY_UPLOAD_MAX_ATTEMPTS", &mut cfg.upload.max_attempts)?;
        env.duration("NOTARY_UPLOAD_MIN_BACKOFF", &mut cfg.upload.min_backoff)?;
        env.duration("NOTARY_UPLOAD_MAX_BACKOFF", &mut cfg.upload.max_backoff)?;

        env.duration("NOTARY_POLL_MAX_TOTAL_DURATION", &mut cfg.poll.max_total_duration)?;
        env.duration("NOTARY_POLL_DELAY", &mut cfg.poll.delay_between_attempts)?;
        env.number("NOTARY_POLL_MAX_FAILED_ATTEMPTS", &mut cfg.poll.max_failed_attempts)?;
        env.duration("NOTARY_POLL_MIN_BACKOFF", &mut cfg.poll.min_backoff)?;
        env.duration("NOTARY_POLL_MAX_BACKOFF", &mut cfg.poll.max_backoff)?;
        env.duration("NOTARY_POLL_ATTEMPT_TIMEOUT", &mut cfg.poll.attempt_timeout)?;

        env.duration("NOTARY_FINALIZE_TIMEOUT", &mut cfg.finalize.timeout)?;
        env.number("NOTARY_FINALIZE_MAX_ATTEMPTS", &mut cfg.finalize.max_attempts)?;
        env.duration("NOTARY_FINALIZE_MIN_BACKOFF", &mut cfg.finalize.min_backoff)?;
        env.duration("NOTARY_FINALIZE_MAX_BACKOFF", &mut cfg.finalize.max_backoff)?;

        env.duration("NOTARY_REGISTRY_TTL", &mut cfg.registry.ttl)?;
        env.duration("NOTARY_REGISTRY_CANCEL_WAIT", &mut cfg.registry.cancel_wait)?;

        env.duration("NOTARY_PROCESS_GRACE_PERIOD", &mut cfg.process.grace_period)?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse a JSON document; missing fields keep their defaults.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let cfg: Self =
            serde_json::from_str(raw).map_err(|e| ConfigError::Malformed(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let attempts = [
            ("upload.max_attempts", self.upload.max_attempts),
            ("poll.max_failed_attempts", self.poll.max_failed_attempts),
            ("finalize.max_attempts", self.finalize.max_attempts),
        ];
        for (key, value) in attempts {
            if value == 0 {
                return Err(ConfigError::invalid(key, "must be at least 1"));
            }
        }

        let backoffs = [
            ("upload", self.upload.min_backoff, self.upload.max_backoff),
            ("poll", self.poll.min_backoff, self.poll.max_backoff),
            ("finalize", self.finalize.min_backoff, self.finalize.max_backoff),
        ];
        for (stage, min, max) in backoffs {
            if min > max {
                return Err(ConfigError::invalid(
                    &format!("{stage}.min_backoff"),
                    format!("{min:?} is larger than max_backoff {max:?}"),
                ));
            }
        }

        let positive = [
            ("upload.timeout", self.upload.timeout),
            ("poll.attempt_timeout", self.poll.attempt_timeout),
            ("finalize.timeout", self.finalize.timeout),
            ("registry.ttl", self.registry.ttl),
        ];
        for (key, value) in positive {
            if value.is_zero() {
                return Err(ConfigError::invalid(key, "must be greater than zero"));
            }
        }

        if self.registry.ttl > RegistryConfig::MAX_TTL {
            return Err(ConfigError::invalid(
                "registry.ttl",
                format!(
                    "{} exceeds the maximum of {}",
                    humantime::format_duration(self.registry.ttl),
                    humantime::format_duration(RegistryConfig::MAX_TTL)
                ),
            ));
        }

        if self.pending_dir.as_os_str().is_empty() {
            return Err(ConfigError::invalid("pending_dir", "must not be empty"));
        }

        Ok(())
    }
}

struct Overrides<'a, L> {
    lookup: &'a L,
}

impl<L> Overrides<'_, L>
where
    L: Fn(&str) -> Option<String>,
{
    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn path(&self, key: &str, target: &mut PathBuf) {
        if let Some(value) = self.raw(key) {
            *target = PathBuf::from(value);
        }
    }

    fn duration(&self, key: &str, target: &mut Duration) -> Result<(), ConfigError> {
        if let Some(value) = self.raw(key) {
            *target = humantime::parse_duration(&value)
                .map_err(|e| ConfigError::invalid(key, format!("{value:?}: {e}")))?;
        }
        Ok(())
    }

    fn number<N>(&self, key: &str, target: &mut N) -> Result<(), ConfigError>
    where
        N: FromStr,
        N::Err: std::fmt::Display,
    {
        if let Some(value) = self.raw(key) {
            *target = value
                .parse()
                .map_err(|e| ConfigError::invalid(key, format!("{value:?}: {e}")))?;
        }
        Ok(())
    }
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.pending_dir, PathBuf::from("/tmp/notary/pending-files"));
        assert_eq!(cfg.upload.timeout, Duration::from_secs(3600));
        assert_eq!(cfg.upload.max_attempts, 4);
        assert_eq!(cfg.poll.max_total_duration, Duration::from_secs(6 * 3600));
        assert_eq!(cfg.poll.delay_between_attempts, Duration::from_secs(20));
        assert_eq!(cfg.poll.max_failed_attempts, 16);
        assert_eq!(cfg.finalize.timeout, Duration::from_secs(240));
        assert_eq!(cfg.finalize.max_attempts, 3);
        assert_eq!(cfg.registry.ttl, Duration::from_secs(24 * 3600));
        assert_eq!(cfg.process.grace_period, Duration::from_secs(5));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let cfg = EngineConfig::from_lookup(|_| None).unwrap();
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn environment_overrides_are_applied() {
        let cfg = EngineConfig::from_lookup(lookup_from(&[
            ("NOTARY_PENDING_DIR", "/var/lib/notary"),
            ("NOTARY_UPLOAD_MAX_ATTEMPTS", "7"),
            ("NOTARY_POLL_MAX_TOTAL_DURATION", "2s"),
            ("NOTARY_POLL_DELAY", "500ms"),
            ("NOTARY_REGISTRY_TTL", "1h 30m"),
        ]))
        .unwrap();

        assert_eq!(cfg.pending_dir, PathBuf::from("/var/lib/notary"));
        assert_eq!(cfg.upload.max_attempts, 7);
        assert_eq!(cfg.poll.max_total_duration, Duration::from_secs(2));
        assert_eq!(cfg.poll.delay_between_attempts, Duration::from_millis(500));
        assert_eq!(cfg.registry.ttl, Duration::from_secs(90 * 60));
    }

    #[test]
    fn unparsable_value_is_rejected() {
        let err = EngineConfig::from_lookup(lookup_from(&[("NOTARY_UPLOAD_TIMEOUT", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "NOTARY_UPLOAD_TIMEOUT"));

        let err = EngineConfig::from_lookup(lookup_from(&[("NOTARY_FINALIZE_MAX_ATTEMPTS", "-1")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn zero_attempts_are_rejected() {
        let err = EngineConfig::from_lookup(lookup_from(&[("NOTARY_UPLOAD_MAX_ATTEMPTS", "0")]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "upload.max_attempts".to_string(),
                reason: "must be at least 1".to_string(),
            }
        );
    }

    #[test]
    fn inverted_backoff_bounds_are_rejected() {
        let err = EngineConfig::from_lookup(lookup_from(&[
            ("NOTARY_POLL_MIN_BACKOFF", "2m"),
            ("NOTARY_POLL_MAX_BACKOFF", "1m"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "poll.min_backoff"));
    }

    #[test]
    fn oversized_ttl_is_rejected() {
        let err = EngineConfig::from_lookup(lookup_from(&[(
            "NOTARY_REGISTRY_TTL",
            "500000000000years",
        )]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "registry.ttl"));

        let cfg = EngineConfig::from_lookup(lookup_from(&[("NOTARY_REGISTRY_TTL", "365days")]))
            .unwrap();
        assert_eq!(cfg.registry.ttl, RegistryConfig::MAX_TTL);
    }

    #[test]
    fn json_document_keeps_defaults_for_missing_fields() {
        let cfg = EngineConfig::from_json(
            r#"{"pending_dir":"/srv/pending","poll":{"delay_between_attempts":"5s"}}"#,
        )
        .unwrap();
        assert_eq!(cfg.pending_dir, PathBuf::from("/srv/pending"));
        assert_eq!(cfg.poll.delay_between_attempts, Duration::from_secs(5));
        assert_eq!(cfg.poll.max_failed_attempts, 16);
        assert_eq!(cfg.upload, UploadConfig::default());
    }

    #[test]
    fn json_durations_round_trip_in_humantime_form() {
        let json = serde_json::to_value(EngineConfig::default()).unwrap();
        assert_eq!(json["upload"]["timeout"], "1h");
        assert_eq!(json["poll"]["max_total_duration"], "6h");
    }

    #[test]
    fn policies_follow_stage_settings() {
        let cfg = EngineConfig::default();
        let upload = cfg.upload.retry_policy();
        assert_eq!(upload.max_attempts, Some(4));
        assert_eq!(upload.delay_for_attempt(1), Duration::from_secs(10));

        let progress = cfg.poll.progress_policy();
        assert_eq!(progress.max_attempts, None);
        assert_eq!(progress.max_duration, Some(Duration::from_secs(6 * 3600)));
        assert_eq!(progress.delay_for_attempt(50), Duration::from_secs(20));
    }
}
