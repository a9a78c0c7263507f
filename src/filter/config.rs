//! Filter configuration.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::SavepointName;
use crate::filter::backoff::BackoffPolicy;
use crate::transaction::RollbackOnlyPolicy;

/// Default attempt budget per request.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Errors loading a [`FilterConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Configuration of the request transaction filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Handler invocations allowed per request.
    pub max_attempts: u32,
    /// Pause between attempts.
    pub backoff: BackoffPolicy,
    /// Name of the restart savepoint.
    pub savepoint_name: SavepointName,
    /// Transaction timeout handed to the boundary tracker; 0 disables it.
    pub transaction_timeout_secs: u64,
    pub rollback_only_policy: RollbackOnlyPolicy,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: BackoffPolicy::default(),
            savepoint_name: SavepointName::default(),
            transaction_timeout_secs: 0,
            rollback_only_policy: RollbackOnlyPolicy::default(),
        }
    }
}

impl FilterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate a JSON document. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: FilterConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if let BackoffPolicy::Exponential { base_ms, max_ms, .. } = self.backoff {
            if base_ms > max_ms {
                return Err(ConfigError::Invalid(format!(
                    "backoff base {}ms exceeds max {}ms",
                    base_ms, max_ms
                )));
            }
        }
        Ok(())
    }

    /// Set the attempt budget.
    pub fn max_attempts(mut self, value: u32) -> Self {
        self.max_attempts = value;
        self
    }

    pub fn backoff(mut self, value: BackoffPolicy) -> Self {
        self.backoff = value;
        self
    }

    pub fn savepoint_name(mut self, value: SavepointName) -> Self {
        self.savepoint_name = value;
        self
    }

    /// Set the transaction timeout in seconds.
    pub fn transaction_timeout_secs(mut self, value: u64) -> Self {
        self.transaction_timeout_secs = value;
        self
    }

    pub fn rollback_only_policy(mut self, value: RollbackOnlyPolicy) -> Self {
        self.rollback_only_policy = value;
        self
    }

    /// The timeout as a duration, `None` when disabled.
    pub fn transaction_timeout(&self) -> Option<Duration> {
        (self.transaction_timeout_secs > 0)
            .then(|| Duration::from_secs(self.transaction_timeout_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = FilterConfig::default();
        assert_eq!(config.max_attempts, 10);
        assert_eq!(config.savepoint_name.as_str(), "cockroach_restart");
        assert_eq!(config.rollback_only_policy, RollbackOnlyPolicy::Ignore);
        assert_eq!(config.transaction_timeout(), None);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = FilterConfig::from_json(
            r#"{"max_attempts": 3, "backoff": {"kind": "yield"}, "transaction_timeout_secs": 30}"#,
        )
        .unwrap();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.backoff, BackoffPolicy::Yield);
        assert_eq!(config.transaction_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.savepoint_name, SavepointName::default());
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(matches!(
            FilterConfig::from_json(r#"{"max_attempts": 0}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            FilterConfig::from_json(r#"{"savepoint_name": "drop table"}"#),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            FilterConfig::from_json(
                r#"{"backoff": {"kind": "exponential", "base_ms": 50, "max_ms": 10, "jitter": false}}"#
            ),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"savepoint_name": "sp_retry", "rollback_only_policy": "honor"}}"#
        )
        .unwrap();

        let config = FilterConfig::load(file.path()).unwrap();
        assert_eq!(config.savepoint_name.as_str(), "sp_retry");
        assert_eq!(config.rollback_only_policy, RollbackOnlyPolicy::Honor);

        let missing = file.path().with_extension("missing");
        assert!(matches!(FilterConfig::load(missing), Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_builder() {
        let config = FilterConfig::new()
            .max_attempts(4)
            .backoff(BackoffPolicy::Yield)
            .transaction_timeout_secs(5)
            .rollback_only_policy(RollbackOnlyPolicy::Honor);
        assert!(config.validate().is_ok());
        assert_eq!(config.max_attempts, 4);
        assert_eq!(config.transaction_timeout(), Some(Duration::from_secs(5)));
    }
}
