//! Recovery configuration
//!
//! One TOML document with a table per component. Every field is optional;
//! missing values take the component defaults.
//!
//! ```toml
//! [retry]
//! max_retries = 5
//! base_delay_secs = 0.5
//!
//! [loop_detection]
//! breaker_timeout_secs = 120
//!
//! [escalation]
//! critical_kinds = ["permission_error", "configuration_error"]
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{OpResult, OperationalError};
use crate::escalation::EscalationConfig;
use crate::history::HistoryConfig;
use crate::loop_detect::LoopConfig;
use crate::retry::RetryConfig;
use crate::snapshot::SnapshotConfig;

/// Configuration for every component of the core
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub retry: RetryConfig,
    pub snapshot: SnapshotConfig,
    pub loop_detection: LoopConfig,
    pub escalation: EscalationConfig,
    pub history: HistoryConfig,
}

impl RecoveryConfig {
    /// Parse a TOML document
    pub fn from_toml_str(s: &str) -> OpResult<Self> {
        toml::from_str(s).map_err(|e| OperationalError::config(e.to_string()))
    }

    /// Read and parse a TOML file
    pub fn load(path: impl AsRef<Path>) -> OpResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| OperationalError::config(format!("{}: {}", path.display(), e)))?;
        let config = Self::from_toml_str(&raw)?;
        debug!(path = %path.display(), "Loaded recovery config");
        Ok(config)
    }

    /// Apply `RECOVERY_*` environment variables on top of this config
    pub fn with_env_overrides(self) -> Self {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(n) = lookup("RECOVERY_MAX_RETRIES").and_then(|v| v.parse().ok()) {
            self.retry.max_retries = n;
        }
        if let Some(n) = lookup("RECOVERY_BREAKER_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.loop_detection.breaker_timeout_secs = n;
        }
        if let Some(n) = lookup("RECOVERY_SNAPSHOT_MAX_PER_AGENT").and_then(|v| v.parse().ok()) {
            self.snapshot.max_per_agent = n;
        }
        if let Some(n) = lookup("RECOVERY_HISTORY_MAX_VERSIONS").and_then(|v| v.parse().ok()) {
            self.history.max_versions_per_agent = n;
        }
        self
    }

    pub fn validate(&self) -> OpResult<()> {
        self.retry.validate()?;
        self.snapshot.validate()?;
        self.loop_detection.validate()?;
        self.escalation.validate()?;
        self.history.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FailureKind;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = RecoveryConfig::default();
        config.validate().unwrap();
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.snapshot.max_per_agent, 10);
        assert_eq!(config.loop_detection.breaker_timeout_secs, 60);
        assert_eq!(config.history.max_versions_per_agent, 100);
    }

    #[test]
    fn test_partial_toml() {
        let config = RecoveryConfig::from_toml_str(
            r#"
            [retry]
            max_retries = 5

            [loop_detection]
            breaker_timeout_secs = 120

            [escalation]
            critical_kinds = ["permission_error", "configuration_error"]
            "#,
        )
        .unwrap();
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.base_delay_secs, 1.0);
        assert_eq!(config.loop_detection.breaker_timeout_secs, 120);
        assert_eq!(config.loop_detection.buffer_size, 100);
        assert_eq!(
            config.escalation.critical_kinds,
            vec![FailureKind::PermissionError, FailureKind::ConfigurationError]
        );
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        let err = RecoveryConfig::from_toml_str("[retry]\nmax_retries = \"many\"").unwrap_err();
        assert_eq!(err.code(), "INVALID_CONFIG");
        assert!(RecoveryConfig::load("/nonexistent/recovery.toml").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env = HashMap::from([
            ("RECOVERY_MAX_RETRIES", "7"),
            ("RECOVERY_BREAKER_TIMEOUT_SECS", "not-a-number"),
            ("RECOVERY_HISTORY_MAX_VERSIONS", "50"),
        ]);
        let config = RecoveryConfig::default()
            .apply_overrides(|name| env.get(name).map(|v| v.to_string()));
        assert_eq!(config.retry.max_retries, 7);
        assert_eq!(config.loop_detection.breaker_timeout_secs, 60);
        assert_eq!(config.history.max_versions_per_agent, 50);
        assert_eq!(config.snapshot.max_per_agent, 10);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = RecoveryConfig::default();
        config.loop_detection.min_pattern_length = 30;
        assert!(config.validate().is_err());

        let mut config = RecoveryConfig::default();
        config.retry.adaptive_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = RecoveryConfig::default();
        config.snapshot.max_per_agent = 0;
        assert!(config.validate().is_err());
    }
}
