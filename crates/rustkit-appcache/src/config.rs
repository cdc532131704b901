//! Update engine configuration.

use serde::{Deserialize, Serialize};

use rustkit_common::RetryConfig;

use crate::manifest::ParseMode;

/// Tunables for update jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Fetches in flight at once while downloading.
    pub max_concurrent_fetches: usize,
    /// Restarts allowed when the manifest changes during an update.
    pub max_manifest_restarts: u32,
    /// Retry policy for 503 responses.
    pub retry: RetryConfig,
    pub parse_mode: ParseMode,
    /// Completed fetches between progress flushes (1 = flush every fetch).
    pub progress_batch: usize,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: 4,
            max_manifest_restarts: 1,
            retry: RetryConfig::once(),
            parse_mode: ParseMode::PerStandard,
            progress_batch: 1,
        }
    }
}

impl UpdateConfig {
    /// Load from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Concurrency bound, never below one.
    pub fn fetch_limit(&self) -> usize {
        self.max_concurrent_fetches.max(1)
    }

    pub fn progress_interval(&self) -> usize {
        self.progress_batch.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = UpdateConfig::default();
        assert_eq!(config.max_concurrent_fetches, 4);
        assert_eq!(config.max_manifest_restarts, 1);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.parse_mode, ParseMode::PerStandard);
    }

    #[test]
    fn test_partial_json() {
        let config =
            UpdateConfig::from_json(r#"{"max_concurrent_fetches": 8, "parse_mode": "allow-dangerous-features"}"#)
                .unwrap();
        assert_eq!(config.max_concurrent_fetches, 8);
        assert_eq!(config.parse_mode, ParseMode::AllowDangerousFeatures);
        assert_eq!(config.max_manifest_restarts, 1);
    }

    #[test]
    fn test_json_round_trip() {
        let config = UpdateConfig {
            max_manifest_restarts: 3,
            ..Default::default()
        };
        let parsed = UpdateConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_limits_never_zero() {
        let config = UpdateConfig {
            max_concurrent_fetches: 0,
            progress_batch: 0,
            ..Default::default()
        };
        assert_eq!(config.fetch_limit(), 1);
        assert_eq!(config.progress_interval(), 1);
    }

    #[test]
    fn test_invalid_json() {
        assert!(UpdateConfig::from_json("{not json").is_err());
    }
}
