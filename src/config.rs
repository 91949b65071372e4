//! Limit and store configuration.
//!
//! A [`LimitTable`] maps named limit types ("requests", "votes", ...) to their
//! [`LimitConfig`]. Tables can be built in code or loaded from YAML; invalid
//! entries are rejected at load time so a bad deployment fails at startup
//! rather than per request.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{FloodgateError, Result};

/// A single named limit: maximum total cost admitted within a sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitConfig {
    /// Maximum total cost allowed in the window
    pub max: u32,
    /// Window length in seconds
    pub window_secs: u64,
}

impl LimitConfig {
    /// Create a limit, rejecting zero values.
    pub fn new(max: u32, window_secs: u64) -> Result<Self> {
        let config = Self { max, window_secs };
        config.validate("limit")?;
        Ok(config)
    }

    /// Window length in milliseconds.
    pub fn window_millis(&self) -> u64 {
        self.window_secs * 1000
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.max == 0 {
            return Err(FloodgateError::Config(format!(
                "limit '{}': max must be greater than zero",
                name
            )));
        }
        if self.window_secs == 0 {
            return Err(FloodgateError::Config(format!(
                "limit '{}': window_secs must be greater than zero",
                name
            )));
        }
        Ok(())
    }
}

/// Named limit configurations, keyed by limit type.
///
/// Each limit type is an independent counter over the same identity key:
/// consuming "posts" never touches the "votes" account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitTable {
    #[serde(default)]
    limits: HashMap<String, LimitConfig>,
}

impl Default for LimitTable {
    fn default() -> Self {
        let mut limits = HashMap::new();
        limits.insert("requests".to_string(), LimitConfig { max: 100, window_secs: 60 });
        limits.insert("posts".to_string(), LimitConfig { max: 1, window_secs: 1800 });
        limits.insert("comments".to_string(), LimitConfig { max: 50, window_secs: 3600 });
        limits.insert("votes".to_string(), LimitConfig { max: 30, window_secs: 60 });
        limits.insert("registration".to_string(), LimitConfig { max: 3, window_secs: 3600 });
        Self { limits }
    }
}

impl LimitTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            limits: HashMap::new(),
        }
    }

    /// Get the configuration for a limit type.
    pub fn get(&self, limit_type: &str) -> Option<&LimitConfig> {
        self.limits.get(limit_type)
    }

    /// Insert or replace a named limit.
    pub fn insert(&mut self, limit_type: impl Into<String>, config: LimitConfig) {
        self.limits.insert(limit_type.into(), config);
    }

    /// Number of configured limit types.
    pub fn len(&self) -> usize {
        self.limits.len()
    }

    /// Whether the table has no limits configured.
    pub fn is_empty(&self) -> bool {
        self.limits.is_empty()
    }

    /// Load a limit table from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limit table");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a limit table from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let table: LimitTable = serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(format!("failed to parse limit table: {}", e)))?;
        table.validate()?;
        Ok(table)
    }

    fn validate(&self) -> Result<()> {
        for (name, config) in &self.limits {
            config.validate(name)?;
        }
        Ok(())
    }
}

/// Configuration for the bounded in-process window store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryStoreConfig {
    /// Hard cap on distinct keys held at once
    #[serde(default = "default_max_keys")]
    pub max_keys: usize,

    /// Background sweep interval in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Retention horizon in seconds; the sweep drops entries older than this
    #[serde(default = "default_retention")]
    pub retention_secs: u64,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            max_keys: default_max_keys(),
            sweep_interval_secs: default_sweep_interval(),
            retention_secs: default_retention(),
        }
    }
}

impl MemoryStoreConfig {
    /// Sweep interval as a duration.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Retention horizon in milliseconds.
    ///
    /// Must be larger than the longest configured window, or the sweep will
    /// discard entries that still count toward a live window.
    pub fn retention_millis(&self) -> u64 {
        self.retention_secs * 1000
    }
}

fn default_max_keys() -> usize {
    100_000
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_retention() -> u64 {
    7200
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table_matches_shipped_limits() {
        let table = LimitTable::default();
        assert_eq!(table.len(), 5);
        assert_eq!(table.get("requests"), Some(&LimitConfig { max: 100, window_secs: 60 }));
        assert_eq!(table.get("posts"), Some(&LimitConfig { max: 1, window_secs: 1800 }));
        assert_eq!(table.get("comments"), Some(&LimitConfig { max: 50, window_secs: 3600 }));
        assert_eq!(table.get("votes"), Some(&LimitConfig { max: 30, window_secs: 60 }));
        assert_eq!(table.get("registration"), Some(&LimitConfig { max: 3, window_secs: 3600 }));
    }

    #[test]
    fn test_unknown_limit_type_is_absent() {
        let table = LimitTable::default();
        assert!(table.get("uploads").is_none());
    }

    #[test]
    fn test_parse_yaml_table() {
        let yaml = r#"
limits:
  api_calls:
    max: 500
    window_secs: 60
  exports:
    max: 2
    window_secs: 86400
"#;
        let table = LimitTable::from_yaml(yaml).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.get("api_calls").unwrap().max, 500);
        assert_eq!(table.get("exports").unwrap().window_secs, 86400);
    }

    #[test]
    fn test_zero_max_rejected() {
        let yaml = r#"
limits:
  broken:
    max: 0
    window_secs: 60
"#;
        let err = LimitTable::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, FloodgateError::Config(_)));
    }

    #[test]
    fn test_zero_window_rejected() {
        assert!(LimitConfig::new(10, 0).is_err());
        assert!(LimitConfig::new(0, 10).is_err());
        assert!(LimitConfig::new(10, 10).is_ok());
    }

    #[test]
    fn test_window_millis() {
        let config = LimitConfig::new(1, 1800).unwrap();
        assert_eq!(config.window_millis(), 1_800_000);
    }

    #[test]
    fn test_memory_store_defaults() {
        let config = MemoryStoreConfig::default();
        assert_eq!(config.max_keys, 100_000);
        assert_eq!(config.sweep_interval(), Duration::from_secs(300));
        assert_eq!(config.retention_millis(), 7_200_000);
    }
}
