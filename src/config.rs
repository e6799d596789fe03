//! Configuration for the cache and the accounting pipeline.
//!
//! Every struct has a working `Default` and builder-style setters; a full
//! [`Config`] can also be loaded from JSON:
//!
//! ```
//! use llm_cache_kit::config::Config;
//!
//! let config = Config::from_json_str(r#"{
//!     "cache": { "max_entries": 500, "ttl_secs": 3600 },
//!     "pricing": {
//!         "models": {
//!             "gpt-4o": { "unit": "per_million_tokens", "prompt": "2.50", "completion": "10.00" }
//!         }
//!     }
//! }"#).unwrap();
//!
//! assert_eq!(config.cache.max_entries, 500);
//! assert!(config.pricing.contains("gpt-4o"));
//! ```

use crate::error::{Error, Result};
use crate::pricing::PricingTable;
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default maximum number of cached responses.
pub const DEFAULT_MAX_ENTRIES: usize = 1000;

/// Response cache configuration.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries before LRU eviction.
    pub max_entries: usize,

    /// Entry lifetime. `None` keeps entries until evicted.
    #[serde(rename = "ttl_secs", deserialize_with = "deserialize_secs")]
    pub ttl: Option<Duration>,

    /// Re-compare the stored canonical request on every hit.
    pub verify_on_hit: bool,

    /// Where the cache snapshot is loaded from and saved to.
    pub snapshot_path: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_entries: DEFAULT_MAX_ENTRIES,
            ttl: None,
            verify_on_hit: true,
            snapshot_path: None,
        }
    }
}

impl CacheConfig {
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_verify_on_hit(mut self, verify: bool) -> Self {
        self.verify_on_hit = verify;
        self
    }

    pub fn with_snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }

    /// # Errors
    ///
    /// Returns `Error::ConfigError` for a zero capacity or a zero TTL.
    pub fn validate(&self) -> Result<()> {
        if self.max_entries == 0 {
            return Err(Error::ConfigError(
                "cache.max_entries must be at least 1".to_string(),
            ));
        }
        if self.ttl == Some(Duration::ZERO) {
            return Err(Error::ConfigError(
                "cache.ttl_secs must be positive when set".to_string(),
            ));
        }
        Ok(())
    }
}

fn deserialize_secs<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let secs: Option<u64> = Option::deserialize(deserializer)?;
    Ok(secs.map(Duration::from_secs))
}

/// Top-level configuration.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub pricing: PricingTable,
    /// Model used to price unknown model ids; results are marked estimated.
    pub estimate_fallback: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache: CacheConfig::default(),
            pricing: PricingTable::builtin(),
            estimate_fallback: None,
        }
    }
}

impl Config {
    /// # Errors
    ///
    /// Returns `Error::ConfigError` if the JSON is malformed or invalid.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)
            .map_err(|e| Error::ConfigError(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns `Error::ConfigError` if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("cannot read {}: {}", path.display(), e))
        })?;
        debug!("Loading configuration from {}", path.display());
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        self.cache.validate()?;
        if let Some(fallback) = &self.estimate_fallback {
            if !self.pricing.contains(fallback) {
                return Err(Error::ConfigError(format!(
                    "estimate_fallback '{}' is not in the pricing table",
                    fallback
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.cache.max_entries, DEFAULT_MAX_ENTRIES);
        assert_eq!(config.cache.ttl, None);
        assert!(config.cache.verify_on_hit);
        assert!(config.pricing.contains("chat-model-large-claude"));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = Config::from_json_str(r#"{ "cache": { "ttl_secs": 60 } }"#).unwrap();
        assert_eq!(config.cache.ttl, Some(Duration::from_secs(60)));
        assert_eq!(config.cache.max_entries, DEFAULT_MAX_ENTRIES);
        assert!(config.pricing.contains("gpt-4o"));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = Config::from_json_str(r#"{ "cache": { "max_entries": 0 } }"#).unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[test]
    fn test_unknown_fallback_rejected() {
        let err = Config::from_json_str(r#"{ "estimate_fallback": "nope" }"#).unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[test]
    fn test_builder() {
        let cache = CacheConfig::default()
            .with_max_entries(5)
            .with_ttl(Duration::from_secs(30))
            .with_verify_on_hit(false);
        assert_eq!(cache.max_entries, 5);
        assert!(!cache.verify_on_hit);
        assert!(cache.validate().is_ok());
    }
}
