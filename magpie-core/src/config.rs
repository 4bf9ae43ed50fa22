//! Configuration for the review engine
//!
//! Configuration is loaded with the following priority (highest to lowest):
//! 1. CLI flags
//! 2. Environment variables (MAGPIE_*)
//! 3. Config file (~/.config/magpie/config.toml)
//! 4. Default values

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::breaker::BreakerConfig;
use crate::cache::CacheConfig;
use crate::dedup::DedupConfig;
use crate::dispatch::DispatchConfig;
use crate::retry::RetryPolicy;
use crate::{Error, Result};

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Size of the shared concurrency gate for fan-out calls
    pub max_concurrent_reviews: usize,

    /// Hard timeout applied to every external call
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,

    /// Local retry behavior for transient failures
    pub retry: RetryPolicy,

    /// Circuit breaker thresholds
    pub breaker: BreakerConfig,

    /// Deduplication ledger retention
    pub dedup: DedupConfig,

    /// Response cache TTL and write-rate limit
    pub cache: CacheConfig,

    /// Dispatcher strategy thresholds
    pub dispatch: DispatchConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_reviews: 4,
            call_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            breaker: BreakerConfig::default(),
            dedup: DedupConfig::default(),
            cache: CacheConfig::default(),
            dispatch: DispatchConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from the default config file location
    ///
    /// Returns default config if file doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();

        if let Some(path) = config_path {
            if path.exists() {
                return Self::load_from_file(&path);
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: &PathBuf) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;
        toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Get the default config file path
    ///
    /// Returns `~/.config/magpie/config.toml` on Unix
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("magpie").join("config.toml"))
    }

    /// Apply environment variable overrides
    ///
    /// Supported variables:
    /// - MAGPIE_MAX_CONCURRENT_REVIEWS: concurrency gate size
    /// - MAGPIE_RETENTION_DAYS: dedup retention horizon
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(value) = std::env::var("MAGPIE_MAX_CONCURRENT_REVIEWS") {
            if let Ok(parsed) = value.parse() {
                self.max_concurrent_reviews = parsed;
            }
        }

        if let Ok(value) = std::env::var("MAGPIE_RETENTION_DAYS") {
            if let Ok(parsed) = value.parse() {
                self.dedup.retention_days = parsed;
            }
        }

        self
    }

    /// Apply CLI flag overrides
    pub fn with_cli_overrides(mut self, max_concurrent: Option<usize>) -> Self {
        if let Some(value) = max_concurrent {
            self.max_concurrent_reviews = value;
        }

        self
    }

    /// Load configuration with all overrides applied
    ///
    /// Priority: CLI > env > config file > defaults
    pub fn load_with_overrides(max_concurrent: Option<usize>) -> Result<Self> {
        Ok(Self::load()?
            .with_env_overrides()
            .with_cli_overrides(max_concurrent))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent_reviews, 4);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.dedup.retention_days, 7);
        assert_eq!(config.dispatch.single_pass_max_items, 5);
    }

    #[test]
    fn test_cli_overrides() {
        let config = EngineConfig::default().with_cli_overrides(Some(16));
        assert_eq!(config.max_concurrent_reviews, 16);

        let config = EngineConfig::default().with_cli_overrides(None);
        assert_eq!(config.max_concurrent_reviews, 4);
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
max_concurrent_reviews = 8
call_timeout = "45s"

[breaker]
failure_threshold = 3
timeout = "2m"

[cache]
ttl = "1h"
max_writes_per_minute = 30
"#;
        let config: EngineConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.max_concurrent_reviews, 8);
        assert_eq!(config.call_timeout, Duration::from_secs(45));
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.breaker.timeout, Duration::from_secs(120));
        assert_eq!(config.cache.ttl, Duration::from_secs(3600));
        assert_eq!(config.cache.max_writes_per_minute, 30);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let toml = r#"
[dispatch]
chunked_max_items = 25
"#;
        let config: EngineConfig = toml::from_str(toml).unwrap();
        // Overridden value applies, siblings keep their defaults.
        assert_eq!(config.dispatch.chunked_max_items, 25);
        assert_eq!(config.dispatch.single_pass_max_items, 5);
        assert_eq!(config.max_concurrent_reviews, 4);
    }
}
