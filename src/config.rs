//! Hot cache configuration
//!
//! Loaded from an optional TOML file with `HOTCACHE_*` environment overrides:
//!
//! ```toml
//! capacity = 65536
//! flush_count_threshold = 1000
//! flush_size_threshold_bytes = 1048576
//! flush_linger_ms = 5
//! ```
//!
//! Invalid values are fatal: the cache refuses to open rather than run with
//! broken addressing or a flush policy that can never fire.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration surface of the hot cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Number of ring slots; must be a power of two
    pub capacity: usize,
    /// Flush once this many entries are pending
    pub flush_count_threshold: u64,
    /// Flush once this many payload bytes are pending
    pub flush_size_threshold_bytes: u64,
    /// Maximum time a batch accumulates before it is flushed
    #[serde(rename = "flush_linger_ms", with = "duration_ms")]
    pub flush_linger: Duration,
    /// Retries per batch after a retryable storage error
    pub flush_max_retries: u32,
    /// First retry delay; doubles on each attempt
    #[serde(rename = "flush_retry_base_ms", with = "duration_ms")]
    pub flush_retry_base: Duration,
    /// Upper bound on a single retry delay
    #[serde(rename = "flush_retry_max_ms", with = "duration_ms")]
    pub flush_retry_max: Duration,
    /// Write entries fetched from the durable store back into the ring
    pub backfill_on_miss: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1 << 16,
            flush_count_threshold: 1000,
            flush_size_threshold_bytes: 1024 * 1024, // 1MB
            flush_linger: Duration::from_millis(5),
            flush_max_retries: 5,
            flush_retry_base: Duration::from_millis(5),
            flush_retry_max: Duration::from_millis(250),
            backfill_on_miss: true,
        }
    }
}

impl CacheConfig {
    /// Create a configuration with the given capacity and default flush policy
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }

    pub fn with_flush_count_threshold(mut self, count: u64) -> Self {
        self.flush_count_threshold = count;
        self
    }

    pub fn with_flush_size_threshold(mut self, bytes: u64) -> Self {
        self.flush_size_threshold_bytes = bytes;
        self
    }

    pub fn with_flush_linger(mut self, linger: Duration) -> Self {
        self.flush_linger = linger;
        self
    }

    pub fn with_retry_policy(mut self, max_retries: u32, base: Duration, max: Duration) -> Self {
        self.flush_max_retries = max_retries;
        self.flush_retry_base = base;
        self.flush_retry_max = max;
        self
    }

    pub fn with_backfill(mut self, backfill: bool) -> Self {
        self.backfill_on_miss = backfill;
        self
    }

    /// Check every value the cache depends on
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 || !self.capacity.is_power_of_two() {
            return Err(Error::InvalidConfig(format!(
                "capacity must be a non-zero power of two, got {}",
                self.capacity
            )));
        }
        if self.flush_count_threshold == 0 {
            return Err(Error::InvalidConfig(
                "flush_count_threshold must be greater than zero".to_string(),
            ));
        }
        if self.flush_size_threshold_bytes == 0 {
            return Err(Error::InvalidConfig(
                "flush_size_threshold_bytes must be greater than zero".to_string(),
            ));
        }
        if self.flush_linger.is_zero() {
            return Err(Error::InvalidConfig(
                "flush_linger must be greater than zero".to_string(),
            ));
        }
        if self.flush_retry_base > self.flush_retry_max {
            return Err(Error::InvalidConfig(format!(
                "flush_retry_base ({:?}) exceeds flush_retry_max ({:?})",
                self.flush_retry_base, self.flush_retry_max
            )));
        }
        Ok(())
    }

    /// Load from an optional TOML file plus `HOTCACHE_*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path));
        }
        builder = builder.add_source(::config::Environment::with_prefix("HOTCACHE").try_parsing(true));

        let loaded: CacheConfig = builder.build()?.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let parsed: CacheConfig = toml::from_str(text)
            .map_err(|e| Error::InvalidConfig(format!("Failed to parse config: {}", e)))?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Internal(format!("Failed to render config: {}", e)))
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = CacheConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.flush_count_threshold, 1000);
        assert_eq!(config.flush_size_threshold_bytes, 1024 * 1024);
        assert_eq!(config.flush_linger, Duration::from_millis(5));
    }

    #[test]
    fn test_rejects_non_power_of_two() {
        let err = CacheConfig::new(1000).validate().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
        assert!(CacheConfig::new(0).validate().is_err());
        assert!(CacheConfig::new(1024).validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_thresholds() {
        assert!(CacheConfig::default()
            .with_flush_count_threshold(0)
            .validate()
            .is_err());
        assert!(CacheConfig::default()
            .with_flush_size_threshold(0)
            .validate()
            .is_err());
        assert!(CacheConfig::default()
            .with_flush_linger(Duration::ZERO)
            .validate()
            .is_err());
        assert!(CacheConfig::default()
            .with_retry_policy(3, Duration::from_secs(1), Duration::from_millis(10))
            .validate()
            .is_err());
    }

    #[test]
    fn test_toml_round_trip() -> Result<()> {
        let config = CacheConfig::new(256)
            .with_flush_count_threshold(10)
            .with_flush_linger(Duration::from_millis(20))
            .with_backfill(false);
        let text = config.to_toml_string()?;
        assert!(text.contains("flush_linger_ms = 20"));
        assert_eq!(CacheConfig::from_toml_str(&text)?, config);
        Ok(())
    }

    #[test]
    fn test_partial_toml_uses_defaults() -> Result<()> {
        let config = CacheConfig::from_toml_str("capacity = 128\nflush_linger_ms = 50\n")?;
        assert_eq!(config.capacity, 128);
        assert_eq!(config.flush_linger, Duration::from_millis(50));
        assert_eq!(config.flush_count_threshold, 1000);
        Ok(())
    }

    #[test]
    fn test_negative_threshold_is_rejected() {
        assert!(CacheConfig::from_toml_str("flush_count_threshold = -1\n").is_err());
        assert!(CacheConfig::from_toml_str("capacity = 100\n").is_err());
    }

    #[test]
    fn test_load_from_file() -> Result<()> {
        let temp_dir = std::env::temp_dir().join(format!("hotcache_config_{}", std::process::id()));
        std::fs::create_dir_all(&temp_dir)
            .map_err(|e| Error::Internal(format!("Failed to create temp dir: {}", e)))?;
        let path = temp_dir.join("hotcache.toml");
        std::fs::write(&path, "capacity = 512\nflush_size_threshold_bytes = 4096\n")
            .map_err(|e| Error::Internal(format!("Failed to write config: {}", e)))?;

        let config = CacheConfig::load(Some(&path))?;
        assert_eq!(config.capacity, 512);
        assert_eq!(config.flush_size_threshold_bytes, 4096);

        // Cleanup
        std::fs::remove_dir_all(temp_dir).ok();
        Ok(())
    }
}
