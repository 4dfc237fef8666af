//! Flush triggers and retry backoff

use crate::config::CacheConfig;
use crate::ring::{now_millis, Pending};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Why a batch was flushed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushTrigger {
    /// Pending entry count reached the threshold
    Count,
    /// Pending payload bytes reached the threshold
    Size,
    /// The linger timer expired
    Linger,
    /// Requested through `flush_now`
    Manual,
    /// Final drain on shutdown
    Shutdown,
}

impl FlushTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushTrigger::Count => "count",
            FlushTrigger::Size => "size",
            FlushTrigger::Linger => "linger",
            FlushTrigger::Manual => "manual",
            FlushTrigger::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for FlushTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flush thresholds and retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPolicy {
    pub count_threshold: u64,
    pub size_threshold_bytes: u64,
    pub linger: Duration,
    pub max_retries: u32,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl FlushPolicy {
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            count_threshold: config.flush_count_threshold,
            size_threshold_bytes: config.flush_size_threshold_bytes,
            linger: config.flush_linger,
            max_retries: config.flush_max_retries,
            retry_base: config.flush_retry_base,
            retry_max: config.flush_retry_max,
        }
    }

    /// Count or size trigger, whichever the pending counters satisfy
    pub fn threshold_reached(&self, pending: Pending) -> Option<FlushTrigger> {
        if pending.count == 0 {
            None
        } else if pending.count >= self.count_threshold {
            Some(FlushTrigger::Count)
        } else if pending.bytes >= self.size_threshold_bytes {
            Some(FlushTrigger::Size)
        } else {
            None
        }
    }

    /// Delay before retry number `retries` (1-based)
    ///
    /// Exponential from `retry_base`, with up to 63ms of jitter, capped at
    /// `retry_max`.
    pub fn retry_delay(&self, retries: u32) -> Duration {
        let base_ms = self.retry_base.as_millis() as u64;
        let max_ms = self.retry_max.as_millis() as u64;
        if retries == 0 {
            return Duration::from_millis(base_ms.min(max_ms));
        }

        let shift = retries.saturating_sub(1).min(6);
        let delay = base_ms.saturating_mul(1u64 << shift);
        let jitter = (now_millis() & 0x3f).min(delay.max(1));
        Duration::from_millis(delay.saturating_add(jitter).min(max_ms))
    }
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}
