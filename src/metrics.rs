//! Prometheus metrics for the hot cache
//!
//! Counters are process-wide and cheap to bump from the hot path. Exact
//! per-instance numbers live in [`CacheStats`], which `HotCache::stats`
//! assembles from the ring, fallback and flush counters.

use crate::error::Result;
use crate::flush::FlushProgress;
use crate::ring::{RingStats, Window};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use serde::{Deserialize, Serialize};
use std::sync::Once;
use tracing::info;

lazy_static::lazy_static! {
    /// Registry holding every hot-cache metric
    pub static ref METRICS_REGISTRY: Registry = Registry::new();

    pub static ref APPENDS_TOTAL: IntCounter = IntCounter::new(
        "hotcache_appends_total",
        "Entries appended to the ring buffer"
    ).unwrap();

    pub static ref LOOKUPS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("hotcache_lookups_total", "Ring lookups by outcome"),
        &["result"]
    ).unwrap();

    pub static ref FALLBACK_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("hotcache_fallback_reads_total", "Durable store reads after a cache miss"),
        &["result"]
    ).unwrap();

    pub static ref BACKFILLS_TOTAL: IntCounter = IntCounter::new(
        "hotcache_backfills_total",
        "Entries written back into the ring after a fallback read"
    ).unwrap();

    pub static ref OVERWRITTEN_UNFLUSHED_TOTAL: IntCounter = IntCounter::new(
        "hotcache_overwritten_unflushed_total",
        "Entries overwritten by wraparound before they were flushed"
    ).unwrap();

    pub static ref FLUSH_BATCHES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("hotcache_flush_batches_total", "Flush batches by trigger and status"),
        &["trigger", "status"]
    ).unwrap();

    pub static ref FLUSH_ENTRIES_TOTAL: IntCounter = IntCounter::new(
        "hotcache_flush_entries_total",
        "Entries persisted to the durable store"
    ).unwrap();

    pub static ref FLUSH_RETRIES_TOTAL: IntCounter = IntCounter::new(
        "hotcache_flush_retries_total",
        "Batch insert retries after a retryable storage error"
    ).unwrap();

    pub static ref FLUSH_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "hotcache_flush_duration_seconds",
            "Batch insert duration including retries"
        ).buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0])
    ).unwrap();

    pub static ref PENDING_ENTRIES: IntGauge = IntGauge::new(
        "hotcache_pending_entries",
        "Entries appended but not yet drained by the flush executor"
    ).unwrap();

    // Label lookups resolved once, off the read path
    pub static ref LOOKUP_HIT: IntCounter = LOOKUPS_TOTAL.with_label_values(&["hit"]);
    pub static ref LOOKUP_OUT_OF_WINDOW: IntCounter =
        LOOKUPS_TOTAL.with_label_values(&["out_of_window"]);
    pub static ref LOOKUP_MISMATCH: IntCounter = LOOKUPS_TOTAL.with_label_values(&["mismatch"]);
    pub static ref LOOKUP_VACANT: IntCounter = LOOKUPS_TOTAL.with_label_values(&["vacant"]);

    pub static ref FALLBACK_FOUND: IntCounter = FALLBACK_TOTAL.with_label_values(&["found"]);
    pub static ref FALLBACK_NOT_FOUND: IntCounter =
        FALLBACK_TOTAL.with_label_values(&["not_found"]);
    pub static ref FALLBACK_ERROR: IntCounter = FALLBACK_TOTAL.with_label_values(&["error"]);
}

static INIT: Once = Once::new();

/// Register all metrics with [`METRICS_REGISTRY`]
///
/// Safe to call more than once.
pub fn init_metrics() {
    INIT.call_once(|| {
        METRICS_REGISTRY.register(Box::new(APPENDS_TOTAL.clone())).ok();
        METRICS_REGISTRY.register(Box::new(LOOKUPS_TOTAL.clone())).ok();
        METRICS_REGISTRY.register(Box::new(FALLBACK_TOTAL.clone())).ok();
        METRICS_REGISTRY.register(Box::new(BACKFILLS_TOTAL.clone())).ok();
        METRICS_REGISTRY
            .register(Box::new(OVERWRITTEN_UNFLUSHED_TOTAL.clone()))
            .ok();
        METRICS_REGISTRY.register(Box::new(FLUSH_BATCHES_TOTAL.clone())).ok();
        METRICS_REGISTRY.register(Box::new(FLUSH_ENTRIES_TOTAL.clone())).ok();
        METRICS_REGISTRY.register(Box::new(FLUSH_RETRIES_TOTAL.clone())).ok();
        METRICS_REGISTRY.register(Box::new(FLUSH_DURATION.clone())).ok();
        METRICS_REGISTRY.register(Box::new(PENDING_ENTRIES.clone())).ok();

        info!("Hot cache metrics registered");
    });
}

/// Render the registry in the Prometheus text exposition format
pub fn gather_text() -> Result<String> {
    init_metrics();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&METRICS_REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

/// Fallback reader counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackStats {
    pub found: u64,
    pub not_found: u64,
    pub errors: u64,
}

/// Point-in-time statistics for one cache instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub capacity: usize,
    pub model: String,
    pub window: Window,
    pub pending_entries: u64,
    pub pending_bytes: u64,
    pub ring: RingStats,
    pub fallback: FallbackStats,
    pub flush: FlushProgress,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        self.ring.hit_rate()
    }
}
