//! Durable storage seam
//!
//! The hot cache fronts a durable store it does not own. Everything it needs
//! from that store goes through [`DurableStore`]:
//!
//! ```text
//! FlushExecutor ──batch_insert──→ DurableStore
//! HotCache::get ──fetch─────────→ DurableStore   (on cache miss)
//! HotCache::open ─next_offset───→ DurableStore   (sequence recovery)
//! ```
//!
//! Inserts must be idempotent by offset: a batch may be re-sent after a
//! failure that left part or all of it committed.

pub mod mock;

pub use mock::{FaultMode, MockStore};

use crate::ring::Entry;
use async_trait::async_trait;
use thiserror::Error;

/// Errors reported by a durable store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Storage operation timed out: {0}")]
    Timeout(String),

    #[error("Storage rejected request: {0}")]
    Rejected(String),

    #[error("Corrupt record at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },
}

impl StorageError {
    /// Whether the flush executor should retry the same batch
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Unavailable(_) | StorageError::Timeout(_))
    }
}

/// Durable backing store for the hot cache
#[async_trait]
pub trait DurableStore: Send + Sync + 'static {
    /// Persist a batch of entries; inserting an offset twice is a no-op
    async fn batch_insert(&self, entries: &[Entry]) -> Result<(), StorageError>;

    /// Fetch a single entry by offset
    async fn fetch(&self, offset: u64) -> Result<Option<Entry>, StorageError>;

    /// Fetch the entries present in `[start, start + count)`, in offset order
    async fn fetch_range(&self, start: u64, count: usize) -> Result<Vec<Entry>, StorageError>;

    /// First offset not yet used by the store, used to resume the sequence
    async fn next_offset(&self) -> Result<u64, StorageError> {
        Ok(0)
    }
}
