//! Mock durable store for testing
//!
//! An in-memory store keyed by offset, so inserts are naturally idempotent.
//! Faults and latency can be injected to exercise the flush retry path.

use super::{DurableStore, StorageError};
use crate::ring::Entry;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How an injected insert failure behaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultMode {
    /// Fail before anything is written
    BeforeWrite,
    /// Write the batch, then report a timeout (the caller will re-send it)
    AfterWrite,
    /// Fail with a non-retryable rejection
    Reject,
}

#[derive(Default)]
struct MockInner {
    data: Mutex<BTreeMap<u64, Entry>>,
    insert_calls: AtomicU64,
    fetch_calls: AtomicU64,
    duplicate_inserts: AtomicU64,
    failing_inserts: AtomicU32,
    fault_mode: Mutex<Option<FaultMode>>,
    failing_fetches: AtomicU32,
    insert_delay: Mutex<Option<Duration>>,
    batch_sizes: Mutex<Vec<usize>>,
}

/// In-memory durable store
#[derive(Clone, Default)]
pub struct MockStore {
    inner: Arc<MockInner>,
}

impl MockStore {
    /// Create an empty mock store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that already holds `entries`
    pub fn with_entries(entries: impl IntoIterator<Item = Entry>) -> Self {
        let store = Self::new();
        {
            let mut data = store.inner.data.lock();
            for entry in entries {
                data.insert(entry.offset, entry);
            }
        }
        store
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.inner.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.data.lock().is_empty()
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.inner.data.lock().contains_key(&offset)
    }

    /// Direct read, bypassing fault injection
    pub fn get(&self, offset: u64) -> Option<Entry> {
        self.inner.data.lock().get(&offset).cloned()
    }

    /// All stored offsets in order
    pub fn offsets(&self) -> Vec<u64> {
        self.inner.data.lock().keys().copied().collect()
    }

    /// Clear all data
    pub fn clear(&self) {
        self.inner.data.lock().clear();
    }

    /// Number of `batch_insert` calls, including failed ones
    pub fn insert_calls(&self) -> u64 {
        self.inner.insert_calls.load(Ordering::Acquire)
    }

    pub fn fetch_calls(&self) -> u64 {
        self.inner.fetch_calls.load(Ordering::Acquire)
    }

    /// Entries that arrived for an offset the store already held
    pub fn duplicate_inserts(&self) -> u64 {
        self.inner.duplicate_inserts.load(Ordering::Acquire)
    }

    /// Sizes of the batches that were accepted, in arrival order
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.inner.batch_sizes.lock().clone()
    }

    /// Make the next `n` inserts fail in the given way
    pub fn fail_next_inserts(&self, n: u32, mode: FaultMode) {
        *self.inner.fault_mode.lock() = Some(mode);
        self.inner.failing_inserts.store(n, Ordering::Release);
    }

    /// Make the next `n` fetches fail with `Unavailable`
    pub fn fail_next_fetches(&self, n: u32) {
        self.inner.failing_fetches.store(n, Ordering::Release);
    }

    /// Delay every insert by `delay`
    pub fn set_insert_delay(&self, delay: Option<Duration>) {
        *self.inner.insert_delay.lock() = delay;
    }

    fn take_fault(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    fn write(&self, entries: &[Entry]) {
        let mut data = self.inner.data.lock();
        for entry in entries {
            if data.insert(entry.offset, entry.clone()).is_some() {
                self.inner.duplicate_inserts.fetch_add(1, Ordering::AcqRel);
            }
        }
    }
}

#[async_trait]
impl DurableStore for MockStore {
    async fn batch_insert(&self, entries: &[Entry]) -> Result<(), StorageError> {
        self.inner.insert_calls.fetch_add(1, Ordering::AcqRel);

        let delay = *self.inner.insert_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if Self::take_fault(&self.inner.failing_inserts) {
            let mode = (*self.inner.fault_mode.lock()).unwrap_or(FaultMode::BeforeWrite);
            return Err(match mode {
                FaultMode::BeforeWrite => {
                    StorageError::Unavailable("injected insert failure".to_string())
                }
                FaultMode::AfterWrite => {
                    self.write(entries);
                    StorageError::Timeout("injected timeout after commit".to_string())
                }
                FaultMode::Reject => StorageError::Rejected("injected rejection".to_string()),
            });
        }

        self.write(entries);
        self.inner.batch_sizes.lock().push(entries.len());
        Ok(())
    }

    async fn fetch(&self, offset: u64) -> Result<Option<Entry>, StorageError> {
        self.inner.fetch_calls.fetch_add(1, Ordering::AcqRel);
        if Self::take_fault(&self.inner.failing_fetches) {
            return Err(StorageError::Unavailable("injected fetch failure".to_string()));
        }
        Ok(self.inner.data.lock().get(&offset).cloned())
    }

    async fn fetch_range(&self, start: u64, count: usize) -> Result<Vec<Entry>, StorageError> {
        self.inner.fetch_calls.fetch_add(1, Ordering::AcqRel);
        if Self::take_fault(&self.inner.failing_fetches) {
            return Err(StorageError::Unavailable("injected fetch failure".to_string()));
        }
        let end = start.saturating_add(count as u64);
        Ok(self
            .inner
            .data
            .lock()
            .range(start..end)
            .map(|(_, entry)| entry.clone())
            .collect())
    }

    async fn next_offset(&self) -> Result<u64, StorageError> {
        Ok(self
            .inner
            .data
            .lock()
            .keys()
            .next_back()
            .map_or(0, |last| last + 1))
    }
}
