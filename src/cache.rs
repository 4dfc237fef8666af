//! Hot cache facade
//!
//! Composes the ring buffer, the flush executor and the fallback reader:
//!
//! - `store` appends to the ring and hands the offset to the executor.
//! - `get`/`read` try the ring first; any miss goes to the durable store,
//!   optionally warming the ring with what it returns.
//! - `fetch_range` validates each offset in the ring and fills the gaps with
//!   a single durable range read.

use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::flush::{AlertSink, FlushExecutor, FlushPolicy, FlushProgress, FlushState, LogAlertSink};
use crate::metrics::{self, CacheStats, FallbackStats};
use crate::ring::{self, AtomicSlots, DrainBuffer, Entry, Lookup, PlainSlots, RingBuffer, SlotArray, Window};
use crate::storage::DurableStore;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

/// Where a read was served from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadSource {
    Cache,
    Durable,
}

#[derive(Debug, Default)]
struct FallbackCounters {
    found: AtomicU64,
    not_found: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
enum Fallback {
    Found,
    NotFound,
    Failed,
}

impl Fallback {
    fn of(found: bool) -> Self {
        if found {
            Fallback::Found
        } else {
            Fallback::NotFound
        }
    }
}

impl FallbackCounters {
    fn record(&self, outcome: Fallback) {
        let (counter, metric) = match outcome {
            Fallback::Found => (&self.found, &*metrics::FALLBACK_FOUND),
            Fallback::NotFound => (&self.not_found, &*metrics::FALLBACK_NOT_FOUND),
            Fallback::Failed => (&self.errors, &*metrics::FALLBACK_ERROR),
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metric.inc();
    }
}

/// Ring-buffer cache in front of a durable store
pub struct HotCache<D: DurableStore, S: SlotArray = AtomicSlots> {
    config: CacheConfig,
    ring: Arc<RingBuffer<S>>,
    drain: Arc<DrainBuffer>,
    store: Arc<D>,
    executor: FlushExecutor<S, D>,
    fallback: FallbackCounters,
    closed: AtomicBool,
    /// Appends that passed the `closed` check and have not finished yet
    appending: AtomicU64,
}

/// Marks one append in flight until dropped
struct Appending<'a>(&'a AtomicU64);

impl Drop for Appending<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Cache for many concurrent producers
pub type SharedHotCache<D> = HotCache<D, AtomicSlots>;

/// Cache fed by exactly one producer
pub type SingleWriterHotCache<D> = HotCache<D, PlainSlots>;

impl<D: DurableStore, S: SlotArray> HotCache<D, S> {
    /// Open a cache over `store`, alerting flush failures through the log
    pub async fn open(config: CacheConfig, store: Arc<D>) -> Result<Self> {
        Self::open_with_alerts(config, store, Arc::new(LogAlertSink)).await
    }

    /// Open a cache with a custom alert sink
    ///
    /// Validates the configuration, resumes numbering after the last offset
    /// the store holds and spawns the flush executor on the current runtime.
    pub async fn open_with_alerts(
        config: CacheConfig,
        store: Arc<D>,
        alert: Arc<dyn AlertSink>,
    ) -> Result<Self> {
        config.validate()?;
        metrics::init_metrics();

        let start = store.next_offset().await?;
        let ring = Arc::new(RingBuffer::<S>::starting_at(config.capacity, start)?);
        let drain = Arc::new(DrainBuffer::new(config.capacity, start));
        let executor = FlushExecutor::spawn(
            ring.clone(),
            drain.clone(),
            store.clone(),
            FlushPolicy::from_config(&config),
            alert,
        );

        info!(
            capacity = config.capacity,
            start_offset = start,
            model = ring.model(),
            "Hot cache opened"
        );

        Ok(Self {
            config,
            ring,
            drain,
            store,
            executor,
            fallback: FallbackCounters::default(),
            closed: AtomicBool::new(false),
            appending: AtomicU64::new(0),
        })
    }

    /// Append an entry and return its offset
    ///
    /// Never blocks and never waits on the durable store. Under sustained
    /// overload older unflushed entries are overwritten; the executor counts
    /// them when it drains. Every accepted append is either flushed or
    /// counted as overwritten by the time `shutdown` returns.
    pub fn store(&self, key: impl Into<Bytes>, payload: impl Into<Bytes>) -> Result<u64> {
        // Registered before the closed check so shutdown either sees this
        // append in flight or this append sees the cache closed
        self.appending.fetch_add(1, Ordering::SeqCst);
        let _guard = Appending(&self.appending);
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }

        let payload = payload.into();
        let (offset, pending) = self
            .drain
            .track(payload.len(), || self.ring.append(key.into(), payload));
        metrics::PENDING_ENTRIES.set(pending.count as i64);
        self.executor.on_append(pending);
        Ok(offset)
    }

    /// Entry at `offset`, from the ring or the durable store
    pub async fn get(&self, offset: u64) -> Result<Option<Entry>> {
        Ok(self.read(offset).await?.map(|(entry, _)| entry))
    }

    /// Like `get`, also reporting which tier served the entry
    #[instrument(level = "trace", skip(self))]
    pub async fn read(&self, offset: u64) -> Result<Option<(Entry, ReadSource)>> {
        let window = match self.ring.lookup(offset) {
            Lookup::Hit(entry) => return Ok(Some((Entry::clone(&entry), ReadSource::Cache))),
            Lookup::OutOfWindow(window) => window,
            Lookup::Mismatch { found } => {
                debug!(offset, found, "Slot superseded, falling back");
                self.ring.window()
            }
            Lookup::Vacant => self.ring.window(),
        };

        // Offsets at or past the tail have not been allocated yet
        if offset >= window.tail {
            return Ok(None);
        }

        let fetched = self.store.fetch(offset).await.map_err(|source| {
            self.fallback.record(Fallback::Failed);
            warn!(offset, error = %source, "Durable fetch failed");
            Error::StorageUnavailable { offset, source }
        })?;
        self.fallback.record(Fallback::of(fetched.is_some()));

        Ok(fetched.map(|entry| {
            self.warm(&entry);
            (entry, ReadSource::Durable)
        }))
    }

    /// Entries for `count` consecutive offsets from `start`
    ///
    /// Each offset is validated on its own. Misses below the tail are filled
    /// by one durable `fetch_range` spanning the first to last miss; offsets
    /// neither tier holds stay `None`. `count` is limited to
    /// [`ring::MAX_RANGE`].
    #[instrument(level = "trace", skip(self))]
    pub async fn fetch_range(&self, start: u64, count: usize) -> Result<Vec<Option<Entry>>> {
        let mut results: Vec<Option<Entry>> = self
            .ring
            .get_range(start, count)?
            .into_iter()
            .map(|hit| hit.map(|entry| Entry::clone(&entry)))
            .collect();

        let tail = self.ring.sequence();
        let missing: Vec<u64> = results
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(i, _)| start + i as u64)
            .filter(|&offset| offset < tail)
            .collect();

        let (first, last) = match (missing.first(), missing.last()) {
            (Some(&first), Some(&last)) => (first, last),
            _ => return Ok(results),
        };

        let span = (last - first + 1) as usize;
        let fetched = self.store.fetch_range(first, span).await.map_err(|source| {
            self.fallback.record(Fallback::Failed);
            warn!(start = first, count = span, error = %source, "Durable range fetch failed");
            Error::StorageUnavailable {
                offset: first,
                source,
            }
        })?;

        let mut by_offset: HashMap<u64, Entry> =
            fetched.into_iter().map(|entry| (entry.offset, entry)).collect();
        for offset in missing {
            let entry = by_offset.remove(&offset);
            self.fallback.record(Fallback::of(entry.is_some()));
            if let Some(entry) = entry {
                self.warm(&entry);
                results[(offset - start) as usize] = Some(entry);
            }
        }

        Ok(results)
    }

    fn warm(&self, entry: &Entry) {
        if self.config.backfill_on_miss {
            self.ring.backfill(entry.clone());
        }
    }

    /// Flush pending entries without waiting for a trigger
    pub fn flush_now(&self) {
        self.executor.flush_now();
    }

    /// Stop accepting appends, flush everything pending and stop the executor
    pub async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Appends that got past the closed check finish publishing first, so
        // the final drain sees every accepted offset
        while self.appending.load(Ordering::SeqCst) > 0 {
            tokio::task::yield_now().await;
        }
        info!(
            pending = self.drain.pending(self.ring.sequence()).count,
            "Shutting down hot cache"
        );
        self.executor.shutdown().await?;

        let progress = self.executor.progress();
        info!(
            batches = progress.batches,
            entries_flushed = progress.entries_flushed,
            failed_batches = progress.failed_batches,
            overwritten_unflushed = progress.overwritten_unflushed,
            "Hot cache stopped"
        );
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Watch every completed flush batch
    pub fn subscribe(&self) -> watch::Receiver<FlushProgress> {
        self.executor.subscribe()
    }

    pub fn flush_state(&self) -> FlushState {
        self.executor.state()
    }

    pub fn window(&self) -> Window {
        self.ring.window()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store_handle(&self) -> &Arc<D> {
        &self.store
    }

    pub fn stats(&self) -> CacheStats {
        let pending = self.drain.pending(self.ring.sequence());
        CacheStats {
            capacity: self.ring.capacity(),
            model: self.ring.model().to_string(),
            window: self.ring.window(),
            pending_entries: pending.count,
            pending_bytes: pending.bytes,
            ring: self.ring.stats(),
            fallback: FallbackStats {
                found: self.fallback.found.load(Ordering::Relaxed),
                not_found: self.fallback.not_found.load(Ordering::Relaxed),
                errors: self.fallback.errors.load(Ordering::Relaxed),
            },
            flush: self.executor.progress(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MockStore;
    use std::time::Duration;

    fn config(capacity: usize) -> CacheConfig {
        CacheConfig::new(capacity).with_flush_linger(Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_store_and_get_from_cache() -> Result<()> {
        let store = Arc::new(MockStore::new());
        let cache: SharedHotCache<MockStore> = HotCache::open(config(16), store.clone()).await?;

        let offset = cache.store("k", "hello")?;
        assert_eq!(offset, 0);

        let (entry, source) = cache.read(0).await?.expect("entry should be cached");
        assert_eq!(source, ReadSource::Cache);
        assert_eq!(entry.payload, Bytes::from_static(b"hello"));
        assert_eq!(store.fetch_calls(), 0);

        cache.shutdown().await
    }

    #[tokio::test]
    async fn test_unallocated_offset_skips_store() -> Result<()> {
        let store = Arc::new(MockStore::new());
        let cache: SharedHotCache<MockStore> = HotCache::open(config(16), store.clone()).await?;
        cache.store("k", "v")?;

        assert!(cache.get(5).await?.is_none());
        assert_eq!(store.fetch_calls(), 0);
        cache.shutdown().await
    }

    #[tokio::test]
    async fn test_resumes_after_stored_offsets() -> Result<()> {
        let existing = (0..10).map(|i| Entry::with_timestamp(i, 1, Bytes::new(), Bytes::from_static(b"old")));
        let store = Arc::new(MockStore::with_entries(existing));
        let cache: SingleWriterHotCache<MockStore> = HotCache::open(config(8), store).await?;

        assert_eq!(cache.store("k", "new")?, 10);
        let (entry, source) = cache.read(3).await?.expect("durable entry");
        assert_eq!(source, ReadSource::Durable);
        assert_eq!(entry.payload, Bytes::from_static(b"old"));
        cache.shutdown().await
    }

    #[tokio::test]
    async fn test_store_after_shutdown_fails() -> Result<()> {
        let cache: SharedHotCache<MockStore> =
            HotCache::open(config(16), Arc::new(MockStore::new())).await?;
        cache.shutdown().await?;
        assert!(cache.is_closed());
        assert!(matches!(cache.store("k", "v"), Err(Error::Shutdown)));
        // Second shutdown is a no-op
        cache.shutdown().await
    }

    #[tokio::test]
    async fn test_fetch_range_rejects_oversized_count() -> Result<()> {
        let store = Arc::new(MockStore::new());
        let cache: SharedHotCache<MockStore> = HotCache::open(config(16), store.clone()).await?;
        cache.store("k", "v")?;

        let result = cache.fetch_range(0, usize::MAX).await;
        assert!(matches!(result, Err(Error::RangeTooLarge { count: usize::MAX, .. })));
        assert_eq!(store.fetch_calls(), 0);

        // The limit itself is accepted
        let entries = cache.fetch_range(0, ring::MAX_RANGE).await?;
        assert_eq!(entries.len(), ring::MAX_RANGE);
        assert!(entries[0].is_some());
        cache.shutdown().await
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_appends_in_flight() -> Result<()> {
        let store = Arc::new(MockStore::new());
        let cache: SharedHotCache<MockStore> = HotCache::open(config(16), store.clone()).await?;
        cache.store("k", "v")?;

        // An append that already passed the closed check
        cache.appending.fetch_add(1, Ordering::SeqCst);
        let shutdown = cache.shutdown();
        tokio::pin!(shutdown);
        assert!(tokio::time::timeout(Duration::from_millis(20), &mut shutdown)
            .await
            .is_err());
        assert!(cache.is_closed());

        cache.appending.fetch_sub(1, Ordering::SeqCst);
        shutdown.await?;
        assert_eq!(store.offsets(), vec![0]);
        Ok(())
    }

    #[tokio::test]
    async fn test_open_rejects_bad_capacity() {
        let result: Result<SharedHotCache<MockStore>> =
            HotCache::open(CacheConfig::new(100), Arc::new(MockStore::new())).await;
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }
}
