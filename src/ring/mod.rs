//! Ring buffer hot cache
//!
//! # Architecture
//!
//! ```text
//! Producer ─→ Sequencer.allocate() ─→ offset
//!                                      │  slot = offset & mask
//!                                      ▼
//!             ┌────┬────┬────┬────┬────┬────┬────┬────┐
//! SlotArray   │ 8  │ 9  │ 10 │ 3  │ 4  │ 5  │ 6  │ 7  │   capacity = 8
//!             └────┴────┴────┴────┴────┴────┴────┴────┘
//!                                      ▲
//! Consumer ─→ lookup(offset) ──────────┘  stored offset == requested?
//! ```
//!
//! The window is `[sequence - capacity, sequence)`. Offsets below it have
//! been overwritten by wraparound, offsets at or above it do not exist yet.
//! Within the window a slot is only trusted when its stored offset equals
//! the requested one, which rejects stale occupants (the ABA hazard) without
//! any eviction bookkeeping.

pub mod drain;
pub mod entry;
pub mod sequencer;
pub mod slots;

pub use drain::{DrainBuffer, Drained, Pending};
pub use entry::{now_millis, Entry};
pub use sequencer::Sequencer;
pub use slots::{AtomicSlots, PlainSlots, Publish, SlotArray};

use crate::error::{Error, Result};
use crate::metrics;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Largest number of offsets a single range lookup may cover
pub const MAX_RANGE: usize = 1 << 16;

/// Range of potentially resident offsets, `[head, tail)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    /// Lowest offset that may still be cached
    pub head: u64,
    /// Next offset to be allocated (exclusive)
    pub tail: u64,
}

impl Window {
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.head && offset < self.tail
    }

    pub fn len(&self) -> u64 {
        self.tail - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.tail == self.head
    }
}

/// Outcome of a single-offset lookup
///
/// Every variant other than [`Lookup::Hit`] is a cache miss and sends the
/// caller to the durable store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// The slot holds exactly the requested offset
    Hit(Arc<Entry>),
    /// The offset is outside `[head, tail)`
    OutOfWindow(Window),
    /// The slot holds a different offset (overwritten, or the writer has not published yet)
    Mismatch { found: u64 },
    /// The slot has never been written since the cache was opened
    Vacant,
}

impl Lookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, Lookup::Hit(_))
    }

    pub fn into_entry(self) -> Option<Arc<Entry>> {
        match self {
            Lookup::Hit(entry) => Some(entry),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct RingCounters {
    appends: AtomicU64,
    stale_publishes: AtomicU64,
    hits: AtomicU64,
    out_of_window: AtomicU64,
    mismatches: AtomicU64,
    vacant: AtomicU64,
    backfills: AtomicU64,
}

/// Ring buffer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingStats {
    pub appends: u64,
    pub stale_publishes: u64,
    pub hits: u64,
    pub out_of_window: u64,
    pub mismatches: u64,
    pub vacant: u64,
    pub backfills: u64,
}

impl RingStats {
    pub fn misses(&self) -> u64 {
        self.out_of_window + self.mismatches + self.vacant
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses();
        if total > 0 {
            self.hits as f64 / total as f64
        } else {
            0.0
        }
    }
}

/// Fixed-capacity ring of entries addressed by `offset & mask`
pub struct RingBuffer<S: SlotArray = AtomicSlots> {
    slots: S,
    mask: u64,
    capacity: u64,
    sequencer: Sequencer,
    counters: RingCounters,
}

impl<S: SlotArray> RingBuffer<S> {
    /// Create a ring whose first offset is 0
    ///
    /// Fails unless `capacity` is a non-zero power of two.
    pub fn new(capacity: usize) -> Result<Self> {
        Self::starting_at(capacity, 0)
    }

    /// Create a ring whose first allocated offset is `start`
    pub fn starting_at(capacity: usize, start: u64) -> Result<Self> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(Error::InvalidConfig(format!(
                "ring capacity must be a non-zero power of two, got {}",
                capacity
            )));
        }

        let slots = S::with_capacity(capacity);
        debug!(capacity, start, model = slots.model(), "Allocated ring buffer");

        Ok(Self {
            slots,
            mask: capacity as u64 - 1,
            capacity: capacity as u64,
            sequencer: Sequencer::starting_at(start),
            counters: RingCounters::default(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    pub fn mask(&self) -> u64 {
        self.mask
    }

    /// Writer model of the backing slot array
    pub fn model(&self) -> &'static str {
        self.slots.model()
    }

    #[inline]
    pub fn slot_index(&self, offset: u64) -> usize {
        (offset & self.mask) as usize
    }

    /// Next offset to be allocated
    #[inline]
    pub fn sequence(&self) -> u64 {
        self.sequencer.current()
    }

    /// Current window, read from one sequencer load
    #[inline]
    pub fn window(&self) -> Window {
        let tail = self.sequencer.current();
        Window {
            head: tail.saturating_sub(self.capacity),
            tail,
        }
    }

    /// Append a new entry and return its offset
    ///
    /// Whatever previously occupied the slot becomes unreachable as soon as
    /// the write lands. This never blocks and never fails.
    pub fn append(&self, key: Bytes, payload: Bytes) -> u64 {
        let offset = self.sequencer.allocate();
        self.publish_at(offset, key, payload);
        offset
    }

    /// Write an already allocated offset into its slot
    fn publish_at(&self, offset: u64, key: Bytes, payload: Bytes) {
        let index = self.slot_index(offset);
        let entry = Arc::new(Entry::new(offset, key, payload));

        if let Publish::Stale { occupant } = self.slots.publish(index, entry) {
            // A writer holding offset + k*capacity already landed here
            self.counters.stale_publishes.fetch_add(1, Ordering::Relaxed);
            trace!(offset, occupant, "Append lost slot race to newer offset");
        }

        self.counters.appends.fetch_add(1, Ordering::Relaxed);
        metrics::APPENDS_TOTAL.inc();
    }

    /// Resolve `offset`, recording the outcome in the lookup counters
    pub fn lookup(&self, offset: u64) -> Lookup {
        let lookup = self.inspect(offset);
        let (counter, metric) = match &lookup {
            Lookup::Hit(_) => (&self.counters.hits, &*metrics::LOOKUP_HIT),
            Lookup::OutOfWindow(_) => (&self.counters.out_of_window, &*metrics::LOOKUP_OUT_OF_WINDOW),
            Lookup::Mismatch { .. } => (&self.counters.mismatches, &*metrics::LOOKUP_MISMATCH),
            Lookup::Vacant => (&self.counters.vacant, &*metrics::LOOKUP_VACANT),
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metric.inc();
        lookup
    }

    /// `lookup` reduced to hit or miss
    pub fn get(&self, offset: u64) -> Option<Arc<Entry>> {
        self.lookup(offset).into_entry()
    }

    /// Look up `count` consecutive offsets starting at `start`
    ///
    /// Each offset is validated on its own, so partial hits are normal.
    /// Fails when `count` exceeds [`MAX_RANGE`].
    pub fn get_range(&self, start: u64, count: usize) -> Result<Vec<Option<Arc<Entry>>>> {
        check_range(start, count)?;
        let end = start.saturating_add(count as u64);
        Ok((start..end).map(|offset| self.get(offset)).collect())
    }

    /// Like `get` but without touching the lookup counters
    pub fn peek(&self, offset: u64) -> Option<Arc<Entry>> {
        self.inspect(offset).into_entry()
    }

    /// Warm the cache with an entry fetched from durable storage
    ///
    /// Only lands when the offset is inside the window and its slot is
    /// empty or holds an older offset. Returns whether the entry was written.
    pub fn backfill(&self, entry: Entry) -> bool {
        if !self.window().contains(entry.offset) {
            return false;
        }

        let index = self.slot_index(entry.offset);
        let offset = entry.offset;
        let published = self.slots.backfill(index, Arc::new(entry)).is_published();
        if published {
            self.counters.backfills.fetch_add(1, Ordering::Relaxed);
            metrics::BACKFILLS_TOTAL.inc();
            trace!(offset, "Backfilled entry from durable store");
        }
        published
    }

    pub fn stats(&self) -> RingStats {
        RingStats {
            appends: self.counters.appends.load(Ordering::Relaxed),
            stale_publishes: self.counters.stale_publishes.load(Ordering::Relaxed),
            hits: self.counters.hits.load(Ordering::Relaxed),
            out_of_window: self.counters.out_of_window.load(Ordering::Relaxed),
            mismatches: self.counters.mismatches.load(Ordering::Relaxed),
            vacant: self.counters.vacant.load(Ordering::Relaxed),
            backfills: self.counters.backfills.load(Ordering::Relaxed),
        }
    }

    /// Resolve `offset` without recording the outcome
    pub fn inspect(&self, offset: u64) -> Lookup {
        let window = self.window();
        if !window.contains(offset) {
            return Lookup::OutOfWindow(window);
        }

        // The slot is loaded after the window; an overwrite in between shows
        // up as a newer stored offset, never as the requested one.
        match self.slots.load(self.slot_index(offset)) {
            Some(entry) if entry.offset == offset => Lookup::Hit(entry),
            Some(entry) => Lookup::Mismatch {
                found: entry.offset,
            },
            None => Lookup::Vacant,
        }
    }
}

/// Reject ranges too large to materialize
fn check_range(start: u64, count: usize) -> Result<()> {
    if count > MAX_RANGE {
        return Err(Error::RangeTooLarge {
            start,
            count,
            max: MAX_RANGE,
        });
    }
    Ok(())
}

impl<S: SlotArray> std::fmt::Debug for RingBuffer<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .field("model", &self.slots.model())
            .field("window", &self.window())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(offset: u64) -> Bytes {
        Bytes::from(format!("message-{}", offset))
    }

    fn fill<S: SlotArray>(ring: &RingBuffer<S>, n: u64) {
        for i in 0..n {
            assert_eq!(ring.append(Bytes::from_static(b"k"), payload(i)), i);
        }
    }

    #[test]
    fn test_rejects_bad_capacity() {
        assert!(RingBuffer::<AtomicSlots>::new(0).is_err());
        assert!(RingBuffer::<AtomicSlots>::new(6).is_err());
        assert!(RingBuffer::<PlainSlots>::new(1000).is_err());
        assert!(RingBuffer::<AtomicSlots>::new(1).is_ok());
        assert!(RingBuffer::<PlainSlots>::new(1024).is_ok());
    }

    #[test]
    fn test_round_trip() {
        let ring = RingBuffer::<AtomicSlots>::new(8).unwrap();
        fill(&ring, 5);

        for i in 0..5 {
            let entry = ring.get(i).expect("entry should be cached");
            assert_eq!(entry.offset, i);
            assert_eq!(entry.payload, payload(i));
        }
        assert_eq!(ring.window(), Window { head: 0, tail: 5 });
    }

    #[test]
    fn test_future_offset_out_of_window() {
        let ring = RingBuffer::<AtomicSlots>::new(8).unwrap();
        fill(&ring, 3);
        assert_eq!(
            ring.lookup(3),
            Lookup::OutOfWindow(Window { head: 0, tail: 3 })
        );
        assert!(ring.get(100).is_none());
    }

    #[test]
    fn test_wraparound() {
        let ring = RingBuffer::<PlainSlots>::new(8).unwrap();
        fill(&ring, 9);

        assert!(matches!(ring.lookup(0), Lookup::OutOfWindow(_)));
        for i in 1..=8 {
            assert_eq!(ring.get(i).unwrap().offset, i);
        }
    }

    #[test]
    fn test_aba_mismatch_never_returns_new_entry() {
        let ring = RingBuffer::<AtomicSlots>::new(4).unwrap();
        fill(&ring, 4);
        let original = ring.get(1).unwrap();
        assert_eq!(original.offset, 1);

        // Offset 5 shares slot 1
        fill_from(&ring, 4, 2);
        let slot = ring.slot_index(1);
        assert_eq!(slot, ring.slot_index(5));
        assert!(ring.get(1).is_none());
        assert_eq!(ring.get(5).unwrap().payload, payload(5));
    }

    fn fill_from<S: SlotArray>(ring: &RingBuffer<S>, start: u64, n: u64) {
        for i in start..start + n {
            assert_eq!(ring.append(Bytes::new(), payload(i)), i);
        }
    }

    #[test]
    fn test_mismatch_inside_window() {
        let ring = RingBuffer::<PlainSlots>::new(4).unwrap();
        fill(&ring, 6);
        assert_eq!(ring.window(), Window { head: 2, tail: 6 });

        // A slow single writer landing offset 1 late into slot 1 after offset 5
        let late = Arc::new(Entry::with_timestamp(1, 0, Bytes::new(), payload(1)));
        ring.slots.publish(ring.slot_index(5), late);

        assert_eq!(ring.lookup(5), Lookup::Mismatch { found: 1 });
        assert!(ring.get(1).is_none());
        assert_eq!(ring.stats().mismatches, 1);
    }

    #[test]
    fn test_vacant_after_recovery() {
        let ring = RingBuffer::<AtomicSlots>::starting_at(4, 10).unwrap();
        assert_eq!(ring.window(), Window { head: 6, tail: 10 });
        assert_eq!(ring.lookup(7), Lookup::Vacant);

        assert!(ring.backfill(Entry::with_timestamp(7, 0, Bytes::new(), payload(7))));
        assert_eq!(ring.get(7).unwrap().offset, 7);

        // Offset 10 takes over slot 2 from backfilled offset 6
        assert!(ring.backfill(Entry::with_timestamp(6, 0, Bytes::new(), payload(6))));
        assert_eq!(ring.append(Bytes::new(), payload(10)), 10);
        assert!(matches!(ring.lookup(6), Lookup::OutOfWindow(_)));
        assert_eq!(ring.get(10).unwrap().offset, 10);
        assert_eq!(ring.get(7).unwrap().offset, 7);
    }

    #[test]
    fn test_backfill_rules() {
        let ring = RingBuffer::<AtomicSlots>::starting_at(4, 8).unwrap();

        // Below the window
        assert!(!ring.backfill(Entry::with_timestamp(3, 0, Bytes::new(), payload(3))));
        // At or above the tail
        assert!(!ring.backfill(Entry::with_timestamp(8, 0, Bytes::new(), payload(8))));
        // Inside the window, empty slot
        assert!(ring.backfill(Entry::with_timestamp(5, 0, Bytes::new(), payload(5))));
        assert_eq!(ring.stats().backfills, 1);
    }

    #[test]
    fn test_get_range_partial_hits() {
        let ring = RingBuffer::<AtomicSlots>::new(4).unwrap();
        fill(&ring, 6);

        let range = ring.get_range(0, 8).unwrap();
        assert_eq!(range.len(), 8);
        let offsets: Vec<Option<u64>> = range.iter().map(|e| e.as_ref().map(|e| e.offset)).collect();
        assert_eq!(
            offsets,
            vec![None, None, Some(2), Some(3), Some(4), Some(5), None, None]
        );
    }

    #[test]
    fn test_get_range_rejects_oversized_count() {
        let ring = RingBuffer::<AtomicSlots>::new(4).unwrap();
        let err = ring.get_range(0, MAX_RANGE + 1).unwrap_err();
        assert!(matches!(err, Error::RangeTooLarge { count, max, .. } if count == MAX_RANGE + 1 && max == MAX_RANGE));
        assert_eq!(ring.stats().misses(), 0);
    }

    #[test]
    fn test_stats_split_by_outcome() {
        let ring = RingBuffer::<AtomicSlots>::new(2).unwrap();
        fill(&ring, 3);

        ring.get(0); // out of window
        ring.get(1); // hit
        ring.get(2); // hit
        ring.get(9); // out of window
        assert!(ring.peek(2).is_some()); // not counted

        let stats = ring.stats();
        assert_eq!(stats.appends, 3);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.out_of_window, 2);
        assert_eq!(stats.misses(), 2);
        assert_eq!(stats.hit_rate(), 0.5);
    }
}
