//! Flush watermark over the dense offset sequence
//!
//! Offsets are allocated densely, so "what still needs flushing" is the
//! range `[cursor, sequence)` and needs no per-entry bookkeeping. Only the
//! flush executor moves the cursor. The append path does two atomic adds and
//! never locks or allocates.
//!
//! ```text
//!            lost            drainable                in flight
//!   ──────────┬──────────────────────────────┬──────────────┬────→ offset
//!          cursor                     sequence - capacity   sequence
//! ```
//!
//! Anything below `sequence - capacity` is gone from the ring by the time it
//! is drained and is reported as lost rather than flushed.

use super::entry::Entry;
use super::{Lookup, RingBuffer, SlotArray};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Flush cursor plus pending byte counter
#[derive(Debug)]
pub struct DrainBuffer {
    cursor: AtomicU64,
    pending_bytes: AtomicU64,
    /// Set once entries were lost; their bytes are still in `pending_bytes`
    unsettled: AtomicBool,
    capacity: u64,
}

/// Pending work as seen by the append path or the executor
///
/// `count` never exceeds the ring capacity: older offsets are already lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pending {
    pub count: u64,
    pub bytes: u64,
}

impl Pending {
    /// True when this append moved the range from empty to non-empty
    pub fn is_first(&self) -> bool {
        self.count == 1
    }
}

/// Entries extracted by one drain
#[derive(Debug, Default)]
pub struct Drained {
    /// Resident entries in offset order
    pub entries: Vec<Arc<Entry>>,
    /// Offsets overwritten before they could be drained
    pub lost: u64,
    /// Payload bytes credited to this drain
    pub bytes: u64,
    /// First offset of the drained range
    pub from: u64,
    /// Cursor after the drain (exclusive end of the range)
    pub until: u64,
}

impl Drained {
    pub fn is_empty(&self) -> bool {
        self.from == self.until
    }
}

impl DrainBuffer {
    /// Watermark for a ring of `capacity` slots whose first offset is `start`
    pub fn new(capacity: usize, start: u64) -> Self {
        Self {
            cursor: AtomicU64::new(start),
            pending_bytes: AtomicU64::new(0),
            unsettled: AtomicBool::new(false),
            capacity: capacity as u64,
        }
    }

    /// First offset not yet drained
    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::Acquire)
    }

    /// Run `append` and account for the offset it returns
    ///
    /// Bytes are counted before the entry is published, so a drain that
    /// sees the entry always finds its bytes already recorded.
    #[inline]
    pub fn track(&self, payload_len: usize, append: impl FnOnce() -> u64) -> (u64, Pending) {
        let bytes = self
            .pending_bytes
            .fetch_add(payload_len as u64, Ordering::AcqRel)
            + payload_len as u64;
        let offset = append();
        let count = (offset + 1).saturating_sub(self.cursor()).min(self.capacity);
        (offset, Pending { count, bytes })
    }

    /// Pending work given the current sequence
    pub fn pending(&self, tail: u64) -> Pending {
        Pending {
            count: tail.saturating_sub(self.cursor()).min(self.capacity),
            bytes: self.pending_bytes.load(Ordering::Acquire),
        }
    }

    pub fn is_empty(&self, tail: u64) -> bool {
        self.cursor() >= tail
    }

    /// Drain everything published below the current sequence
    ///
    /// Stops early at an offset that is allocated but not yet published by
    /// its writer; the next drain resumes there. Must only be called from
    /// one task at a time.
    pub fn take<S: SlotArray>(&self, ring: &RingBuffer<S>) -> Drained {
        let tail = ring.sequence();
        let start = self.cursor();
        if start >= tail {
            return Drained {
                from: start,
                until: start,
                ..Default::default()
            };
        }

        let first = start.max(tail.saturating_sub(self.capacity));
        let mut lost = first - start;
        let mut entries = Vec::with_capacity((tail - first) as usize);
        let mut bytes = 0u64;
        let mut next = first;

        while next < tail {
            match ring.inspect(next) {
                Lookup::Hit(entry) => {
                    bytes += entry.payload_len() as u64;
                    entries.push(entry);
                }
                // Overwritten by a newer offset, or the window moved past it
                Lookup::OutOfWindow(_) => lost += 1,
                Lookup::Mismatch { found } if found > next => lost += 1,
                // Writer has the offset but has not published it yet
                Lookup::Mismatch { .. } | Lookup::Vacant => break,
            }
            next += 1;
        }

        self.cursor.store(next, Ordering::Release);
        // Lost payloads cannot be measured once overwritten, so the first
        // drain that catches up after a loss settles the byte counter to zero
        if lost > 0 {
            self.unsettled.store(true, Ordering::Relaxed);
        }
        let settled = if next >= tail && self.unsettled.swap(false, Ordering::Relaxed) {
            u64::MAX
        } else {
            bytes
        };
        let _ = self
            .pending_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(settled))
            });

        Drained {
            entries,
            lost,
            bytes,
            from: start,
            until: next,
        }
    }
}
