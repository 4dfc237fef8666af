//! Slot arrays backing the ring buffer
//!
//! Both variants allocate every slot up front and never resize. A slot holds
//! at most one entry; publishing swaps a whole `Arc<Entry>` in one atomic
//! step, so a concurrent reader observes either the previous occupant or the
//! new one and never a partially written entry.
//!
//! ```text
//! PlainSlots   one writer, unconditional overwrite
//! AtomicSlots  many writers, compare-and-swap keeps the newest offset
//! ```

use super::entry::Entry;
use arc_swap::{ArcSwapOption, Guard};
use std::sync::Arc;

/// Result of publishing an entry into a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Publish {
    /// The entry is now the slot's occupant; `replaced` is the previous occupant's offset
    Published { replaced: Option<u64> },
    /// The slot already holds an entry at least as new; nothing was written
    Stale { occupant: u64 },
}

impl Publish {
    pub fn is_published(&self) -> bool {
        matches!(self, Publish::Published { .. })
    }
}

/// Fixed-size storage for ring entries
pub trait SlotArray: Send + Sync + 'static {
    /// Allocate `capacity` empty slots
    fn with_capacity(capacity: usize) -> Self
    where
        Self: Sized;

    /// Number of slots
    fn capacity(&self) -> usize;

    /// Current occupant of `index`
    fn load(&self, index: usize) -> Option<Arc<Entry>>;

    /// Append-path write of a freshly allocated entry
    fn publish(&self, index: usize, entry: Arc<Entry>) -> Publish;

    /// Conditional write used for cache warming; never replaces a newer occupant
    fn backfill(&self, index: usize, entry: Arc<Entry>) -> Publish;

    /// Short name for logs
    fn model(&self) -> &'static str;
}

/// One cell of a slot array
struct SlotCell(ArcSwapOption<Entry>);

impl SlotCell {
    fn empty() -> Self {
        Self(ArcSwapOption::empty())
    }

    #[inline]
    fn load(&self) -> Option<Arc<Entry>> {
        self.0.load_full()
    }

    fn swap(&self, entry: Arc<Entry>) -> Publish {
        let previous = self.0.swap(Some(entry));
        Publish::Published {
            replaced: previous.map(|e| e.offset),
        }
    }

    /// Publish only if the slot is empty or holds an older offset
    fn publish_newer(&self, entry: Arc<Entry>) -> Publish {
        let mut current = self.0.load_full();
        loop {
            if let Some(existing) = &current {
                if existing.offset >= entry.offset {
                    return Publish::Stale {
                        occupant: existing.offset,
                    };
                }
            }

            let previous = self.0.compare_and_swap(&current, Some(entry.clone()));
            if same_occupant(&previous, &current) {
                return Publish::Published {
                    replaced: current.map(|e| e.offset),
                };
            }
            current = Guard::into_inner(previous);
        }
    }
}

fn same_occupant(a: &Option<Arc<Entry>>, b: &Option<Arc<Entry>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

fn allocate_cells(capacity: usize) -> Box<[SlotCell]> {
    (0..capacity).map(|_| SlotCell::empty()).collect()
}

/// Slot array for a single writer thread
///
/// The append path overwrites unconditionally. With more than one writer an
/// older offset could land after a newer one in the same slot; the read path
/// would still reject it by offset, but the newer entry would be lost from
/// the cache. Use [`AtomicSlots`] when writers are concurrent.
pub struct PlainSlots {
    cells: Box<[SlotCell]>,
}

impl SlotArray for PlainSlots {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            cells: allocate_cells(capacity),
        }
    }

    fn capacity(&self) -> usize {
        self.cells.len()
    }

    #[inline]
    fn load(&self, index: usize) -> Option<Arc<Entry>> {
        self.cells[index].load()
    }

    #[inline]
    fn publish(&self, index: usize, entry: Arc<Entry>) -> Publish {
        self.cells[index].swap(entry)
    }

    fn backfill(&self, index: usize, entry: Arc<Entry>) -> Publish {
        self.cells[index].publish_newer(entry)
    }

    fn model(&self) -> &'static str {
        "single-writer"
    }
}

/// Slot array for concurrent writers
///
/// Writers with distinct offsets in distinct slots never contend. When two
/// offsets that differ by a multiple of the capacity race for one slot, the
/// compare-and-swap keeps the larger offset, so a slot's offset never moves
/// backwards.
pub struct AtomicSlots {
    cells: Box<[SlotCell]>,
}

impl SlotArray for AtomicSlots {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            cells: allocate_cells(capacity),
        }
    }

    fn capacity(&self) -> usize {
        self.cells.len()
    }

    #[inline]
    fn load(&self, index: usize) -> Option<Arc<Entry>> {
        self.cells[index].load()
    }

    #[inline]
    fn publish(&self, index: usize, entry: Arc<Entry>) -> Publish {
        self.cells[index].publish_newer(entry)
    }

    fn backfill(&self, index: usize, entry: Arc<Entry>) -> Publish {
        self.cells[index].publish_newer(entry)
    }

    fn model(&self) -> &'static str {
        "multi-writer"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn entry(offset: u64) -> Arc<Entry> {
        Arc::new(Entry::with_timestamp(
            offset,
            0,
            Bytes::new(),
            Bytes::from(offset.to_le_bytes().to_vec()),
        ))
    }

    #[test]
    fn test_plain_slots_overwrite() {
        let slots = PlainSlots::with_capacity(4);
        assert_eq!(slots.capacity(), 4);
        assert!(slots.load(1).is_none());

        assert_eq!(
            slots.publish(1, entry(5)),
            Publish::Published { replaced: None }
        );
        // Unconditional, even for an older offset
        assert_eq!(
            slots.publish(1, entry(1)),
            Publish::Published { replaced: Some(5) }
        );
        assert_eq!(slots.load(1).unwrap().offset, 1);
    }

    #[test]
    fn test_atomic_slots_keep_newest() {
        let slots = AtomicSlots::with_capacity(4);

        assert!(slots.publish(2, entry(6)).is_published());
        assert_eq!(slots.publish(2, entry(2)), Publish::Stale { occupant: 6 });
        assert_eq!(slots.load(2).unwrap().offset, 6);

        assert_eq!(
            slots.publish(2, entry(10)),
            Publish::Published { replaced: Some(6) }
        );
        assert_eq!(slots.load(2).unwrap().offset, 10);
    }

    #[test]
    fn test_backfill_never_replaces_newer() {
        let slots = PlainSlots::with_capacity(2);
        assert!(slots.backfill(0, entry(4)).is_published());
        assert_eq!(slots.backfill(0, entry(4)), Publish::Stale { occupant: 4 });
        assert_eq!(slots.backfill(0, entry(2)), Publish::Stale { occupant: 4 });
        assert_eq!(slots.load(0).unwrap().offset, 4);
    }

    #[test]
    fn test_atomic_slots_racing_writers() {
        let slots = Arc::new(AtomicSlots::with_capacity(1));
        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let slots = slots.clone();
                std::thread::spawn(move || {
                    for i in 0..500u64 {
                        slots.publish(0, entry(i * 4 + t));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        // The highest offset written by any thread wins
        assert_eq!(slots.load(0).unwrap().offset, 499 * 4 + 3);
    }
}
