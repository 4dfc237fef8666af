//! Offset sequencer

use std::sync::atomic::{AtomicU64, Ordering};

/// Allocates dense, strictly increasing offsets
///
/// A single fetch-and-add per allocation; there is no lock and no retry loop.
/// The value returned by [`allocate`](Self::allocate) is the offset assigned
/// to the caller, and [`current`](Self::current) is the next unallocated one.
#[derive(Debug, Default)]
pub struct Sequencer {
    next: AtomicU64,
}

impl Sequencer {
    /// Create a sequencer starting at offset 0
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Create a sequencer whose first allocation returns `start`
    pub fn starting_at(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }

    /// Allocate the next offset
    #[inline]
    pub fn allocate(&self) -> u64 {
        self.next.fetch_add(1, Ordering::AcqRel)
    }

    /// The next offset that will be allocated (exclusive high watermark)
    #[inline]
    pub fn current(&self) -> u64 {
        self.next.load(Ordering::Acquire)
    }
}
