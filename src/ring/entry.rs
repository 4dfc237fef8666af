//! Cached entry type

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// One stored unit in the hot cache
///
/// Identity is the `offset`. Key and payload are opaque to the cache and are
/// held as reference-counted buffers, so cloning an entry never copies bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Logical offset assigned by the sequencer
    pub offset: u64,
    /// Append time (milliseconds since epoch)
    pub timestamp: u64,
    /// Routing/partition key
    pub key: Bytes,
    /// Opaque message payload
    pub payload: Bytes,
}

impl Entry {
    /// Create an entry stamped with the current time
    pub fn new(offset: u64, key: Bytes, payload: Bytes) -> Self {
        Self::with_timestamp(offset, now_millis(), key, payload)
    }

    /// Create an entry with an explicit timestamp
    pub fn with_timestamp(offset: u64, timestamp: u64, key: Bytes, payload: Bytes) -> Self {
        Self {
            offset,
            timestamp,
            key,
            payload,
        }
    }

    /// Payload size counted against the flush size threshold
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Entry(offset={}, ts={}, key={}B, payload={}B)",
            self.offset,
            self.timestamp,
            self.key.len(),
            self.payload.len()
        )
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}
