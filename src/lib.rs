// Photon hot cache
// In-memory ring-buffer tier in front of a durable message store

#![warn(rust_2018_idioms)]

pub mod cache;
pub mod config;
pub mod flush;
pub mod metrics;
pub mod ring;
pub mod storage;

// Re-exports for convenience
pub use cache::{HotCache, ReadSource, SharedHotCache, SingleWriterHotCache};
pub use config::CacheConfig;
pub use flush::{FlushProgress, FlushState, FlushTrigger};
pub use ring::{Entry, Lookup, RingBuffer, Window};
pub use storage::{DurableStore, MockStore, StorageError};

/// Hot cache error types
pub mod error {
    use crate::storage::StorageError;
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Invalid configuration: {0}")]
        InvalidConfig(String),

        #[error("Configuration error: {0}")]
        Config(#[from] ::config::ConfigError),

        #[error("Durable store unavailable while reading offset {offset}: {source}")]
        StorageUnavailable { offset: u64, source: StorageError },

        #[error("Storage error: {0}")]
        Storage(#[from] StorageError),

        #[error("Metrics error: {0}")]
        Metrics(#[from] prometheus::Error),

        #[error("Range of {count} offsets from {start} exceeds the limit of {max}")]
        RangeTooLarge { start: u64, count: usize, max: usize },

        #[error("Cache is shut down")]
        Shutdown,

        #[error("Internal error: {0}")]
        Internal(String),
    }

    impl Error {
        /// True when the caller hit the durable store and it failed,
        /// as opposed to the entry simply not existing
        pub fn is_storage_unavailable(&self) -> bool {
            matches!(self, Error::StorageUnavailable { .. })
        }
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
