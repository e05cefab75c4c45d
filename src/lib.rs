//! Concurrent loading LRU cache.
//!
//! # loadcache::LoadingCache
//! A read-through cache that runs at most one loader per key at a time, tracks mutated values
//! for write-back in batches, and sheds least recently used entries when it is full, idle, or
//! under memory pressure.
//!
//! # loadcache::LruTable
//! A chained hash table whose nodes are threaded through a least-recently-used list, the
//! storage layer of [`LoadingCache`].

mod clock;
mod config;
mod error;
mod loading_cache;
mod lru_table;
mod stats;
mod sync;

// loadcache::LoadingCache
pub use loading_cache::DirtyBatch;
pub use loading_cache::DirtyEntry;
pub use loading_cache::LoadingCache;

// loadcache::LruTable
pub use lru_table::Node;
pub use lru_table::Opened;
pub use lru_table::Recency;
pub use lru_table::Sweep;
pub use lru_table::{LruTable, DEFAULT_LOAD_FACTOR};

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{CacheConfig, IdlePolicy, NullPolicy, Pressure};
pub use config::{DEFAULT_MAXIMUM_CAPACITY, DEFAULT_PENDING_TIMEOUT_SECS};
pub use error::{BoxError, Error};
pub use stats::CacheStats;

pub use equivalent::Equivalent;
