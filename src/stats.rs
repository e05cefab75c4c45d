//! Operation counters of a [`LoadingCache`](crate::LoadingCache).

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;

/// A snapshot of the counters of a [`LoadingCache`](crate::LoadingCache).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CacheStats {
    /// Lookups that returned a cached value.
    pub hits: u64,
    /// Lookups that found no usable value.
    pub misses: u64,
    /// Loader invocations that returned a result.
    pub loads: u64,
    /// Loader invocations that failed.
    pub load_failures: u64,
    /// Waits for an in-flight load that timed out.
    pub load_timeouts: u64,
    /// Loads rejected by the concurrency limit.
    pub overloads: u64,
    /// Entries removed by capacity, idle or pressure eviction.
    pub evictions: u64,
    /// Values downgraded to weak handles.
    pub detaches: u64,
    /// Times the LRU list was found inconsistent and rebuilt.
    pub lru_repairs: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) hits: AtomicU64,
    pub(crate) misses: AtomicU64,
    pub(crate) loads: AtomicU64,
    pub(crate) load_failures: AtomicU64,
    pub(crate) load_timeouts: AtomicU64,
    pub(crate) overloads: AtomicU64,
    pub(crate) evictions: AtomicU64,
    pub(crate) detaches: AtomicU64,
}

impl Counters {
    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Relaxed);
    }

    #[inline]
    pub(crate) fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Relaxed);
    }

    pub(crate) fn snapshot(&self, lru_repairs: u64) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Relaxed),
            misses: self.misses.load(Relaxed),
            loads: self.loads.load(Relaxed),
            load_failures: self.load_failures.load(Relaxed),
            load_timeouts: self.load_timeouts.load(Relaxed),
            overloads: self.overloads.load(Relaxed),
            evictions: self.evictions.load(Relaxed),
            detaches: self.detaches.load(Relaxed),
            lru_repairs,
        }
    }
}
