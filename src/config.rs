//! [`CacheConfig`] and the policy types it selects.

/// The default maximum number of entries, matching the one of a [`LruTable`](crate::LruTable)
/// sized for a small working set.
pub const DEFAULT_MAXIMUM_CAPACITY: usize = 256;

/// The default number of seconds a caller waits for another thread's load.
pub const DEFAULT_PENDING_TIMEOUT_SECS: u64 = 5;

/// Configuration of a [`LoadingCache`](crate::LoadingCache).
///
/// Every field has a default, so a partial configuration deserializes with the `serde` feature.
///
/// # Examples
///
/// ```
/// use loadcache::{CacheConfig, IdlePolicy, LoadingCache};
///
/// let config = CacheConfig {
///     max_capacity: 1024,
///     idle_policy: IdlePolicy::Detach,
///     ..CacheConfig::default()
/// };
/// let cache: LoadingCache<u64, String> = LoadingCache::with_config(config);
/// assert_eq!(cache.max_capacity(), 1024);
/// ```
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct CacheConfig {
    /// The maximum number of entries; inserting beyond it evicts from the LRU end.
    pub max_capacity: usize,

    /// The number of entries the table is sized for up front.
    pub initial_capacity: usize,

    /// The ratio of entries to buckets above which the bucket array doubles.
    pub load_factor: f64,

    /// Seconds a caller waits for an in-flight load of the same key.
    pub pending_timeout_secs: u64,

    /// The maximum number of loads in flight; `0` means unlimited.
    pub max_load_concurrency: usize,

    /// How empty load results are treated.
    pub null_policy: NullPolicy,

    /// How idle entries are released by [`LoadingCache::idle_trim`](crate::LoadingCache::idle_trim).
    pub idle_policy: IdlePolicy,
}

impl Default for CacheConfig {
    #[inline]
    fn default() -> Self {
        Self {
            max_capacity: DEFAULT_MAXIMUM_CAPACITY,
            initial_capacity: 0,
            load_factor: crate::lru_table::DEFAULT_LOAD_FACTOR,
            pending_timeout_secs: DEFAULT_PENDING_TIMEOUT_SECS,
            max_load_concurrency: 0,
            null_policy: NullPolicy::default(),
            idle_policy: IdlePolicy::default(),
        }
    }
}

/// [`NullPolicy`] decides what happens to a load that succeeded without a value.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum NullPolicy {
    /// The empty result is cached like a value and obeys the same expiry.
    #[default]
    Cache,

    /// The empty result is reloaded once it is older than `null_timeout_secs`.
    Retry {
        /// Seconds an empty result stays valid.
        null_timeout_secs: u64,
    },
}

/// [`IdlePolicy`] decides what happens to an entry that has not been accessed for a while.
///
/// Pending and dirty entries are never released by an idle pass. Entries without a value, for
/// instance after a failed load, are removed unless the policy is [`IdlePolicy::Detach`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum IdlePolicy {
    /// Idle entries are removed.
    Remove,

    /// Idle values are downgraded to weak handles; the entry keeps its slot and LRU position, and
    /// the value stays reachable for as long as anyone else holds it.
    Detach,

    /// Idle entries without a value or whose value is held only by the cache are removed; the
    /// others are detached.
    #[default]
    ReachabilityAware,
}

/// The severity of a memory-pressure signal passed to
/// [`LoadingCache::on_pressure`](crate::LoadingCache::on_pressure).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Pressure {
    /// Evict about a quarter of the entries.
    Low,

    /// Evict every evictable entry.
    Critical,
}
