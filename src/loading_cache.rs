//! [`LoadingCache`] is a concurrent read-through and write-back cache backed by
//! [`LruTable`](super::LruTable).

mod dirty;
mod entry;

pub use dirty::{DirtyBatch, DirtyEntry};

use crate::clock::{Clock, MonotonicClock};
use crate::config::{CacheConfig, IdlePolicy, NullPolicy, Pressure};
use crate::error::{BoxError, Error};
use crate::lru_table::{LruTable, Opened, Recency, Sweep};
use crate::stats::{CacheStats, Counters};
use crate::sync::lock;
use dirty::DirtyChain;
use entry::{EntryCell, EntryNode, EntryState, PendingGuard, ValueState};
use equivalent::Equivalent;
use std::collections::hash_map::RandomState;
use std::fmt::{self, Debug};
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::Ordering::Relaxed;
use std::sync::atomic::{AtomicU64, AtomicUsize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Scalable concurrent loading cache.
///
/// [`LoadingCache`] loads values on demand through caller-supplied loaders, running at most one
/// loader per key at a time, tracks mutated values in a dirty chain for write-back, and sheds
/// entries from the least recently used end when it is full, idle, or under memory pressure.
///
/// Values are handed out as [`Arc<V>`]. An idle value may be detached: the cache only keeps a
/// weak handle, so the value lives exactly as long as someone else holds it, and is picked up
/// again on the next access.
///
/// ## Locking behavior
///
/// The table lock, the LRU lock, the dirty chain lock, and the entry locks are acquired in that
/// order, and loaders and updaters are invoked without holding any of them; a loader may
/// therefore access the cache, including loading other keys.
///
/// ### Unwind safety
///
/// A panicking loader or updater leaves the entry as it found it and wakes up the waiters;
/// `H::Hasher::hash`, `K::drop` and `V::drop` must not panic.
pub struct LoadingCache<K, V, H = RandomState>
where
    K: Eq + Hash,
    H: BuildHasher,
{
    table: LruTable<K, EntryCell<K, V>, H>,
    dirty: Mutex<DirtyChain<K, V>>,
    clock: Box<dyn Clock>,
    pending_timeout_secs: AtomicU64,
    max_load_concurrency: AtomicUsize,
    loading: AtomicUsize,
    null_policy: NullPolicy,
    idle_policy: IdlePolicy,
    counters: Counters,
}

/// The outcome of inspecting an entry on the read path.
enum Lookup<V> {
    /// A usable value or a usable empty result.
    Hit(Option<Arc<V>>),

    /// Another thread is loading or updating the entry.
    Pending,

    /// The entry has to be loaded.
    Load,
}

/// What an idle pass does to a single entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Idle {
    Keep,
    Detach,
    Remove,
}

impl<K, V, H> LoadingCache<K, V, H>
where
    K: Eq + Hash,
    H: BuildHasher,
{
    /// Creates an empty [`LoadingCache`] with the given [`CacheConfig`] and [`BuildHasher`].
    ///
    /// # Examples
    ///
    /// ```
    /// use loadcache::{CacheConfig, LoadingCache};
    /// use std::collections::hash_map::RandomState;
    ///
    /// let cache: LoadingCache<u64, u32, RandomState> =
    ///     LoadingCache::with_config_and_hasher(CacheConfig::default(), RandomState::new());
    /// assert_eq!(cache.max_capacity(), 256);
    /// ```
    #[inline]
    pub fn with_config_and_hasher(config: CacheConfig, build_hasher: H) -> Self {
        Self {
            table: LruTable::with_capacity_and_hasher(
                config.initial_capacity,
                config.max_capacity,
                config.load_factor,
                build_hasher,
            ),
            dirty: Mutex::new(DirtyChain::new()),
            clock: Box::new(MonotonicClock::new()),
            pending_timeout_secs: AtomicU64::new(config.pending_timeout_secs),
            max_load_concurrency: AtomicUsize::new(config.max_load_concurrency),
            loading: AtomicUsize::new(0),
            null_policy: config.null_policy,
            idle_policy: config.idle_policy,
            counters: Counters::default(),
        }
    }

    /// Replaces the tick source.
    ///
    /// # Examples
    ///
    /// ```
    /// use loadcache::{LoadingCache, ManualClock};
    /// use std::sync::Arc;
    ///
    /// let clock = Arc::new(ManualClock::new(10));
    /// let cache: LoadingCache<u64, u32> = LoadingCache::default().with_clock(clock.clone());
    /// assert_eq!(cache.now(), 10);
    /// clock.advance(5);
    /// assert_eq!(cache.now(), 15);
    /// ```
    #[inline]
    #[must_use]
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Returns the current tick in seconds.
    #[inline]
    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Returns the value associated with the key.
    ///
    /// The entry is moved to the MRU end. A detached value that is still alive is re-attached.
    ///
    /// # Examples
    ///
    /// ```
    /// use loadcache::LoadingCache;
    ///
    /// let cache: LoadingCache<u64, u32> = LoadingCache::default();
    /// assert!(cache.get(&1).is_none());
    /// assert!(cache.put_if_absent(1, 10).is_ok());
    /// assert_eq!(cache.get(&1).as_deref(), Some(&10));
    /// ```
    #[inline]
    pub fn get<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        let Some(node) = self.table.get(key) else {
            Counters::bump(&self.counters.misses);
            trace!("cache miss");
            return None;
        };
        let payload = node.payload();
        let value = payload.lock().resolve();
        if value.is_some() {
            Counters::bump(&self.counters.hits);
            payload.stamp(self.now());
            self.table.touch(&node);
        } else {
            Counters::bump(&self.counters.misses);
            trace!(hash = node.hash(), "cache miss on an unloaded entry");
        }
        value
    }

    /// Returns `true` if the key is associated with a value.
    ///
    /// Neither the LRU list nor the detached state of the entry is changed.
    #[inline]
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        self.table
            .get(key)
            .is_some_and(|node| node.payload().lock().value.peek().is_some())
    }

    /// Returns the value associated with the key, loading it with `loader` if the key has no
    /// value or the value was loaded `expire_secs` or more seconds ago.
    ///
    /// `expire_secs == 0` means the value never expires. Dirty values never expire. If another
    /// thread is loading the same key, the caller waits for that load instead of invoking
    /// `loader`; `loader` is invoked without holding any lock.
    ///
    /// # Errors
    ///
    /// * [`Error::LoadTimeout`] if another thread's load did not finish in time.
    /// * [`Error::Overload`] if the maximum number of concurrent loads is reached.
    /// * [`Error::CapacityExhausted`] if every entry is protected from eviction.
    /// * [`Error::Loader`] if `loader`, or the load this call waited for, failed.
    ///
    /// # Examples
    ///
    /// ```
    /// use loadcache::LoadingCache;
    ///
    /// let cache: LoadingCache<u64, String> = LoadingCache::default();
    /// let value = cache.get_or_load(7, |k| Ok::<_, std::io::Error>(k.to_string()), 0);
    /// assert_eq!(value.unwrap().as_str(), "7");
    ///
    /// let value = cache.get_or_load(7, |_| Err("unreachable"), 0);
    /// assert_eq!(value.unwrap().as_str(), "7");
    /// ```
    pub fn get_or_load<F, E>(&self, key: K, loader: F, expire_secs: u64) -> Result<Arc<V>, Error>
    where
        F: FnOnce(&K) -> Result<V, E>,
        E: Into<BoxError>,
    {
        let loaded = self.load(key, expire_secs, false, |k| {
            loader(k).map(Some).map_err(Into::into)
        })?;
        match loaded {
            Some(value) => Ok(value),
            None => unreachable!("a loader that always yields a value produced an empty result"),
        }
    }

    /// Same as [`LoadingCache::get_or_load`], except that the loader may succeed without a value.
    ///
    /// An empty result is cached according to the [`NullPolicy`] of the cache.
    ///
    /// # Errors
    ///
    /// See [`LoadingCache::get_or_load`].
    ///
    /// # Examples
    ///
    /// ```
    /// use loadcache::LoadingCache;
    ///
    /// let cache: LoadingCache<u64, String> = LoadingCache::default();
    /// let value = cache.get_or_load_optional(7, |_| Ok::<_, std::io::Error>(None), 0);
    /// assert!(value.unwrap().is_none());
    /// assert!(cache.get(&7).is_none());
    /// ```
    pub fn get_or_load_optional<F, E>(
        &self,
        key: K,
        loader: F,
        expire_secs: u64,
    ) -> Result<Option<Arc<V>>, Error>
    where
        F: FnOnce(&K) -> Result<Option<V>, E>,
        E: Into<BoxError>,
    {
        self.load(key, expire_secs, true, |k| loader(k).map_err(Into::into))
    }

    /// Replaces the value associated with the key with the result of `updater`, and marks the
    /// entry dirty.
    ///
    /// `updater` receives the current value, if any, and runs without holding any lock while
    /// other loads and updates of the same key wait for it.
    ///
    /// # Errors
    ///
    /// * [`Error::Updater`] if `updater` failed; the entry is left as it was.
    /// * [`Error::LoadTimeout`] if another thread's load or update did not finish in time.
    /// * [`Error::CapacityExhausted`] if every entry is protected from eviction.
    ///
    /// # Examples
    ///
    /// ```
    /// use loadcache::LoadingCache;
    ///
    /// let cache: LoadingCache<&str, u32> = LoadingCache::default();
    /// let bump = |_: &&str, v: Option<&u32>| Ok::<_, std::io::Error>(v.map_or(1, |v| v + 1));
    /// assert_eq!(*cache.update("x", bump).unwrap(), 1);
    /// assert_eq!(*cache.update("x", bump).unwrap(), 2);
    /// assert_eq!(cache.dirty_len(), 1);
    /// ```
    pub fn update<F, E>(&self, mut key: K, updater: F) -> Result<Arc<V>, Error>
    where
        F: FnOnce(&K, Option<&V>) -> Result<V, E>,
        E: Into<BoxError>,
    {
        let timeout = self.pending_timeout();
        loop {
            let now = self.now();
            let (node, epoch, prior) = match self.table.get(&key) {
                Some(node) => {
                    let payload = node.payload();
                    let mut state = payload.lock();
                    if state.removed {
                        continue;
                    }
                    if state.value.is_pending() {
                        match payload.wait_settled(state, timeout) {
                            Ok(_) | Err(Error::Loader(_)) => continue,
                            Err(error) => return Err(self.waited_out(error)),
                        }
                    }
                    state.resolve();
                    let (prior, epoch) = state.begin();
                    drop(state);
                    (node, epoch, prior)
                }
                None => {
                    let pending = || EntryCell::new(ValueState::Pending, now);
                    match self.table.open(key, pending, |n| self.try_evict(n))? {
                        Opened::Vacant(node) => (node, 1, ValueState::Unassigned),
                        Opened::Occupied(_, k) => {
                            key = k;
                            continue;
                        }
                    }
                }
            };

            let current = prior.peek();
            let guard = PendingGuard::new(&node, epoch, prior, None);
            let result = updater(node.key(), current.as_deref());
            drop(current);
            let value = match result {
                Ok(value) => Arc::new(value),
                Err(error) => {
                    drop(guard);
                    let error = Error::updater(error);
                    debug!(hash = node.hash(), %error, "update failed");
                    return Err(error);
                }
            };

            let now = self.now();
            let mut chain = lock(&self.dirty);
            let link = guard.settle(|state, _| {
                state.value = ValueState::Dirty(value.clone());
                state.last_ready = now;
                state.failure = None;
                state.enlist()
            });
            if link {
                chain.push_back(node.clone());
            }
            drop(chain);
            node.payload().stamp(now);
            self.table.touch(&node);
            return Ok(value);
        }
    }

    /// Marks the value associated with the key dirty.
    ///
    /// Returns `false` if the key has no value. Marking an entry that is already in the dirty
    /// chain does not link it twice.
    ///
    /// # Examples
    ///
    /// ```
    /// use loadcache::LoadingCache;
    ///
    /// let cache: LoadingCache<u64, u32> = LoadingCache::default();
    /// assert!(!cache.mark_updated(&1));
    /// assert!(cache.put_if_absent(1, 1).is_ok());
    /// assert!(cache.mark_updated(&1));
    /// assert!(cache.mark_updated(&1));
    /// assert_eq!(cache.dirty_len(), 1);
    /// ```
    pub fn mark_updated<Q>(&self, key: &Q) -> bool
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        let Some(node) = self.table.get(key) else {
            return false;
        };
        if !self.mark_dirty(&node) {
            return false;
        }
        node.payload().stamp(self.now());
        self.table.touch(&node);
        true
    }

    /// Associates the value with the key unless the key already has one.
    ///
    /// Returns the value associated with the key afterwards.
    ///
    /// # Errors
    ///
    /// * [`Error::LoadTimeout`] if a load of the key did not finish in time.
    /// * [`Error::CapacityExhausted`] if every entry is protected from eviction.
    ///
    /// # Examples
    ///
    /// ```
    /// use loadcache::LoadingCache;
    ///
    /// let cache: LoadingCache<u64, u32> = LoadingCache::default();
    /// assert_eq!(*cache.put_if_absent(1, 10).unwrap(), 10);
    /// assert_eq!(*cache.put_if_absent(1, 11).unwrap(), 10);
    /// ```
    pub fn put_if_absent(&self, mut key: K, value: V) -> Result<Arc<V>, Error> {
        let value = Arc::new(value);
        let timeout = self.pending_timeout();
        loop {
            let now = self.now();
            let Some(node) = self.table.get(&key) else {
                let ready = || EntryCell::new(ValueState::Ready(value.clone()), now);
                match self.table.open(key, ready, |n| self.try_evict(n))? {
                    Opened::Vacant(_) => return Ok(value),
                    Opened::Occupied(_, k) => {
                        key = k;
                        continue;
                    }
                }
            };

            let payload = node.payload();
            let mut state = payload.lock();
            if state.removed {
                continue;
            }
            if state.value.is_pending() {
                match payload.wait_settled(state, timeout) {
                    Ok(_) | Err(Error::Loader(_)) => continue,
                    Err(error) => return Err(self.waited_out(error)),
                }
            }
            let current = match state.resolve() {
                Some(existing) => existing,
                None => {
                    state.value = ValueState::Ready(value.clone());
                    state.last_ready = now;
                    state.failure = None;
                    value.clone()
                }
            };
            drop(state);
            payload.stamp(now);
            self.table.touch(&node);
            return Ok(current);
        }
    }

    /// Removes the key from the cache.
    ///
    /// Returns the value the key was associated with. A dirty value stays in the dirty chain
    /// until it is written back; an in-flight load is returned to its caller, but not cached.
    ///
    /// # Examples
    ///
    /// ```
    /// use loadcache::LoadingCache;
    ///
    /// let cache: LoadingCache<u64, u32> = LoadingCache::default();
    /// assert!(cache.put_if_absent(1, 10).is_ok());
    /// assert_eq!(cache.invalidate(&1).as_deref(), Some(&10));
    /// assert!(cache.invalidate(&1).is_none());
    /// ```
    #[inline]
    pub fn invalidate<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        let node = self.table.remove(key)?;
        let value = Self::retire(&mut node.payload().lock());
        debug!(hash = node.hash(), "entry invalidated");
        value
    }

    /// Removes every key from the cache.
    ///
    /// Dirty values stay in the dirty chain.
    #[inline]
    pub fn clear(&self) {
        let removed = self.table.clear();
        for node in &removed {
            Self::retire(&mut node.payload().lock());
        }
        debug!(removed = removed.len(), "cache cleared");
    }

    /// Calls `f` for every key that has a value.
    ///
    /// Values are inspected one at a time without holding any lock while `f` runs, so `f` may
    /// access the cache.
    ///
    /// # Examples
    ///
    /// ```
    /// use loadcache::LoadingCache;
    ///
    /// let cache: LoadingCache<u64, u32> = LoadingCache::default();
    /// assert!(cache.put_if_absent(1, 10).is_ok());
    /// assert!(cache.put_if_absent(2, 20).is_ok());
    ///
    /// let mut sum = 0;
    /// cache.scan(|k, v| sum += k * u64::from(*v));
    /// assert_eq!(sum, 50);
    /// ```
    pub fn scan<F: FnMut(&K, &V)>(&self, mut f: F) {
        for node in self.table.nodes() {
            let value = node.payload().lock().value.peek();
            if let Some(value) = value {
                f(node.key(), &value);
            }
        }
    }

    /// Returns the number of entries, including entries without a value.
    #[inline]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Returns `true` if the cache has no entries.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Returns the number of entries the bucket array holds before it grows.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.table.capacity()
    }

    /// Returns the maximum number of entries.
    #[inline]
    pub fn max_capacity(&self) -> usize {
        self.table.max_capacity()
    }

    /// Sets the maximum number of entries, evicting entries beyond it right away.
    ///
    /// # Examples
    ///
    /// ```
    /// use loadcache::LoadingCache;
    ///
    /// let cache: LoadingCache<u64, u64> = LoadingCache::default();
    /// for k in 0..8 {
    ///     assert!(cache.put_if_absent(k, k).is_ok());
    /// }
    /// cache.set_max_capacity(2);
    /// assert_eq!(cache.len(), 2);
    /// assert!(cache.contains(&7));
    /// ```
    pub fn set_max_capacity(&self, max_capacity: usize) {
        self.table.set_max_capacity(max_capacity);
        let excess = self.table.len().saturating_sub(self.table.max_capacity());
        if excess > 0 {
            let evicted = self.trim(excess);
            debug!(max_capacity, evicted, "maximum capacity lowered");
        }
    }

    /// Sets the number of seconds a caller waits for another thread's load.
    ///
    /// A timeout too large to be represented as a deadline, e.g. `u64::MAX`, waits indefinitely.
    #[inline]
    pub fn set_timeout(&self, secs: u64) {
        self.pending_timeout_secs.store(secs, Relaxed);
    }

    /// Sets the maximum number of loads in flight; `0` lifts the limit.
    #[inline]
    pub fn set_max_load_concurrency(&self, max_load_concurrency: usize) {
        self.max_load_concurrency
            .store(max_load_concurrency, Relaxed);
    }

    /// Returns a snapshot of the operation counters.
    #[inline]
    pub fn stats(&self) -> CacheStats {
        self.counters.snapshot(self.table.repairs())
    }

    /// Evicts up to `n` entries from the LRU end.
    ///
    /// Pending and dirty entries, and entries another thread is working on, are skipped.
    ///
    /// Returns the number of evicted entries.
    ///
    /// # Examples
    ///
    /// ```
    /// use loadcache::LoadingCache;
    ///
    /// let cache: LoadingCache<u64, u64> = LoadingCache::default();
    /// for k in 0..4 {
    ///     assert!(cache.put_if_absent(k, k).is_ok());
    /// }
    /// assert!(cache.mark_updated(&0));
    /// assert_eq!(cache.trim(2), 2);
    /// assert!(cache.contains(&0));
    /// assert!(!cache.contains(&1));
    /// assert!(!cache.contains(&2));
    /// ```
    #[inline]
    pub fn trim(&self, n: usize) -> usize {
        let evicted = self.table.trim(n, |node| self.try_evict(node));
        if !evicted.is_empty() {
            debug!(requested = n, evicted = evicted.len(), "entries trimmed");
        }
        evicted.len()
    }

    /// Releases entries that have not been accessed since `cutoff`.
    ///
    /// The pass walks from the LRU end and ends at the first entry accessed at or after `cutoff`.
    /// What happens to an idle entry depends on the [`IdlePolicy`] of the cache; pending and dirty
    /// entries are never released.
    ///
    /// Returns the number of removed entries.
    ///
    /// # Examples
    ///
    /// ```
    /// use loadcache::{CacheConfig, IdlePolicy, LoadingCache, ManualClock};
    /// use std::sync::Arc;
    ///
    /// let clock = Arc::new(ManualClock::new(0));
    /// let config = CacheConfig { idle_policy: IdlePolicy::ReachabilityAware, ..CacheConfig::default() };
    /// let cache: LoadingCache<u64, u64> = LoadingCache::with_config(config).with_clock(clock.clone());
    ///
    /// let held = cache.put_if_absent(1, 1).unwrap();
    /// assert!(cache.put_if_absent(2, 2).is_ok());
    /// clock.advance(10);
    ///
    /// // `2` is only held by the cache, while `1` is detached until `held` is dropped.
    /// assert_eq!(cache.idle_trim(5), 1);
    /// assert_eq!(cache.len(), 1);
    /// assert_eq!(cache.get(&1), Some(held));
    /// ```
    pub fn idle_trim(&self, cutoff: u64) -> usize {
        let policy = self.idle_policy;
        let mut detached = 0;
        let removed = self.table.sweep(|node| {
            let payload = node.payload();
            if payload.last_access() >= cutoff {
                return Sweep::Stop;
            }
            let Some(mut state) = payload.try_lock() else {
                return Sweep::Keep;
            };
            match Self::idle_verdict(&state, policy) {
                Idle::Keep => Sweep::Keep,
                Idle::Detach => {
                    if state.detach() {
                        detached += 1;
                    }
                    Sweep::Keep
                }
                Idle::Remove => {
                    state.removed = true;
                    Sweep::Evict
                }
            }
        });
        Counters::add(&self.counters.evictions, removed.len());
        Counters::add(&self.counters.detaches, detached);
        debug!(
            cutoff,
            ?policy,
            removed = removed.len(),
            detached,
            "idle entries released"
        );
        removed.len()
    }

    /// Releases entries that have been idle for `idle_secs` seconds or longer.
    ///
    /// Returns the number of removed entries.
    #[inline]
    pub fn evict_idle(&self, idle_secs: u64) -> usize {
        let now = self.now();
        if idle_secs > now {
            return 0;
        }
        self.idle_trim(now - idle_secs + 1)
    }

    /// Sheds entries in response to a memory-pressure signal.
    ///
    /// [`Pressure::Low`] evicts about a quarter of the entries; [`Pressure::Critical`] evicts
    /// every evictable entry and shrinks the table.
    ///
    /// # Examples
    ///
    /// ```
    /// use loadcache::{LoadingCache, Pressure};
    ///
    /// let cache: LoadingCache<u64, u64> = LoadingCache::default();
    /// for k in 0..8 {
    ///     assert!(cache.put_if_absent(k, k).is_ok());
    /// }
    /// cache.on_pressure(Pressure::Low);
    /// assert_eq!(cache.len(), 6);
    /// cache.on_pressure(Pressure::Critical);
    /// assert!(cache.is_empty());
    /// ```
    pub fn on_pressure(&self, level: Pressure) {
        let len = self.table.len();
        let target = match level {
            Pressure::Low => (len + 3) / 4,
            Pressure::Critical => len,
        };
        let evicted = self.trim(target);
        let pinched = level == Pressure::Critical && self.table.pinch();
        debug!(
            ?level,
            evicted,
            pinched,
            remaining = self.table.len(),
            "memory pressure handled"
        );
    }

    /// Shrinks the table if it is sparsely populated.
    ///
    /// Returns `true` if memory was released.
    #[inline]
    pub fn pinch(&self) -> bool {
        self.table.pinch()
    }

    /// The read-through path shared by [`LoadingCache::get_or_load`] and
    /// [`LoadingCache::get_or_load_optional`].
    fn load<F>(
        &self,
        mut key: K,
        expire_secs: u64,
        accept_missing: bool,
        loader: F,
    ) -> Result<Option<Arc<V>>, Error>
    where
        F: FnOnce(&K) -> Result<Option<V>, BoxError>,
    {
        let timeout = self.pending_timeout();
        loop {
            let now = self.now();
            let Some(node) = self.table.get(&key) else {
                self.reserve_load_slot()?;
                let pending = || EntryCell::new(ValueState::Pending, now);
                match self.table.open(key, pending, |n| self.try_evict(n)) {
                    Ok(Opened::Vacant(node)) => {
                        Counters::bump(&self.counters.misses);
                        return self.run_loader(&node, 1, loader);
                    }
                    Ok(Opened::Occupied(_, k)) => {
                        self.loading.fetch_sub(1, Relaxed);
                        key = k;
                        continue;
                    }
                    Err(error) => {
                        self.loading.fetch_sub(1, Relaxed);
                        return Err(error);
                    }
                }
            };

            let payload = node.payload();
            let mut state = payload.lock();
            if state.removed {
                continue;
            }
            match self.lookup(&mut state, expire_secs, accept_missing, now) {
                Lookup::Hit(value) => {
                    drop(state);
                    Counters::bump(&self.counters.hits);
                    payload.stamp(now);
                    self.table.touch(&node);
                    return Ok(value);
                }
                Lookup::Pending => match payload.wait_settled(state, timeout) {
                    Ok(_) => continue,
                    Err(error) => return Err(self.waited_out(error)),
                },
                Lookup::Load => {
                    self.reserve_load_slot()?;
                    let (stale, epoch) = state.begin();
                    drop(state);
                    drop(stale);
                    Counters::bump(&self.counters.misses);
                    return self.run_loader(&node, epoch, loader);
                }
            }
        }
    }

    /// Invokes the loader as the owner of the pending entry, and installs its result.
    fn run_loader<F>(
        &self,
        node: &Arc<EntryNode<K, V>>,
        epoch: u64,
        loader: F,
    ) -> Result<Option<Arc<V>>, Error>
    where
        F: FnOnce(&K) -> Result<Option<V>, BoxError>,
    {
        let guard = PendingGuard::new(node, epoch, ValueState::Unassigned, Some(&self.loading));
        trace!(hash = node.hash(), epoch, "loading entry");
        let result = loader(node.key());
        let now = self.now();
        match result {
            Ok(value) => {
                let value = value.map(Arc::new);
                guard.settle(|state, _| {
                    state.value = match &value {
                        Some(value) => ValueState::Ready(value.clone()),
                        None => ValueState::Missing,
                    };
                    state.last_ready = now;
                    state.failure = None;
                });
                Counters::bump(&self.counters.loads);
                debug!(hash = node.hash(), empty = value.is_none(), "entry loaded");
                node.payload().stamp(now);
                self.table.touch(node);
                Ok(value)
            }
            Err(error) => {
                let error = Error::loader(error);
                guard.settle(|state, _| {
                    state.value = ValueState::Unassigned;
                    state.failure = Some((epoch, error.clone()));
                });
                Counters::bump(&self.counters.load_failures);
                debug!(hash = node.hash(), %error, "load failed");
                Err(error)
            }
        }
    }

    /// Decides whether the entry can be served as it is.
    fn lookup(
        &self,
        state: &mut EntryState<K, V>,
        expire_secs: u64,
        accept_missing: bool,
        now: u64,
    ) -> Lookup<V> {
        let age = now.saturating_sub(state.last_ready);
        let fresh = expire_secs == 0 || age < expire_secs;
        match &state.value {
            ValueState::Pending => Lookup::Pending,
            ValueState::Dirty(value) => Lookup::Hit(Some(value.clone())),
            ValueState::Missing => {
                let retry = match self.null_policy {
                    NullPolicy::Cache => false,
                    NullPolicy::Retry { null_timeout_secs } => age >= null_timeout_secs,
                };
                if accept_missing && fresh && !retry {
                    Lookup::Hit(None)
                } else {
                    Lookup::Load
                }
            }
            ValueState::Unassigned | ValueState::Ready(_) | ValueState::Detached(_) => {
                match state.resolve() {
                    Some(value) if fresh => Lookup::Hit(Some(value)),
                    _ => Lookup::Load,
                }
            }
        }
    }

    /// Decides what an idle pass does to the entry.
    fn idle_verdict(state: &EntryState<K, V>, policy: IdlePolicy) -> Idle {
        if state.is_protected() {
            return Idle::Keep;
        }
        match (&state.value, policy) {
            (ValueState::Pending | ValueState::Dirty(_), _)
            | (
                ValueState::Unassigned | ValueState::Detached(_) | ValueState::Missing,
                IdlePolicy::Detach,
            ) => Idle::Keep,
            (ValueState::Ready(_), IdlePolicy::Detach) => Idle::Detach,
            (_, IdlePolicy::Remove)
            | (ValueState::Unassigned | ValueState::Missing, IdlePolicy::ReachabilityAware) => {
                Idle::Remove
            }
            (ValueState::Ready(value), IdlePolicy::ReachabilityAware) => {
                if Arc::strong_count(value) == 1 {
                    Idle::Remove
                } else {
                    Idle::Detach
                }
            }
            (ValueState::Detached(value), IdlePolicy::ReachabilityAware) => {
                if value.strong_count() == 0 {
                    Idle::Remove
                } else {
                    Idle::Keep
                }
            }
        }
    }

    /// Capacity eviction predicate, called with the table and LRU locks held.
    fn try_evict(&self, node: &EntryNode<K, V>) -> bool {
        // Blocking here could deadlock against a thread holding the entry lock.
        let Some(mut state) = node.payload().try_lock() else {
            return false;
        };
        if state.is_protected() {
            return false;
        }
        state.removed = true;
        drop(state);
        Counters::bump(&self.counters.evictions);
        true
    }

    /// Marks a node removed from the table, dropping its value unless it is still needed.
    fn retire(state: &mut EntryState<K, V>) -> Option<Arc<V>> {
        state.removed = true;
        let value = state.resolve();
        if !state.is_protected() {
            state.value = ValueState::Unassigned;
        }
        value
    }

    fn reserve_load_slot(&self) -> Result<(), Error> {
        let limit = self.max_load_concurrency.load(Relaxed);
        let in_flight = self.loading.fetch_add(1, Relaxed);
        if limit != 0 && in_flight >= limit {
            self.loading.fetch_sub(1, Relaxed);
            Counters::bump(&self.counters.overloads);
            debug!(limit, "load rejected");
            return Err(Error::Overload(limit));
        }
        Ok(())
    }

    fn waited_out(&self, error: Error) -> Error {
        if let Error::LoadTimeout(timeout) = &error {
            Counters::bump(&self.counters.load_timeouts);
            warn!(?timeout, "gave up waiting for an in-flight load");
        }
        error
    }

    #[inline]
    fn pending_timeout(&self) -> Duration {
        Duration::from_secs(self.pending_timeout_secs.load(Relaxed))
    }

    #[cfg(test)]
    pub(crate) fn table(&self) -> &LruTable<K, EntryCell<K, V>, H> {
        &self.table
    }
}

impl<K, V> LoadingCache<K, V, RandomState>
where
    K: Eq + Hash,
{
    /// Creates an empty default [`LoadingCache`].
    ///
    /// # Examples
    ///
    /// ```
    /// use loadcache::LoadingCache;
    ///
    /// let cache: LoadingCache<u64, u32> = LoadingCache::new();
    /// assert_eq!(cache.max_capacity(), 256);
    /// ```
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty [`LoadingCache`] holding at most `max_capacity` entries.
    ///
    /// # Examples
    ///
    /// ```
    /// use loadcache::LoadingCache;
    ///
    /// let cache: LoadingCache<u64, u32> = LoadingCache::with_capacity(1000);
    /// assert_eq!(cache.max_capacity(), 1000);
    /// ```
    #[inline]
    #[must_use]
    pub fn with_capacity(max_capacity: usize) -> Self {
        Self::with_config(CacheConfig {
            max_capacity,
            ..CacheConfig::default()
        })
    }

    /// Creates an empty [`LoadingCache`] with the given [`CacheConfig`].
    #[inline]
    #[must_use]
    pub fn with_config(config: CacheConfig) -> Self {
        Self::with_config_and_hasher(config, RandomState::new())
    }
}

impl<K, V, H> Default for LoadingCache<K, V, H>
where
    K: Eq + Hash,
    H: BuildHasher + Default,
{
    /// Creates an empty default [`LoadingCache`].
    #[inline]
    fn default() -> Self {
        Self::with_config_and_hasher(CacheConfig::default(), H::default())
    }
}

impl<K, V, H> Debug for LoadingCache<K, V, H>
where
    K: Eq + Hash,
    H: BuildHasher,
{
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dirty = self.dirty_len();
        f.debug_struct("LoadingCache")
            .field("table", &self.table)
            .field("dirty", &dirty)
            .field("loading", &self.loading.load(Relaxed))
            .field("null_policy", &self.null_policy)
            .field("idle_policy", &self.idle_policy)
            .finish_non_exhaustive()
    }
}
