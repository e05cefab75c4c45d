//! [`LruTable`] is a chained hash table whose nodes are also threaded through a
//! least-recently-used list.

mod bucket_array;
mod lru_list;

use crate::sync::lock;
use crate::Error;
use bucket_array::{BucketArray, NIL};
use equivalent::Equivalent;
use lru_list::{LruList, HEAD, TAIL};
use std::collections::hash_map::RandomState;
use std::fmt::{self, Debug};
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize};
use std::sync::atomic::Ordering::Relaxed;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// The default load factor of an [`LruTable`].
pub const DEFAULT_LOAD_FACTOR: f64 = 0.75;

/// Indexed LRU table.
///
/// [`LruTable`] stores nodes in a slab addressed by stable slot indices. The same slot index
/// identifies a node in its bucket chain and in the LRU list, so a node is never copied between
/// the two structures.
///
/// ## Locking behavior
///
/// The bucket array and the LRU list are guarded by two distinct locks that are always acquired
/// in that order. The payload of a node is never locked by the table itself; predicates passed to
/// [`LruTable::sweep`] and [`LruTable::trim`] run with both table locks held and may only acquire
/// locks that are never held while calling into the table.
pub struct LruTable<K, T, H = RandomState>
where
    H: BuildHasher,
{
    array: Mutex<BucketArray<K, T>>,
    lru: Mutex<LruList>,
    max_capacity: AtomicUsize,
    repairs: AtomicU64,
    build_hasher: H,
}

/// [`Node`] is a single key and payload pair owned by an [`LruTable`].
pub struct Node<K, T> {
    hash: u64,
    slot: u32,
    generation: u64,
    key: K,
    payload: T,
}

/// The result of [`LruTable::open`].
pub enum Opened<K, T> {
    /// The key was absent and a new node was inserted.
    Vacant(Arc<Node<K, T>>),

    /// The key was present; the supplied key is handed back unused.
    Occupied(Arc<Node<K, T>>, K),
}

/// The verdict of a [`LruTable::sweep`] predicate for a single node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Sweep {
    /// Leave the node in place and continue toward the MRU end.
    Keep,

    /// Remove the node and continue toward the MRU end.
    Evict,

    /// Leave the node in place and end the sweep.
    Stop,
}

/// Payload hook consulted when the LRU list has to be rebuilt.
pub trait Recency {
    /// Returns the tick of the most recent access.
    fn last_access(&self) -> u64;
}

impl Recency for () {
    #[inline]
    fn last_access(&self) -> u64 {
        0
    }
}

impl<K, T> Node<K, T> {
    /// Returns a reference to the key.
    #[inline]
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Returns a reference to the payload.
    #[inline]
    pub fn payload(&self) -> &T {
        &self.payload
    }

    /// Returns the precomputed hash of the key.
    #[inline]
    pub fn hash(&self) -> u64 {
        self.hash
    }
}

impl<K: Debug, T: Debug> Debug for Node<K, T> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("key", &self.key)
            .field("payload", &self.payload)
            .finish_non_exhaustive()
    }
}

impl<K, T> Opened<K, T> {
    /// Returns the node regardless of whether it was inserted.
    #[inline]
    pub fn node(&self) -> &Arc<Node<K, T>> {
        match self {
            Self::Vacant(node) | Self::Occupied(node, _) => node,
        }
    }
}

impl<K, T, H> LruTable<K, T, H>
where
    K: Eq + Hash,
    T: Recency,
    H: BuildHasher,
{
    /// Creates an empty [`LruTable`] with the given capacities, load factor and [`BuildHasher`].
    ///
    /// `max_capacity` is clamped to at least `1`.
    ///
    /// # Examples
    ///
    /// ```
    /// use loadcache::LruTable;
    /// use std::collections::hash_map::RandomState;
    ///
    /// let table: LruTable<u64, ()> =
    ///     LruTable::with_capacity_and_hasher(64, 128, 0.75, RandomState::new());
    /// assert_eq!(table.max_capacity(), 128);
    /// assert!(table.capacity() >= 64);
    /// ```
    #[inline]
    pub fn with_capacity_and_hasher(
        initial_capacity: usize,
        max_capacity: usize,
        load_factor: f64,
        build_hasher: H,
    ) -> Self {
        Self {
            array: Mutex::new(BucketArray::new(initial_capacity, load_factor)),
            lru: Mutex::new(LruList::new()),
            max_capacity: AtomicUsize::new(max_capacity.max(1)),
            repairs: AtomicU64::new(0),
            build_hasher,
        }
    }

    /// Returns the hash of the key.
    #[inline]
    pub fn hash<Q: Hash + ?Sized>(&self, key: &Q) -> u64 {
        let mut h = self.build_hasher.build_hasher();
        key.hash(&mut h);
        h.finish()
    }

    /// Returns the node associated with the key without touching the LRU list.
    ///
    /// # Examples
    ///
    /// ```
    /// use loadcache::LruTable;
    ///
    /// let table: LruTable<u64, ()> = LruTable::default();
    /// assert!(table.get(&1).is_none());
    /// assert!(table.open(1, || (), |_| false).is_ok());
    /// assert_eq!(table.get(&1).map(|n| *n.key()), Some(1));
    /// ```
    #[inline]
    pub fn get<Q>(&self, key: &Q) -> Option<Arc<Node<K, T>>>
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        let hash = self.hash(key);
        lock(&self.array).find(hash, key).cloned()
    }

    /// Gets the node associated with the key, or inserts a new node at the MRU end.
    ///
    /// If the table is full, nodes are removed from the LRU end first; `evict` decides whether a
    /// node may go.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CapacityExhausted`] if no node could be evicted to make room.
    ///
    /// # Examples
    ///
    /// ```
    /// use loadcache::{LruTable, Opened};
    ///
    /// let table: LruTable<u64, ()> = LruTable::default();
    /// assert!(matches!(table.open(1, || (), |_| true), Ok(Opened::Vacant(_))));
    /// assert!(matches!(table.open(1, || (), |_| true), Ok(Opened::Occupied(_, 1))));
    /// ```
    pub fn open<F, E>(&self, key: K, payload: F, evict: E) -> Result<Opened<K, T>, Error>
    where
        F: FnOnce() -> T,
        E: FnMut(&Node<K, T>) -> bool,
    {
        let hash = self.hash(&key);
        let mut array = lock(&self.array);
        if let Some(node) = array.find(hash, &key) {
            return Ok(Opened::Occupied(node.clone(), key));
        }

        let max_capacity = self.max_capacity.load(Relaxed);
        let mut lru = lock(&self.lru);
        let mut evicted = Vec::new();
        if array.len() >= max_capacity {
            let excess = array.len() + 1 - max_capacity;
            evicted = self.trim_locked(&mut array, &mut lru, excess, evict);
            if array.len() >= max_capacity {
                drop(lru);
                drop(array);
                drop(evicted);
                warn!(max_capacity, "no evictable entry left for a new key");
                return Err(Error::CapacityExhausted(max_capacity));
            }
        }

        let node = array.insert(hash, key, payload());
        lru.push_front(node.slot, node.generation);
        drop(lru);
        if array.grow() {
            debug!(
                buckets = array.num_buckets(),
                len = array.len(),
                "bucket array grown"
            );
        }
        drop(array);
        drop(evicted);
        Ok(Opened::Vacant(node))
    }

    /// Removes the node associated with the key from the table and the LRU list.
    #[inline]
    pub fn remove<Q>(&self, key: &Q) -> Option<Arc<Node<K, T>>>
    where
        Q: Equivalent<K> + Hash + ?Sized,
    {
        let hash = self.hash(key);
        let mut array = lock(&self.array);
        let node = array.remove(hash, key)?;
        lock(&self.lru).unlink(node.slot, node.generation);
        Some(node)
    }

    /// Removes the given node if it is still in the table.
    #[inline]
    pub fn remove_node(&self, node: &Node<K, T>) -> bool {
        let mut array = lock(&self.array);
        if array.remove_node(node).is_some() {
            lock(&self.lru).unlink(node.slot, node.generation);
            true
        } else {
            false
        }
    }

    /// Moves the node to the MRU end.
    ///
    /// Returns `false` if the node has been removed.
    #[inline]
    pub fn touch(&self, node: &Node<K, T>) -> bool {
        lock(&self.lru).touch(node.slot, node.generation)
    }

    /// Unlinks the node from the LRU list while leaving it in the table.
    ///
    /// An unlinked node is invisible to [`LruTable::trim`] until [`LruTable::fix_lru`] relinks it.
    #[inline]
    pub fn unlink(&self, node: &Node<K, T>) -> bool {
        lock(&self.lru).unlink(node.slot, node.generation)
    }

    /// Removes up to `n` nodes starting from the LRU end, skipping nodes for which `evict`
    /// returns `false`.
    ///
    /// If fewer than `n` nodes could be removed and the walk revealed that the LRU list does not
    /// match the table, the list is rebuilt from the table and the walk is resumed once.
    ///
    /// Returns the removed nodes.
    ///
    /// # Examples
    ///
    /// ```
    /// use loadcache::LruTable;
    ///
    /// let table: LruTable<u64, ()> = LruTable::default();
    /// for k in 0..4 {
    ///     assert!(table.open(k, || (), |_| false).is_ok());
    /// }
    /// let removed = table.trim(2, |n| *n.key() != 0);
    /// assert_eq!(removed.iter().map(|n| *n.key()).collect::<Vec<_>>(), vec![1, 2]);
    /// ```
    pub fn trim<E>(&self, n: usize, evict: E) -> Vec<Arc<Node<K, T>>>
    where
        E: FnMut(&Node<K, T>) -> bool,
    {
        if n == 0 {
            return Vec::new();
        }
        let mut array = lock(&self.array);
        let mut lru = lock(&self.lru);
        self.trim_locked(&mut array, &mut lru, n, evict)
    }

    /// Walks the LRU list from the LRU end, applying `f` to every node until it returns
    /// [`Sweep::Stop`].
    ///
    /// Returns the removed nodes.
    pub fn sweep<F>(&self, mut f: F) -> Vec<Arc<Node<K, T>>>
    where
        F: FnMut(&Node<K, T>) -> Sweep,
    {
        let mut array = lock(&self.array);
        let mut lru = lock(&self.lru);
        let (removed, consistent) = Self::sweep_locked(&mut array, &mut lru, usize::MAX, &mut f);
        if !consistent {
            self.fix_lru_locked(&array, &mut lru);
        }
        removed
    }

    /// Rebuilds the LRU list from the table, ordering nodes by [`Recency::last_access`].
    ///
    /// Returns the number of relinked nodes.
    pub fn fix_lru(&self) -> usize {
        let array = lock(&self.array);
        let mut lru = lock(&self.lru);
        self.fix_lru_locked(&array, &mut lru)
    }

    /// Grows the bucket array if the number of nodes exceeds the load factor threshold.
    ///
    /// Returns `true` if the bucket array grew.
    #[inline]
    pub fn resize(&self) -> bool {
        let mut array = lock(&self.array);
        let grown = array.grow();
        if grown {
            debug!(buckets = array.num_buckets(), "bucket array grown");
        }
        grown
    }

    /// Shrinks the bucket array and the slab when the table is sparsely populated.
    ///
    /// Returns `true` if any memory was released.
    ///
    /// # Examples
    ///
    /// ```
    /// use loadcache::LruTable;
    ///
    /// let table: LruTable<u64, ()> = LruTable::default();
    /// for k in 0..1024 {
    ///     assert!(table.open(k, || (), |_| true).is_ok());
    /// }
    /// let grown = table.capacity();
    /// table.clear();
    /// assert!(table.pinch());
    /// assert!(table.capacity() < grown);
    /// ```
    pub fn pinch(&self) -> bool {
        let mut array = lock(&self.array);
        let Some(num_slots) = array.pinch() else {
            return false;
        };
        lock(&self.lru).truncate(num_slots);
        debug!(
            buckets = array.num_buckets(),
            slots = num_slots,
            len = array.len(),
            "table pinched"
        );
        true
    }

    /// Removes every node.
    pub fn clear(&self) -> Vec<Arc<Node<K, T>>> {
        let mut array = lock(&self.array);
        let removed = array.clear();
        lock(&self.lru).reset();
        removed
    }

    /// Returns a snapshot of the nodes from the MRU end to the LRU end.
    pub fn iter_lru(&self) -> Vec<Arc<Node<K, T>>> {
        let array = lock(&self.array);
        let lru = lock(&self.lru);
        lru.iter_from_head()
            .filter_map(|slot| array.node(slot).cloned())
            .collect()
    }

    /// Returns a snapshot of every node in the table.
    pub fn nodes(&self) -> Vec<Arc<Node<K, T>>> {
        lock(&self.array).nodes().cloned().collect()
    }

    /// Returns the number of nodes.
    #[inline]
    pub fn len(&self) -> usize {
        lock(&self.array).len()
    }

    /// Returns `true` if the table holds no nodes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of nodes the table holds before its bucket array grows.
    #[inline]
    pub fn capacity(&self) -> usize {
        lock(&self.array).threshold()
    }

    /// Returns the number of times the LRU list was rebuilt.
    #[inline]
    pub fn repairs(&self) -> u64 {
        self.repairs.load(Relaxed)
    }

    /// Returns the maximum number of nodes.
    #[inline]
    pub fn max_capacity(&self) -> usize {
        self.max_capacity.load(Relaxed)
    }

    /// Sets the maximum number of nodes; nodes are not removed until the next insertion or
    /// [`LruTable::trim`].
    #[inline]
    pub fn set_max_capacity(&self, max_capacity: usize) {
        self.max_capacity.store(max_capacity.max(1), Relaxed);
    }

    /// Removes up to `n` nodes with both locks held, repairing the list once if needed.
    fn trim_locked<E>(
        &self,
        array: &mut BucketArray<K, T>,
        lru: &mut LruList,
        n: usize,
        mut evict: E,
    ) -> Vec<Arc<Node<K, T>>>
    where
        E: FnMut(&Node<K, T>) -> bool,
    {
        let mut predicate = |node: &Node<K, T>| {
            if evict(node) {
                Sweep::Evict
            } else {
                Sweep::Keep
            }
        };
        let (mut removed, consistent) = Self::sweep_locked(array, lru, n, &mut predicate);
        if removed.len() < n && !consistent {
            self.fix_lru_locked(array, lru);
            let (more, _) = Self::sweep_locked(array, lru, n - removed.len(), &mut predicate);
            removed.extend(more);
        }
        removed
    }

    /// Sweeps from the LRU end until `limit` nodes are removed or `f` stops the walk.
    ///
    /// The walk follows the links from the LRU end, reading the neighbor of a node before the node
    /// is removed, so it stops after `limit` evictions without looking at the rest of the list.
    ///
    /// Returns the removed nodes and whether the walk found the list consistent with the table.
    /// Consistency can only be confirmed by a walk reaching the MRU sentinel.
    fn sweep_locked<F>(
        array: &mut BucketArray<K, T>,
        lru: &mut LruList,
        limit: usize,
        f: &mut F,
    ) -> (Vec<Arc<Node<K, T>>>, bool)
    where
        F: FnMut(&Node<K, T>) -> Sweep,
    {
        let mut removed = Vec::new();
        let mut visited = 0;
        let mut dangling = false;
        let mut reached_head = true;
        let mut current = lru.prev(TAIL);
        let mut remaining = lru.num_links();
        while current != HEAD {
            if removed.len() >= limit {
                reached_head = false;
                break;
            }
            if current == NIL || remaining == 0 {
                // A broken or cyclic list.
                dangling = true;
                break;
            }
            remaining -= 1;
            let slot = current;
            current = lru.prev(slot);
            let Some(node) = array.node(slot).cloned() else {
                dangling = true;
                continue;
            };
            if lru.generation(slot) != Some(node.generation) {
                dangling = true;
                continue;
            }
            visited += 1;
            match f(&node) {
                Sweep::Keep => (),
                Sweep::Evict => {
                    array.remove_node(&node);
                    lru.unlink(node.slot, node.generation);
                    visited -= 1;
                    removed.push(node);
                }
                Sweep::Stop => {
                    reached_head = false;
                    break;
                }
            }
        }
        let consistent = !dangling && (!reached_head || visited == array.len());
        if !consistent {
            warn!(
                table_len = array.len(),
                lru_len = lru.len(),
                visited,
                "LRU list does not match the table"
            );
        }
        (removed, consistent)
    }

    /// Relinks every node of the table into a fresh list ordered by recency.
    fn fix_lru_locked(&self, array: &BucketArray<K, T>, lru: &mut LruList) -> usize {
        let mut nodes = array
            .nodes()
            .map(|node| (node.payload.last_access(), node.slot, node.generation))
            .collect::<Vec<_>>();
        nodes.sort_unstable();
        lru.reset();
        for (_, slot, generation) in &nodes {
            lru.push_front(*slot, *generation);
        }
        self.repairs.fetch_add(1, Relaxed);
        warn!(relinked = nodes.len(), "LRU list rebuilt from the table");
        nodes.len()
    }

    #[cfg(test)]
    pub(crate) fn corrupt_lru(&self, node: &Node<K, T>) {
        lock(&self.lru).corrupt(node.slot);
    }
}

impl<K, T> LruTable<K, T, RandomState>
where
    K: Eq + Hash,
    T: Recency,
{
    /// Creates an empty [`LruTable`] with the specified maximum capacity.
    #[inline]
    #[must_use]
    pub fn with_max_capacity(max_capacity: usize) -> Self {
        Self::with_capacity_and_hasher(0, max_capacity, DEFAULT_LOAD_FACTOR, RandomState::new())
    }
}

impl<K, T, H> Default for LruTable<K, T, H>
where
    K: Eq + Hash,
    T: Recency,
    H: BuildHasher + Default,
{
    /// Creates an empty [`LruTable`] without a practical capacity limit.
    #[inline]
    fn default() -> Self {
        Self::with_capacity_and_hasher(0, usize::MAX, DEFAULT_LOAD_FACTOR, H::default())
    }
}

impl<K, T, H> Debug for LruTable<K, T, H>
where
    H: BuildHasher,
{
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let array = lock(&self.array);
        f.debug_struct("LruTable")
            .field("len", &array.len())
            .field("buckets", &array.num_buckets())
            .field("max_capacity", &self.max_capacity.load(Relaxed))
            .finish_non_exhaustive()
    }
}
