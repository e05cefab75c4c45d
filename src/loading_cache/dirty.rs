use super::entry::{EntryNode, EntryState, ValueState};
use super::LoadingCache;
use crate::sync::lock;
use std::fmt::{self, Debug};
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;
use tracing::{debug, warn};

/// [`DirtyChain`] is a singly linked list of entries awaiting write-back.
///
/// The links live in [`EntryState::dirty_next`], thus modifying the chain requires the chain lock
/// followed by the entry locks, one at a time.
pub(crate) struct DirtyChain<K, V> {
    head: Option<Arc<EntryNode<K, V>>>,
    tail: Option<Arc<EntryNode<K, V>>>,
    len: usize,
}

impl<K, V> DirtyChain<K, V> {
    pub(crate) const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    #[inline]
    pub(crate) const fn len(&self) -> usize {
        self.len
    }

    /// Appends a node that is not in the chain.
    pub(crate) fn push_back(&mut self, node: Arc<EntryNode<K, V>>) {
        match self.tail.replace(node.clone()) {
            Some(tail) => tail.payload().lock().dirty_next = Some(node),
            None => self.head = Some(node),
        }
        self.len += 1;
    }

    /// Detaches the first node.
    pub(crate) fn pop_front(&mut self) -> Option<Arc<EntryNode<K, V>>> {
        let head = self.head.take()?;
        self.head = head.payload().lock().dirty_next.take();
        if self.head.is_none() {
            self.tail = None;
        }
        self.len -= 1;
        Some(head)
    }

    /// Links the nodes in front of the chain in their given order.
    pub(crate) fn push_front_all(&mut self, nodes: Vec<Arc<EntryNode<K, V>>>) {
        for node in nodes.into_iter().rev() {
            let next = self.head.take();
            if next.is_none() {
                self.tail = Some(node.clone());
            }
            node.payload().lock().dirty_next = next;
            self.head = Some(node);
            self.len += 1;
        }
    }
}

impl<K, V> Drop for DirtyChain<K, V> {
    #[inline]
    fn drop(&mut self) {
        // Unlink one by one instead of letting a long chain drop recursively.
        while self.pop_front().is_some() {}
    }
}

impl<K, V> EntryState<K, V> {
    /// Records a mutation for write-back.
    ///
    /// Returns `true` if the entry has to be appended to the dirty chain.
    pub(crate) fn enlist(&mut self) -> bool {
        self.dirty_version += 1;
        !std::mem::replace(&mut self.in_dirty_chain, true)
    }
}

/// [`DirtyBatch`] is a set of dirty entries detached from the dirty chain of a [`LoadingCache`]
/// for a write-back consumer.
///
/// Iterating over the batch consumes entries in chain order. The batch must be finished with
/// [`DirtyBatch::commit`] once the consumed entries are persisted, or with
/// [`DirtyBatch::rollback`] or [`DirtyBatch::abort`] otherwise. A batch dropped without being
/// finished is aborted in direct mode and rolled back in copy-on mode.
///
/// In direct mode the entries keep their chain membership while the batch is open, so concurrent
/// mutations are folded into the batch and detected on commit. In copy-on mode chain membership
/// is cleared when the batch is drained, so a concurrent mutation re-links the entry right away.
pub struct DirtyBatch<'c, K, V, H>
where
    K: Eq + Hash,
    H: BuildHasher,
{
    cache: &'c LoadingCache<K, V, H>,
    nodes: Vec<(Arc<EntryNode<K, V>>, u64)>,
    consumed: usize,
    copy_on: bool,
    finished: bool,
}

/// [`DirtyEntry`] is a dirty key-value pair yielded by a [`DirtyBatch`].
pub struct DirtyEntry<K, V> {
    node: Arc<EntryNode<K, V>>,
    value: Arc<V>,
}

/// How a [`DirtyBatch`] is finished.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Finish {
    Commit,
    Rollback,
    Abort,
}

impl<K, V, H> LoadingCache<K, V, H>
where
    K: Eq + Hash,
    H: BuildHasher,
{
    /// Detaches up to `limit` entries from the head of the dirty chain.
    ///
    /// `copy_on` selects copy-on mode; see [`DirtyBatch`].
    ///
    /// # Examples
    ///
    /// ```
    /// use loadcache::LoadingCache;
    ///
    /// let cache: LoadingCache<u64, String> = LoadingCache::default();
    /// assert!(cache.update(1, |_, _| Ok::<_, std::io::Error>("one".to_owned())).is_ok());
    ///
    /// let mut batch = cache.drain_dirty(16, false);
    /// let entry = batch.next().unwrap();
    /// assert_eq!((*entry.key(), entry.value().as_str()), (1, "one"));
    /// assert_eq!(batch.commit(), 1);
    /// assert_eq!(cache.dirty_len(), 0);
    /// ```
    pub fn drain_dirty(&self, limit: usize, copy_on: bool) -> DirtyBatch<'_, K, V, H> {
        let mut chain = lock(&self.dirty);
        let mut nodes = Vec::with_capacity(limit.min(chain.len()));
        while nodes.len() < limit {
            let Some(node) = chain.pop_front() else {
                break;
            };
            let mut state = node.payload().lock();
            if copy_on {
                state.in_dirty_chain = false;
            }
            let version = state.dirty_version;
            drop(state);
            nodes.push((node, version));
        }
        drop(chain);
        debug!(drained = nodes.len(), copy_on, "dirty batch drained");
        DirtyBatch {
            cache: self,
            nodes,
            consumed: 0,
            copy_on,
            finished: false,
        }
    }

    /// Returns the number of entries in the dirty chain.
    ///
    /// Entries held by open direct-mode batches are not counted.
    #[inline]
    pub fn dirty_len(&self) -> usize {
        lock(&self.dirty).len()
    }

    /// Marks the entry dirty if it holds a value.
    ///
    /// `Ready → Dirty`; the entry is appended to the dirty chain unless it is already a member.
    pub(super) fn mark_dirty(&self, node: &Arc<EntryNode<K, V>>) -> bool {
        let mut chain = lock(&self.dirty);
        let mut state = node.payload().lock();
        let Some(value) = state.resolve() else {
            return false;
        };
        state.value = ValueState::Dirty(value);
        let link = state.enlist();
        drop(state);
        if link {
            chain.push_back(node.clone());
        }
        true
    }
}

impl<'c, K, V, H> DirtyBatch<'c, K, V, H>
where
    K: Eq + Hash,
    H: BuildHasher,
{
    /// Returns the number of entries in the batch.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` if the batch holds no entries.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns the number of entries consumed by iteration so far.
    #[inline]
    #[must_use]
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// Returns `true` if the batch was drained in copy-on mode.
    #[inline]
    #[must_use]
    pub fn is_copy_on(&self) -> bool {
        self.copy_on
    }

    /// Marks the consumed entries clean and returns the unconsumed ones to the dirty chain.
    ///
    /// A consumed entry that was mutated after it was drained stays dirty.
    ///
    /// Returns the number of entries marked clean.
    pub fn commit(mut self) -> usize {
        self.finish(Finish::Commit)
    }

    /// Returns every entry of the batch to the head of the dirty chain.
    ///
    /// Returns the number of re-linked entries.
    pub fn rollback(mut self) -> usize {
        self.finish(Finish::Rollback)
    }

    /// Gives up on the batch.
    ///
    /// In direct mode every entry goes back to the head of the dirty chain. In copy-on mode only
    /// the unconsumed entries do; the consumed ones are considered written.
    ///
    /// Returns the number of re-linked entries.
    pub fn abort(mut self) -> usize {
        self.finish(Finish::Abort)
    }

    fn finish(&mut self, how: Finish) -> usize {
        self.finished = true;
        let nodes = std::mem::take(&mut self.nodes);
        let mut chain = lock(&self.cache.dirty);
        let mut relink = Vec::new();
        let mut cleaned = 0;
        for (index, (node, version)) in nodes.into_iter().enumerate() {
            let consumed = index < self.consumed;
            let mut state = node.payload().lock();
            let written = consumed
                && (how == Finish::Commit || (how == Finish::Abort && self.copy_on));
            if written {
                // Unchanged since drained: the written value is the current one.
                if state.dirty_version == version
                    && !state.value.is_pending()
                    && (!self.copy_on || !state.in_dirty_chain)
                {
                    state.clean();
                    state.in_dirty_chain = false;
                    cleaned += 1;
                    continue;
                }
                if self.copy_on && (state.in_dirty_chain || state.dirty_version != version) {
                    // Re-linked by a mutation, or drained again by another batch.
                    continue;
                }
            }
            if self.copy_on {
                if state.in_dirty_chain {
                    continue;
                }
                state.in_dirty_chain = true;
            }
            drop(state);
            relink.push(node);
        }
        let relinked = relink.len();
        chain.push_front_all(relink);
        drop(chain);
        debug!(?how, cleaned, relinked, copy_on = self.copy_on, "dirty batch finished");
        match how {
            Finish::Commit => cleaned,
            Finish::Rollback | Finish::Abort => relinked,
        }
    }
}

impl<'c, K, V, H> Iterator for DirtyBatch<'c, K, V, H>
where
    K: Eq + Hash,
    H: BuildHasher,
{
    type Item = DirtyEntry<K, V>;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        while let Some((node, _)) = self.nodes.get(self.consumed) {
            let node = node.clone();
            self.consumed += 1;
            let value = node.payload().lock().value.peek();
            if let Some(value) = value {
                return Some(DirtyEntry { node, value });
            }
        }
        None
    }
}

impl<'c, K, V, H> Drop for DirtyBatch<'c, K, V, H>
where
    K: Eq + Hash,
    H: BuildHasher,
{
    #[inline]
    fn drop(&mut self) {
        if !self.finished && !self.nodes.is_empty() {
            warn!(
                entries = self.nodes.len(),
                consumed = self.consumed,
                "dirty batch dropped without commit"
            );
            let how = if self.copy_on {
                Finish::Rollback
            } else {
                Finish::Abort
            };
            self.finish(how);
        }
    }
}

impl<'c, K, V, H> Debug for DirtyBatch<'c, K, V, H>
where
    K: Eq + Hash,
    H: BuildHasher,
{
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirtyBatch")
            .field("len", &self.nodes.len())
            .field("consumed", &self.consumed)
            .field("copy_on", &self.copy_on)
            .finish_non_exhaustive()
    }
}

impl<K, V> DirtyEntry<K, V> {
    /// Returns a reference to the key.
    #[inline]
    #[must_use]
    pub fn key(&self) -> &K {
        self.node.key()
    }

    /// Returns a reference to the value as of the time it was consumed.
    #[inline]
    #[must_use]
    pub fn value(&self) -> &Arc<V> {
        &self.value
    }

    /// Takes the value.
    #[inline]
    #[must_use]
    pub fn into_value(self) -> Arc<V> {
        self.value
    }
}

impl<K: Debug, V: Debug> Debug for DirtyEntry<K, V> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirtyEntry")
            .field("key", self.key())
            .field("value", &self.value)
            .finish()
    }
}
