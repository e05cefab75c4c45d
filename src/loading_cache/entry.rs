use crate::lru_table::{Node, Recency};
use crate::sync::lock;
use crate::Error;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::atomic::{AtomicU64, AtomicUsize};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, TryLockError, Weak};
use std::time::{Duration, Instant};

/// A node of the table backing a [`LoadingCache`](super::LoadingCache).
pub(crate) type EntryNode<K, V> = Node<K, EntryCell<K, V>>;

/// The value held by an entry.
pub(crate) enum ValueState<V> {
    /// Never loaded, or the last load failed, or the detached value was reclaimed.
    Unassigned,

    /// A load or an update is in flight.
    Pending,

    /// A loaded value.
    Ready(Arc<V>),

    /// A value with unflushed mutations.
    Dirty(Arc<V>),

    /// An idle value released to its external holders.
    Detached(Weak<V>),

    /// A load that succeeded without a value.
    Missing,
}

impl<V> ValueState<V> {
    /// Returns the value without changing the state.
    pub(crate) fn peek(&self) -> Option<Arc<V>> {
        match self {
            Self::Ready(v) | Self::Dirty(v) => Some(v.clone()),
            Self::Detached(w) => w.upgrade(),
            Self::Unassigned | Self::Pending | Self::Missing => None,
        }
    }

    #[inline]
    pub(crate) const fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    #[inline]
    pub(crate) const fn is_dirty(&self) -> bool {
        matches!(self, Self::Dirty(_))
    }
}

/// State guarded by the entry lock.
pub(crate) struct EntryState<K, V> {
    /// The current value.
    pub(crate) value: ValueState<V>,

    /// Tick at which the current value or empty result was installed.
    pub(crate) last_ready: u64,

    /// Incremented whenever the entry becomes pending.
    pub(crate) load_epoch: u64,

    /// The error of the load started at the recorded epoch.
    pub(crate) failure: Option<(u64, Error)>,

    /// The entry was removed from the table; installing a value no longer caches it.
    pub(crate) removed: bool,

    /// The entry is in the dirty chain or in a direct-mode batch drained from it.
    pub(crate) in_dirty_chain: bool,

    /// Incremented whenever the entry is marked dirty.
    pub(crate) dirty_version: u64,

    /// The next entry of the dirty chain.
    pub(crate) dirty_next: Option<Arc<EntryNode<K, V>>>,
}

impl<K, V> EntryState<K, V> {
    /// Resolves the value, upgrading or dropping a detached weak handle.
    ///
    /// `Detached → Ready` if the value is still alive; `Detached → Unassigned` otherwise.
    pub(crate) fn resolve(&mut self) -> Option<Arc<V>> {
        match &self.value {
            ValueState::Ready(v) | ValueState::Dirty(v) => Some(v.clone()),
            ValueState::Detached(w) => {
                if let Some(v) = w.upgrade() {
                    self.value = ValueState::Ready(v.clone());
                    Some(v)
                } else {
                    self.value = ValueState::Unassigned;
                    None
                }
            }
            ValueState::Unassigned | ValueState::Pending | ValueState::Missing => None,
        }
    }

    /// Starts a load or an update; `* → Pending`.
    ///
    /// Returns the replaced state and the new epoch.
    pub(crate) fn begin(&mut self) -> (ValueState<V>, u64) {
        self.load_epoch += 1;
        let prior = std::mem::replace(&mut self.value, ValueState::Pending);
        (prior, self.load_epoch)
    }

    /// `Ready → Detached`.
    ///
    /// Returns `false` if the entry does not hold a clean value.
    pub(crate) fn detach(&mut self) -> bool {
        if let ValueState::Ready(v) = &self.value {
            self.value = ValueState::Detached(Arc::downgrade(v));
            true
        } else {
            false
        }
    }

    /// `Dirty → Ready` once the value has been written back.
    pub(crate) fn clean(&mut self) {
        if let ValueState::Dirty(v) = &self.value {
            self.value = ValueState::Ready(v.clone());
        }
    }

    /// Returns `true` if the entry is protected from every eviction path.
    #[inline]
    pub(crate) fn is_protected(&self) -> bool {
        self.value.is_pending() || self.value.is_dirty() || self.in_dirty_chain
    }
}

/// [`EntryCell`] is the payload of a table node: the entry lock, its state, and the condition
/// variable that waiters of a pending load park on.
pub(crate) struct EntryCell<K, V> {
    state: Mutex<EntryState<K, V>>,
    settled: Condvar,
    last_access: AtomicU64,
}

impl<K, V> EntryCell<K, V> {
    /// Creates an entry in the given state.
    pub(crate) fn new(value: ValueState<V>, now: u64) -> Self {
        let load_epoch = u64::from(value.is_pending());
        Self {
            state: Mutex::new(EntryState {
                value,
                last_ready: now,
                load_epoch,
                failure: None,
                removed: false,
                in_dirty_chain: false,
                dirty_version: 0,
                dirty_next: None,
            }),
            settled: Condvar::new(),
            last_access: AtomicU64::new(now),
        }
    }

    /// Acquires the entry lock.
    #[inline]
    pub(crate) fn lock(&self) -> MutexGuard<'_, EntryState<K, V>> {
        lock(&self.state)
    }

    /// Acquires the entry lock if it is free.
    #[inline]
    pub(crate) fn try_lock(&self) -> Option<MutexGuard<'_, EntryState<K, V>>> {
        match self.state.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    /// Records an access.
    #[inline]
    pub(crate) fn stamp(&self, now: u64) {
        self.last_access.fetch_max(now, Relaxed);
    }

    /// Wakes every thread waiting for the entry to leave [`ValueState::Pending`].
    #[inline]
    pub(crate) fn notify(&self) {
        self.settled.notify_all();
    }

    /// Waits until the pending operation observed through `state` finishes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LoadTimeout`] if the operation is still pending after `timeout`, or the
    /// error of the awaited load if it failed.
    pub(crate) fn wait_settled<'e>(
        &'e self,
        mut state: MutexGuard<'e, EntryState<K, V>>,
        timeout: Duration,
    ) -> Result<MutexGuard<'e, EntryState<K, V>>, Error> {
        let epoch = state.load_epoch;
        // No deadline if the timeout does not fit in an `Instant`.
        let deadline = Instant::now().checked_add(timeout);
        while state.value.is_pending() && state.load_epoch == epoch {
            state = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(Error::LoadTimeout(timeout));
                    }
                    self.settled
                        .wait_timeout(state, remaining)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .settled
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
        match &state.failure {
            Some((failed_epoch, error)) if *failed_epoch == epoch => Err(error.clone()),
            _ => Ok(state),
        }
    }
}

impl<K, V> Recency for EntryCell<K, V> {
    #[inline]
    fn last_access(&self) -> u64 {
        self.last_access.load(Relaxed)
    }
}

/// [`PendingGuard`] is held by the thread that moved an entry to [`ValueState::Pending`].
///
/// If the guard is dropped before [`PendingGuard::settle`], for instance because the loader
/// panicked, the entry goes back to its prior state and the waiters are woken up.
pub(crate) struct PendingGuard<'g, K, V> {
    node: &'g EntryNode<K, V>,
    epoch: u64,
    prior: Option<ValueState<V>>,
    load_slot: Option<&'g AtomicUsize>,
}

impl<'g, K, V> PendingGuard<'g, K, V> {
    /// Creates a guard for the pending operation started at `epoch`.
    ///
    /// `prior` is restored if the operation is abandoned; `load_slot` is the concurrent load
    /// counter the operation reserved a slot of.
    pub(crate) fn new(
        node: &'g EntryNode<K, V>,
        epoch: u64,
        prior: ValueState<V>,
        load_slot: Option<&'g AtomicUsize>,
    ) -> Self {
        Self {
            node,
            epoch,
            prior: Some(prior),
            load_slot,
        }
    }

    /// Installs the outcome of the operation and wakes the waiters.
    ///
    /// `settle` receives the entry state and the prior state. Nothing but the guard holder moves
    /// an entry out of [`ValueState::Pending`], therefore the state is still pending here.
    pub(crate) fn settle<R, F>(mut self, settle: F) -> R
    where
        F: FnOnce(&mut EntryState<K, V>, ValueState<V>) -> R,
    {
        let prior = self.prior.take().unwrap_or(ValueState::Unassigned);
        let payload = self.node.payload();
        let mut state = payload.lock();
        debug_assert!(state.value.is_pending() && state.load_epoch == self.epoch);
        let result = settle(&mut state, prior);
        drop(state);
        payload.notify();
        result
    }
}

impl<'g, K, V> Drop for PendingGuard<'g, K, V> {
    #[inline]
    fn drop(&mut self) {
        if let Some(prior) = self.prior.take() {
            let payload = self.node.payload();
            let mut state = payload.lock();
            if state.value.is_pending() && state.load_epoch == self.epoch {
                state.value = prior;
            }
            drop(state);
            payload.notify();
        }
        if let Some(load_slot) = self.load_slot {
            load_slot.fetch_sub(1, Relaxed);
        }
    }
}
