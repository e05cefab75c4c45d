//! Lock helpers shared by the table, the dirty chain and the entries.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Acquires the lock, recovering the guard if a previous holder panicked.
///
/// Every critical section in this crate leaves the protected data consistent before calling into
/// user code, so a poisoned lock carries no torn state.
#[inline]
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
