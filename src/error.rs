//! Errors returned by [`LoadingCache`](crate::LoadingCache) and [`LruTable`](crate::LruTable).

use std::sync::Arc;
use std::time::Duration;

/// A boxed error returned by a loader or an updater.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The error type of cache operations.
///
/// [`Error`] is [`Clone`] so that every caller waiting on the same failed load observes the same
/// error instance.
#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    /// Waited longer than the pending timeout for another thread's load to finish.
    ///
    /// The in-flight load is not affected; the caller may retry.
    #[error("timed out after {0:?} waiting for an in-flight load")]
    LoadTimeout(Duration),

    /// The maximum number of concurrent loads was reached.
    #[error("too many concurrent loads: limit is {0}")]
    Overload(usize),

    /// No entry could be evicted to make room for a new key.
    #[error("capacity of {0} entries exhausted: every entry is pending or dirty")]
    CapacityExhausted(usize),

    /// The loader failed; the entry was reverted so that a later call can retry.
    #[error("loader failed: {0}")]
    Loader(#[source] Arc<dyn std::error::Error + Send + Sync>),

    /// The updater failed; the previous value was kept.
    #[error("updater failed: {0}")]
    Updater(#[source] Arc<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Returns `true` if retrying the same call later may succeed without any other action.
    #[inline]
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::LoadTimeout(_) | Self::Overload(_))
    }

    pub(crate) fn loader<E: Into<BoxError>>(error: E) -> Self {
        Self::Loader(Arc::from(error.into()))
    }

    pub(crate) fn updater<E: Into<BoxError>>(error: E) -> Self {
        Self::Updater(Arc::from(error.into()))
    }
}
