//! Tick sources for access and staleness bookkeeping.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use std::time::Instant;

/// A monotonic tick source with one-second resolution.
pub trait Clock: Send + Sync {
    /// Returns the current tick.
    fn now(&self) -> u64;
}

/// [`MonotonicClock`] counts seconds elapsed since its creation.
#[derive(Clone, Copy, Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Creates a [`MonotonicClock`] starting at tick `0`.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    #[inline]
    fn now(&self) -> u64 {
        self.origin.elapsed().as_secs()
    }
}

/// [`ManualClock`] only moves when told to.
///
/// # Examples
///
/// ```
/// use loadcache::{Clock, ManualClock};
///
/// let clock = ManualClock::new(10);
/// clock.advance(5);
/// assert_eq!(clock.now(), 15);
/// ```
#[derive(Debug, Default)]
pub struct ManualClock {
    tick: AtomicU64,
}

impl ManualClock {
    /// Creates a [`ManualClock`] at the given tick.
    #[inline]
    #[must_use]
    pub const fn new(tick: u64) -> Self {
        Self {
            tick: AtomicU64::new(tick),
        }
    }

    /// Moves the clock forward.
    #[inline]
    pub fn advance(&self, secs: u64) {
        self.tick.fetch_add(secs, Relaxed);
    }

    /// Sets the current tick.
    #[inline]
    pub fn set(&self, tick: u64) {
        self.tick.store(tick, Relaxed);
    }
}

impl Clock for ManualClock {
    #[inline]
    fn now(&self) -> u64 {
        self.tick.load(Relaxed)
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    #[inline]
    fn now(&self) -> u64 {
        (**self).now()
    }
}
