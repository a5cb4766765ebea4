//! Busy-wait plumbing. Every suspension point in the crate spins through here.

use core::sync::atomic::{AtomicBool, Ordering};

/// Yield the OS thread every this many spins (std only).
pub const YIELD_INTERVAL: u64 = 64;

/// Why a spinning lane gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncError {
    /// Iteration cap reached before the wait condition held.
    SpinLimitExceeded = 1,
    /// Another lane raised the launch-wide abort flag.
    Aborted = 2,
    /// Arrived at a latch that was already released. Reset it first.
    LatchExhausted = 3,
}

/// Optional cap on spin iterations. Unbounded on real hardware, bounded under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpinBudget {
    limit: Option<u64>,
}

impl SpinBudget {
    pub const UNBOUNDED: Self = Self { limit: None };

    #[inline(always)]
    pub const fn bounded(limit: u64) -> Self {
        Self { limit: Some(limit) }
    }

    #[inline(always)]
    pub const fn from_limit(limit: Option<u64>) -> Self {
        Self { limit }
    }

    #[inline(always)]
    pub const fn limit(&self) -> Option<u64> {
        self.limit
    }

    /// Spin until `ready()` holds. Returns the iterations spent.
    ///
    /// `ready` is polled before the abort flag, so a condition that is already
    /// true never fails.
    #[inline]
    pub fn spin_until<F>(&self, abort: Option<&AtomicBool>, mut ready: F) -> Result<u64, SyncError>
    where
        F: FnMut() -> bool,
    {
        let mut spins = 0u64;
        loop {
            if ready() {
                return Ok(spins);
            }
            if let Some(flag) = abort {
                if flag.load(Ordering::Relaxed) {
                    return Err(SyncError::Aborted);
                }
            }
            spins += 1;
            if let Some(limit) = self.limit {
                if spins >= limit {
                    return Err(SyncError::SpinLimitExceeded);
                }
            }
            relax(spins);
        }
    }
}

impl Default for SpinBudget {
    fn default() -> Self {
        Self::UNBOUNDED
    }
}

#[cfg(feature = "std")]
#[inline(always)]
fn relax(spins: u64) {
    core::hint::spin_loop();
    if spins % YIELD_INTERVAL == 0 {
        std::thread::yield_now();
    }
}

#[cfg(not(feature = "std"))]
#[inline(always)]
fn relax(_spins: u64) {
    core::hint::spin_loop();
}
