//! Device-wide spin lock. CAS to take, fence on both edges, no fairness.

use core::cell::UnsafeCell;
use core::sync::atomic::{fence, AtomicBool, AtomicU32, Ordering};

use super::spin::{SpinBudget, SyncError};

pub const UNLOCKED: u32 = 0;
pub const LOCKED: u32 = 1;

/// The bare flag. No owner tracking, no reentrancy.
#[derive(Debug)]
pub struct RawSpinLock {
    flag: AtomicU32,
}

impl RawSpinLock {
    pub const fn new() -> Self {
        Self {
            flag: AtomicU32::new(UNLOCKED),
        }
    }

    /// Spin until the flag is ours.
    #[inline]
    pub fn lock(&self) {
        // An unbounded budget without an abort flag cannot fail.
        let _ = self.lock_with(SpinBudget::UNBOUNDED, None);
    }

    /// Spin until the flag is ours, the budget runs out, or the launch aborts.
    /// Returns the spins spent waiting.
    #[inline]
    pub fn lock_with(&self, budget: SpinBudget, abort: Option<&AtomicBool>) -> Result<u64, SyncError> {
        let spins = budget.spin_until(abort, || {
            self.flag
                .compare_exchange_weak(UNLOCKED, LOCKED, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        })?;
        // Protected accesses must not float above the acquisition.
        fence(Ordering::AcqRel);
        Ok(spins)
    }

    #[inline]
    pub fn try_lock(&self) -> bool {
        let taken = self
            .flag
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok();
        if taken {
            fence(Ordering::AcqRel);
        }
        taken
    }

    /// Release. Must only be called by the holder.
    #[inline]
    pub fn unlock(&self) {
        // Protected writes must be visible before the flag clears.
        fence(Ordering::AcqRel);
        self.flag.swap(UNLOCKED, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn is_locked(&self) -> bool {
        self.flag.load(Ordering::Relaxed) == LOCKED
    }
}

impl Default for RawSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

/// A value behind a [`RawSpinLock`].
pub struct SpinMutex<T> {
    raw: RawSpinLock,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for SpinMutex<T> {}
unsafe impl<T: Send> Sync for SpinMutex<T> {}

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            raw: RawSpinLock::new(),
            data: UnsafeCell::new(value),
        }
    }

    #[inline]
    pub fn lock(&self) -> SpinGuard<'_, T> {
        self.raw.lock();
        SpinGuard { mutex: self }
    }

    #[inline]
    pub fn lock_with(
        &self,
        budget: SpinBudget,
        abort: Option<&AtomicBool>,
    ) -> Result<SpinGuard<'_, T>, SyncError> {
        self.raw.lock_with(budget, abort)?;
        Ok(SpinGuard { mutex: self })
    }

    #[inline]
    pub fn try_lock(&self) -> Option<SpinGuard<'_, T>> {
        if self.raw.try_lock() {
            Some(SpinGuard { mutex: self })
        } else {
            None
        }
    }

    #[inline(always)]
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    /// Exclusive access needs no lock.
    #[inline(always)]
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: Default> Default for SpinMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> core::fmt::Debug for SpinMutex<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SpinMutex")
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

/// Held lock. Unlocks on drop.
pub struct SpinGuard<'a, T> {
    mutex: &'a SpinMutex<T>,
}

impl<'a, T> core::ops::Deref for SpinGuard<'a, T> {
    type Target = T;
    #[inline(always)]
    fn deref(&self) -> &T {
        // SAFETY: the guard proves the flag is held.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<'a, T> core::ops::DerefMut for SpinGuard<'a, T> {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves the flag is held, and `&mut self` makes it unique.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<'a, T> Drop for SpinGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        self.mutex.raw.unlock();
    }
}
