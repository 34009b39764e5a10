//! Lock primitives.
//!
//! Mirrors the donor kernel's `lock` module: a single generic `Lock<R, T>`
//! wrapping a `RawLock` policy plus the protected data, with `Spinlock`,
//! `Sleeplock`, and `SleepableLock` as named instantiations. The donor's
//! `RawSpinlock` additionally pairs acquisition with disabling interrupts
//! on the current CPU (`push_off`/`pop_off`) -- that pairing is the
//! scheduler/trap layer's job and is out of scope here (§1), so this
//! `RawSpinlock` only does the atomic part.

mod sleepablelock;
mod sleeplock;
mod spinlock;
mod waitchannel;

pub use sleepablelock::{RawSleepableLock, SleepableLock, SleepableLockGuard};
pub use sleeplock::{RawSleeplock, Sleeplock, SleeplockGuard};
pub use spinlock::{RawSpinlock, Spinlock, SpinlockGuard};
pub use waitchannel::WaitChannel;

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

/// A lock's acquisition/release/introspection policy, decoupled from the
/// data it protects.
pub trait RawLock {
    fn acquire(&self);
    fn release(&self);
    fn holding(&self) -> bool;
}

/// A `RawLock` paired with the data it protects.
pub struct Lock<R: RawLock, T> {
    lock: R,
    data: UnsafeCell<T>,
}

// SAFETY: `R` arbitrates exclusive access to `data`; `Guard` is the only
// way to reach it.
unsafe impl<R: RawLock + Send, T: Send> Send for Lock<R, T> {}
unsafe impl<R: RawLock + Sync, T: Send> Sync for Lock<R, T> {}

impl<R: RawLock, T> Lock<R, T> {
    pub const fn wrap(lock: R, data: T) -> Self {
        Self {
            lock,
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> Guard<'_, R, T> {
        self.lock.acquire();
        Guard { lock: self }
    }

    /// Returns a reference to the raw lock, without touching the data.
    /// Used by `SleepableLockGuard::sleep`/`wakeup`, which must reach the
    /// lock's `WaitChannel` while already holding the guard.
    pub(crate) fn raw(&self) -> &R {
        &self.lock
    }

    /// # Safety
    ///
    /// Caller must hold the lock (directly or indirectly, e.g. via a
    /// `Guard` that has temporarily released it to sleep).
    pub(crate) unsafe fn get_mut_unchecked(&self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }
}

pub struct Guard<'s, R: RawLock, T> {
    lock: &'s Lock<R, T>,
}

impl<'s, R: RawLock, T> Guard<'s, R, T> {
    /// Returns the `Lock` this guard was issued from. Used by
    /// `SleepableLockGuard::sleep`/`wakeup` to reach the raw lock's
    /// `WaitChannel` while the guard is held.
    pub(crate) fn inner_lock(&self) -> &'s Lock<R, T> {
        self.lock
    }
}

impl<R: RawLock, T> Deref for Guard<'_, R, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: holding the guard implies holding the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<R: RawLock, T> DerefMut for Guard<'_, R, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: holding the guard implies holding the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<R: RawLock, T> Drop for Guard<'_, R, T> {
    fn drop(&mut self) {
        self.lock.lock.release();
    }
}
