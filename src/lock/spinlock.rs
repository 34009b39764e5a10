//! Spin locks.

use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, Ordering};

use super::{Lock, RawLock};

/// Mutual exclusion lock that busy-waits. Unlike the donor's
/// `RawSpinlock`, this does not pair acquisition with disabling
/// interrupts on the current CPU -- trap/interrupt handling is out of
/// scope for this crate (§1) and is the embedding kernel's job.
pub struct RawSpinlock {
    name: &'static str,
    locked: AtomicBool,
}

pub type Spinlock<T> = Lock<RawSpinlock, T>;
pub type SpinlockGuard<'s, T> = super::Guard<'s, RawSpinlock, T>;

impl RawSpinlock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            locked: AtomicBool::new(false),
        }
    }
}

impl RawLock for RawSpinlock {
    fn acquire(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spin_loop();
        }
    }

    fn release(&self) {
        assert!(self.holding(), "release: not held ({})", self.name);
        self.locked.store(false, Ordering::Release);
    }

    fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl<T> Spinlock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self::wrap(RawSpinlock::new(name), data)
    }
}
