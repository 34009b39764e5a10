//! Long-term sleeping locks, used for inode and buffer content.

use std::thread::{self, ThreadId};

use super::{Lock, RawLock, SleepableLock};

/// Long-term lock that blocks (rather than spins) while contended.
/// Ownership is tracked by OS thread id, standing in for the donor's pid
/// (the process layer that would own a "current process" concept is out
/// of scope here, see §1/§10.5).
pub struct RawSleeplock {
    owner: SleepableLock<Option<ThreadId>>,
    name: &'static str,
}

pub type Sleeplock<T> = Lock<RawSleeplock, T>;
pub type SleeplockGuard<'s, T> = super::Guard<'s, RawSleeplock, T>;

impl RawSleeplock {
    const fn new(name: &'static str) -> Self {
        Self {
            owner: SleepableLock::new("sleeplock owner", None),
            name,
        }
    }
}

impl RawLock for RawSleeplock {
    fn acquire(&self) {
        let mut guard = self.owner.lock();
        while guard.is_some() {
            guard.sleep();
        }
        *guard = Some(thread::current().id());
    }

    fn release(&self) {
        let mut guard = self.owner.lock();
        assert_eq!(*guard, Some(thread::current().id()), "release: not held ({})", self.name);
        *guard = None;
        guard.wakeup();
    }

    fn holding(&self) -> bool {
        *self.owner.lock() == Some(thread::current().id())
    }
}

impl<T> Sleeplock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self::wrap(RawSleeplock::new(name), data)
    }
}
