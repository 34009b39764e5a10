//! Sleepable locks: spin locks whose guards can sleep/wake on a channel.

use super::{Lock, RawLock, RawSpinlock, WaitChannel};

pub struct RawSleepableLock {
    lock: RawSpinlock,
    waitchannel: WaitChannel,
}

pub type SleepableLock<T> = Lock<RawSleepableLock, T>;
pub type SleepableLockGuard<'s, T> = super::Guard<'s, RawSleepableLock, T>;

impl RawSleepableLock {
    const fn new(name: &'static str) -> Self {
        Self {
            lock: RawSpinlock::new(name),
            waitchannel: WaitChannel::new(),
        }
    }
}

impl RawLock for RawSleepableLock {
    fn acquire(&self) {
        self.lock.acquire();
    }

    fn release(&self) {
        self.lock.release();
    }

    fn holding(&self) -> bool {
        self.lock.holding()
    }
}

impl<T> SleepableLock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self::wrap(RawSleepableLock::new(name), data)
    }
}

impl<T> SleepableLockGuard<'_, T> {
    /// Atomically releases the lock and sleeps until `wakeup` is called,
    /// then reacquires the lock. The caller is expected to loop:
    /// `while !condition(&guard) { guard.sleep(); }`.
    pub fn sleep(&mut self) {
        let lock = self.inner_lock();
        let raw = lock.raw();
        raw.lock.release();
        raw.waitchannel.sleep();
        raw.lock.acquire();
    }

    pub fn wakeup(&self) {
        self.inner_lock().raw().waitchannel.wakeup();
    }
}
