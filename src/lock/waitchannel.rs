//! Sleep/wakeup channels.
//!
//! Per §6/§10.5, sleep/wakeup is one of the external collaborators this
//! crate only consumes through a thin interface -- the donor kernel's
//! `WaitChannel` calls into `proc`/`kernel_builder()` to actually block
//! and reschedule a kernel thread. In this hosted, testable core that
//! collaborator is the host OS's own thread scheduler: `WaitChannel`
//! blocks the calling OS thread on a condition variable and wakes it with
//! `notify_all`, exactly the "thread+mutex world" substitution the design
//! notes license for the `sleep`/`wakeup` pattern.

use std::sync::{Condvar, Mutex};

pub struct WaitChannel {
    gate: Mutex<()>,
    cv: Condvar,
}

impl WaitChannel {
    pub const fn new() -> Self {
        Self {
            gate: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    /// Blocks the calling thread until the next `wakeup`. The caller must
    /// have already released whatever lock it was holding on the
    /// protected data (see `SleepableLockGuard::sleep`), and must re-check
    /// its wait condition in a loop after returning, since wakeups may be
    /// spurious or intended for a different waiter on the same channel.
    pub fn sleep(&self) {
        let guard = self.gate.lock().unwrap_or_else(|e| e.into_inner());
        let _ = self.cv.wait(guard);
    }

    pub fn wakeup(&self) {
        self.cv.notify_all();
    }
}

impl Default for WaitChannel {
    fn default() -> Self {
        Self::new()
    }
}
