//! Kernel logging.
//!
//! The donor kernel owns its own `printf`/`console` pair instead of pulling
//! in `log`/`tracing`: every subsystem formats through a print lock so
//! concurrent callers don't interleave, and a "someone already panicked"
//! latch makes every other caller stop printing instead of racing to emit a
//! second, garbled panic. This module keeps that shape but sinks to stderr
//! instead of a UART, since the console driver itself is out of scope
//! (§1): storage and mounts are what this crate is about.

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

static PANICKED: AtomicBool = AtomicBool::new(false);
static PRINT_LOCK: Mutex<()> = Mutex::new(());

pub fn panicked() -> bool {
    PANICKED.load(Ordering::Acquire)
}

/// Marks the kernel as panicked. Once set, other callers of `kprintln!`
/// should stop producing output so a panic message isn't interleaved with
/// unrelated log lines.
pub fn set_panicked() {
    PANICKED.store(true, Ordering::Release);
}

#[doc(hidden)]
pub fn print_locked(args: fmt::Arguments<'_>) {
    if panicked() {
        return;
    }
    let _guard = PRINT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    eprint!("{}", args);
}

#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {
        $crate::printf::print_locked(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kprintln {
    () => { $crate::kprint!("\n") };
    ($($arg:tt)*) => {
        $crate::printf::print_locked(format_args!("{}\n", format_args!($($arg)*)))
    };
}

/// Prints a panic message (bypassing the `panicked` latch, since this *is*
/// the panic) and latches `PANICKED` so no further lines are interleaved.
#[macro_export]
macro_rules! kpanic {
    ($($arg:tt)*) => {{
        $crate::printf::set_panicked();
        panic!($($arg)*)
    }};
}
