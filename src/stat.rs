//! File status types surfaced at the syscall boundary (§6).

pub use crate::fs::Stat;

/// What a `T_DEV` inode's major-number handler reports back for `fstat`,
/// distinct from `fs::Stat` since a device has no backing inode fields of
/// its own (size, link count) to report -- only its minor number and
/// whatever size the handler chooses to claim.
#[derive(Clone, Copy, Debug)]
pub struct DevStat {
    pub minor: u16,
    pub size: u64,
}
