//! Kernel-internal error type.
//!
//! Argument faults and local-recovery conditions (§7 of the design doc)
//! are surfaced as `Err(Error)` and eventually collapse to `-1` at the
//! syscall boundary. Resource exhaustion, corruption, and concurrency
//! misuse are *not* represented here -- those remain `panic!`/`assert!`,
//! matching the donor kernel and the spec's fatal bucket.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Path component, device name, or other argument was malformed.
    InvalidArgument,
    /// A path component (or object/device name) exceeded its fixed length.
    NameTooLong,
    /// No such file, directory, device, or mount.
    NotFound,
    /// Expected a directory, found something else.
    NotDir,
    /// Expected a non-directory, found a directory.
    IsDir,
    /// Name already exists in this directory / object table / mount list.
    Exists,
    /// Directory is not empty.
    NotEmpty,
    /// Operation would cross a device boundary it may not cross (e.g.
    /// linking between two distinct native-fs instances).
    CrossDevice,
    /// Operation would cross a mount boundary it may not cross.
    CrossMount,
    /// Operation would cross between the native and objfs backends.
    CrossFilesystem,
    /// Mount point is still referenced; cannot unmount or pivot away from it.
    Busy,
    /// Object or file is too large for the backend's limits.
    TooLarge,
    /// Backing store (obj disk, device table, inode table) is full.
    NoSpace,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::InvalidArgument => "invalid argument",
            Error::NameTooLong => "name too long",
            Error::NotFound => "no such file or directory",
            Error::NotDir => "not a directory",
            Error::IsDir => "is a directory",
            Error::Exists => "already exists",
            Error::NotEmpty => "directory not empty",
            Error::CrossDevice => "cross-device operation",
            Error::CrossMount => "cross-mount operation",
            Error::CrossFilesystem => "cross-filesystem operation",
            Error::Busy => "resource busy",
            Error::TooLarge => "too large",
            Error::NoSpace => "no space left on device",
        };
        f.write_str(msg)
    }
}

pub type Result<T> = core::result::Result<T, Error>;
