//! rv6fs: a teaching-grade filesystem core from the Unix Version 6
//! lineage, unifying a block-oriented native filesystem (with write-ahead
//! logging) and an object-addressed filesystem behind one VFS, plus the
//! mount table, namespaces, and syscall surface built on top of it.

#![deny(rust_2018_idioms)]
#![deny(unused_must_use)]
#![allow(clippy::too_many_arguments)]

pub mod arena;
pub mod bio;
pub mod device;
pub mod errno;
pub mod fcntl;
pub mod file;
pub mod fs;
pub mod kernel;
pub mod lock;
pub mod mount;
pub mod param;
pub mod printf;
pub mod stat;
pub mod syscall;
