//! Virtual filesystem layer (§4.8 §3): a uniform inode/superblock
//! interface over the two concrete backends. The donor kernel resolves
//! this with a generic `FileSystem` trait parameterized over the
//! backend (`Ufs`/`Lfs`); per this design's license to pick "whichever
//! the target language expresses more cleanly" (§9), this crate uses a
//! tagged `enum` instead -- the donor's own, earlier `fs/mod.rs` takes
//! the same non-generic shape.
//!
//! Both backends hold their own `Arc<Kernel>` (see `kernel::Kernel`),
//! so VFS-level operations need only `&self` -- there is only ever one
//! `Kernel` in a running instance of this crate, so threading an extra
//! `&Kernel` through every call here would be redundant.

pub mod namex;
pub mod native;
pub mod objfs;
pub mod path;

pub use path::{FileName, Path};

use std::sync::Arc;

use crate::device::DeviceId;
use crate::errno::{Error, Result};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InodeType {
    Dir,
    File,
    Dev,
}

#[derive(Clone, Copy, Debug)]
pub struct Stat {
    pub dev: DeviceId,
    pub ino: u32,
    pub kind: InodeType,
    pub nlink: i16,
    pub size: u64,
}

/// A mounted filesystem instance: one of the two backends, refcounted
/// through the `Arc` each mount holds.
#[derive(Clone)]
pub enum VfsSuperblock {
    Native(Arc<native::NativeFs>),
    Obj(Arc<objfs::ObjFs>),
}

impl VfsSuperblock {
    pub fn root_inode(&self) -> VfsInode {
        match self {
            VfsSuperblock::Native(fs) => VfsInode::Native(fs.root_inode()),
            VfsSuperblock::Obj(fs) => VfsInode::Obj(fs.root_inode()),
        }
    }

    pub fn dev(&self) -> DeviceId {
        match self {
            VfsSuperblock::Native(fs) => fs.dev.id,
            VfsSuperblock::Obj(fs) => fs.dev.id,
        }
    }

    /// Opens a write-ahead transaction. A no-op for objfs, whose
    /// mutations are serialized by the object disk's own sleeplock
    /// instead (§4.5).
    pub fn begin_tx(&self) -> Tx<'_> {
        match self {
            VfsSuperblock::Native(fs) => Tx::Native(fs.begin_tx()),
            VfsSuperblock::Obj(_) => Tx::Obj,
        }
    }
}

/// A refcounted handle to an in-memory inode, on one backend or the
/// other.
#[derive(Clone)]
pub enum VfsInode {
    Native(native::RcInode),
    Obj(objfs::RcInode),
}

impl VfsInode {
    pub fn dev(&self) -> DeviceId {
        match self {
            VfsInode::Native(ip) => ip.dev(),
            VfsInode::Obj(ip) => ip.dev(),
        }
    }

    pub fn inum(&self) -> u32 {
        match self {
            VfsInode::Native(ip) => ip.inum(),
            VfsInode::Obj(ip) => ip.inum(),
        }
    }

    pub fn same_inode(&self, other: &VfsInode) -> bool {
        self.dev() == other.dev() && self.inum() == other.inum()
    }

    pub fn kind(&self) -> InodeType {
        match self {
            VfsInode::Native(ip) => ip.kind(),
            VfsInode::Obj(ip) => ip.kind(),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind() == InodeType::Dir
    }

    pub fn major(&self) -> u16 {
        match self {
            VfsInode::Native(ip) => ip.major(),
            VfsInode::Obj(ip) => ip.major(),
        }
    }

    pub fn minor(&self) -> u16 {
        match self {
            VfsInode::Native(ip) => ip.minor(),
            VfsInode::Obj(ip) => ip.minor(),
        }
    }

    pub fn stat(&self) -> Stat {
        match self {
            VfsInode::Native(ip) => ip.stat(),
            VfsInode::Obj(ip) => ip.stat(),
        }
    }

    pub fn read(&self, off: u64, buf: &mut [u8]) -> Result<usize> {
        match self {
            VfsInode::Native(ip) => ip.read(off, buf),
            VfsInode::Obj(ip) => ip.read(off, buf),
        }
    }

    pub fn write(&self, off: u64, data: &[u8]) -> Result<usize> {
        match self {
            VfsInode::Native(ip) => ip.write(off, data),
            VfsInode::Obj(ip) => ip.write(off, data),
        }
    }

    pub fn dirlookup(&self, name: &FileName) -> Result<VfsInode> {
        match self {
            VfsInode::Native(ip) => ip.dirlookup(name).map(VfsInode::Native),
            VfsInode::Obj(ip) => ip.dirlookup(name).map(VfsInode::Obj),
        }
    }

    /// Links `name -> child` into `self`, which must be a directory on
    /// the same backend (and, for native fs, same device) as `child`.
    pub fn dirlink(&self, name: &FileName, child: &VfsInode) -> Result<()> {
        match (self, child) {
            (VfsInode::Native(dir), VfsInode::Native(child)) => {
                if dir.dev() != child.dev() {
                    return Err(Error::CrossDevice);
                }
                dir.dirlink(name, child)
            }
            (VfsInode::Obj(dir), VfsInode::Obj(child)) => {
                if dir.dev() != child.dev() {
                    return Err(Error::CrossDevice);
                }
                dir.dirlink(name, child)
            }
            _ => Err(Error::CrossFilesystem),
        }
    }

    /// Clears the directory entry named `name` in `self` (a directory),
    /// freeing its slot. Leaves the target inode's link count untouched.
    pub fn dirunlink(&self, name: &FileName) -> Result<()> {
        match self {
            VfsInode::Native(ip) => ip.dirunlink(name),
            VfsInode::Obj(ip) => ip.dirunlink(name),
        }
    }

    pub fn isdirempty(&self) -> bool {
        match self {
            VfsInode::Native(ip) => ip.isdirempty(),
            VfsInode::Obj(ip) => ip.isdirempty(),
        }
    }

    /// Creates a fresh inode of `kind` on the same backend/device as
    /// `self` (used as the "directory we're creating inside").
    pub fn ialloc(&self, kind: InodeType) -> Result<VfsInode> {
        match self {
            VfsInode::Native(dir) => dir.fs().ialloc(kind).map(VfsInode::Native),
            VfsInode::Obj(dir) => dir.fs().ialloc(kind).map(VfsInode::Obj),
        }
    }

    /// Sets the major/minor pair a `T_DEV` inode dispatches through.
    pub fn set_devnum(&self, major: u16, minor: u16) {
        match self {
            VfsInode::Native(ip) => ip.set_devnum(major, minor),
            VfsInode::Obj(ip) => ip.set_devnum(major, minor),
        }
    }

    pub fn link(&self) {
        match self {
            VfsInode::Native(ip) => ip.adjust_nlink(1),
            VfsInode::Obj(ip) => ip.adjust_nlink(1),
        }
    }

    /// Drops one link; when `nlink` reaches zero and this was the last
    /// reference, truncates and frees the inode (§3 Inode invariants).
    pub fn unlink(&self) {
        match self {
            VfsInode::Native(ip) => ip.adjust_nlink(-1),
            VfsInode::Obj(ip) => ip.adjust_nlink(-1),
        }
    }
}

/// RAII guard for a native-fs write-ahead transaction.
pub enum Tx<'a> {
    Native(native::Tx<'a>),
    Obj,
}
