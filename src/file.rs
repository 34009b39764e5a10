//! Open file descriptions (§6) and the `devsw` major-device dispatch table.
//!
//! Grounded on `arena::ArrayArena`: the global file table is exactly the
//! "a few dozen refcounted slots behind one spinlock" shape that module was
//! written for. `ArrayArena::find_or_alloc_index` hands back a raw slot
//! index rather than a borrowed `ArenaRc` for exactly this case -- a handle
//! that must outlive the borrow of the arena itself -- so `RcFile` wraps an
//! `Arc<Kernel>` plus that index, the same shape `fs::native::RcInode` and
//! `fs::objfs::RcInode` use for their own tables.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::arena::{ArenaObject, ArrayArena};
use crate::errno::{Error, Result};
use crate::fs::{Stat, VfsInode};
use crate::kernel::Kernel;
use crate::lock::Spinlock;
use crate::param::{NDEV, NFILE};

/// A major-number device handler, dispatched to for reads/writes/stats of
/// a `T_DEV` inode (§6's `devsw` table).
pub trait DevSw: Send + Sync {
    fn read(&self, minor: u16, dst: &mut [u8]) -> Result<usize>;
    fn write(&self, minor: u16, src: &[u8]) -> Result<usize>;
    fn stat(&self, minor: u16) -> crate::stat::DevStat;
}

/// Major-number-indexed table of device handlers, one per running kernel.
pub struct DevTable {
    entries: Spinlock<Vec<Option<Arc<dyn DevSw>>>>,
}

impl DevTable {
    pub fn new() -> Self {
        Self {
            entries: Spinlock::new("devsw", (0..NDEV).map(|_| None).collect()),
        }
    }

    pub fn register(&self, major: usize, dev: Arc<dyn DevSw>) {
        let mut entries = self.entries.lock();
        assert!(major < NDEV, "major device number {} out of range", major);
        entries[major] = Some(dev);
    }

    pub fn get(&self, major: usize) -> Option<Arc<dyn DevSw>> {
        self.entries.lock().get(major).and_then(Clone::clone)
    }
}

impl Default for DevTable {
    fn default() -> Self {
        Self::new()
    }
}

pub enum FileType {
    Inode { ip: VfsInode, off: AtomicU64 },
    Device { ip: VfsInode, major: u16 },
}

pub struct File {
    typ: FileType,
    readable: bool,
    writable: bool,
}

impl File {
    pub const fn new(typ: FileType, readable: bool, writable: bool) -> Self {
        Self { typ, readable, writable }
    }

    pub fn stat(&self) -> Stat {
        match &self.typ {
            FileType::Inode { ip, .. } | FileType::Device { ip, .. } => ip.stat(),
        }
    }

    /// `devsw` is unused for `FileType::Inode`; `read`/`write` take it
    /// uniformly rather than splitting into two entry points, since callers
    /// hold one `&DevTable` per kernel regardless of which file type they're
    /// about to touch.
    fn read(&self, devsw: &DevTable, dst: &mut [u8]) -> Result<usize> {
        if !self.readable {
            return Err(Error::InvalidArgument);
        }
        match &self.typ {
            FileType::Inode { ip, off } => {
                let cur = off.load(Ordering::Relaxed);
                let n = ip.read(cur, dst)?;
                off.fetch_add(n as u64, Ordering::Relaxed);
                Ok(n)
            }
            FileType::Device { ip, major } => {
                let minor = ip.minor();
                let dev = devsw.get(*major as usize).ok_or(Error::NotFound)?;
                dev.read(minor, dst)
            }
        }
    }

    fn write(&self, devsw: &DevTable, src: &[u8]) -> Result<usize> {
        if !self.writable {
            return Err(Error::InvalidArgument);
        }
        match &self.typ {
            FileType::Inode { ip, off } => {
                let cur = off.load(Ordering::Relaxed);
                let n = ip.write(cur, src)?;
                off.fetch_add(n as u64, Ordering::Relaxed);
                Ok(n)
            }
            FileType::Device { ip, major } => {
                let minor = ip.minor();
                let dev = devsw.get(*major as usize).ok_or(Error::NotFound)?;
                dev.write(minor, src)
            }
        }
    }
}

impl ArenaObject for File {
    fn finalize(&mut self) {}
}

pub fn new_ftable() -> ArrayArena<File> {
    ArrayArena::new("ftable", NFILE)
}

/// A refcounted open file description, usable independently of the
/// `ArrayArena` borrow that created it -- a process's open-file table
/// outlives any one syscall's stack frame.
pub struct RcFile {
    kernel: Arc<Kernel>,
    index: usize,
}

impl RcFile {
    pub fn alloc(kernel: &Arc<Kernel>, typ: FileType, readable: bool, writable: bool) -> Option<Self> {
        let index = kernel.ftable.find_or_alloc_index(|_| false, || File::new(typ, readable, writable))?;
        Some(Self { kernel: Arc::clone(kernel), index })
    }

    pub fn stat(&self) -> Stat {
        self.kernel.ftable.with(self.index, File::stat)
    }

    pub fn read(&self, dst: &mut [u8]) -> Result<usize> {
        self.kernel.ftable.with(self.index, |f| f.read(&self.kernel.devsw, dst))
    }

    pub fn write(&self, src: &[u8]) -> Result<usize> {
        self.kernel.ftable.with(self.index, |f| f.write(&self.kernel.devsw, src))
    }
}

impl Clone for RcFile {
    fn clone(&self) -> Self {
        self.kernel.ftable.bump(self.index);
        Self { kernel: Arc::clone(&self.kernel), index: self.index }
    }
}

impl Drop for RcFile {
    fn drop(&mut self) {
        self.kernel.ftable.drop_ref(self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errno::Error;
    use crate::fs::native::{self, NativeFs};
    use crate::fs::InodeType;
    use std::sync::Mutex;

    /// An in-memory stand-in for a character device (e.g. `/dev/null`-like
    /// sink), just enough to exercise `DevTable` dispatch.
    struct EchoDev {
        written: Mutex<Vec<u8>>,
    }

    impl DevSw for EchoDev {
        fn read(&self, _minor: u16, dst: &mut [u8]) -> Result<usize> {
            let written = self.written.lock().unwrap();
            let n = written.len().min(dst.len());
            dst[..n].copy_from_slice(&written[..n]);
            Ok(n)
        }

        fn write(&self, _minor: u16, src: &[u8]) -> Result<usize> {
            self.written.lock().unwrap().extend_from_slice(src);
            Ok(src.len())
        }

        fn stat(&self, minor: u16) -> crate::stat::DevStat {
            crate::stat::DevStat { minor, size: self.written.lock().unwrap().len() as u64 }
        }
    }

    fn test_kernel() -> Arc<Kernel> {
        Arc::new(Kernel::new())
    }

    #[test]
    fn devtable_register_and_dispatch() {
        let table = DevTable::new();
        assert!(table.get(1).is_none());
        table.register(1, Arc::new(EchoDev { written: Mutex::new(Vec::new()) }));
        let dev = table.get(1).expect("registered device");
        assert_eq!(dev.write(0, b"hi").unwrap(), 2);
        let mut buf = [0u8; 2];
        assert_eq!(dev.read(0, &mut buf).unwrap(), 2);
        assert_eq!(&buf, b"hi");
    }

    #[test]
    fn device_file_dispatches_through_devsw() {
        let kernel = test_kernel();
        kernel.devsw.register(3, Arc::new(EchoDev { written: Mutex::new(Vec::new()) }));

        let dev = kernel.devices.get_or_create_ide_device(0);
        native::format(&kernel, &dev, 2048, 200);
        let fs = NativeFs::mount(Arc::clone(&kernel), dev);
        let node = fs.root_inode().fs().ialloc(InodeType::Dev).unwrap();
        node.set_devnum(3, 7);

        let ip = VfsInode::Native(node);
        let typ = FileType::Device { ip, major: 3 };
        let file = RcFile::alloc(&kernel, typ, true, true).unwrap();
        assert_eq!(file.write(b"xyz").unwrap(), 3);
        let mut buf = [0u8; 3];
        assert_eq!(file.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"xyz");
    }

    #[test]
    fn unregistered_major_is_not_found() {
        let kernel = test_kernel();
        let dev = kernel.devices.get_or_create_ide_device(0);
        native::format(&kernel, &dev, 2048, 200);
        let fs = NativeFs::mount(Arc::clone(&kernel), dev);
        let node = fs.root_inode().fs().ialloc(InodeType::Dev).unwrap();
        node.set_devnum(9, 0);

        let ip = VfsInode::Native(node);
        let file = RcFile::alloc(&kernel, FileType::Device { ip, major: 9 }, true, true).unwrap();
        let mut buf = [0u8; 1];
        assert!(matches!(file.read(&mut buf), Err(Error::NotFound)));
    }
}
