//! File-system system calls (§6): argument checking and VFS calls, the
//! same division of labor as the donor's `sysfile.rs` -- minus argument
//! *fetching*, since there is no user/kernel address space split or trap
//! path here (§1). Each call instead takes already-validated Rust values
//! and a `&mut Process` standing in for "the calling process's open-file
//! table and current directory".

use std::sync::Arc;

use crate::errno::{Error, Result};
use crate::fcntl::Flags;
use crate::file::{FileType, RcFile};
use crate::fs::{FileName, InodeType, Path, Stat, VfsInode, VfsSuperblock};
use crate::kernel::Kernel;
use crate::mount::{Anchor, MountNamespace, Target};
use crate::param::NOFILE;
use crate::stat::DevStat;

pub use crate::fs::namex::{is_child_of, namei, nameiparent, nameimount, nameiparentmount};

/// Everything a running task needs to resolve paths and hold files open.
/// Stands in for the donor's `Proc` (whose scheduling/signal/memory fields
/// are out of scope, §1).
pub struct Process {
    pub kernel: Arc<Kernel>,
    pub ns: Arc<MountNamespace>,
    pub cwd: Anchor,
    open_files: Vec<Option<RcFile>>,
}

impl Process {
    pub fn new(kernel: Arc<Kernel>, ns: Arc<MountNamespace>, cwd: Anchor) -> Self {
        let mut open_files = Vec::with_capacity(NOFILE);
        open_files.resize_with(NOFILE, || None);
        Self { kernel, ns, cwd, open_files }
    }

    /// A namespace-sharing child, as after `fork` (no `unshare`).
    pub fn fork(&self) -> Self {
        Self::new(Arc::clone(&self.kernel), Arc::clone(&self.ns), self.cwd.clone())
    }

    fn fdalloc(&mut self, file: RcFile) -> Result<i32> {
        for (fd, slot) in self.open_files.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(file);
                return Ok(fd as i32);
            }
        }
        Err(Error::NoSpace)
    }

    fn getfd(&self, fd: i32) -> Result<&RcFile> {
        if fd < 0 || fd as usize >= NOFILE {
            return Err(Error::InvalidArgument);
        }
        self.open_files[fd as usize].as_ref().ok_or(Error::InvalidArgument)
    }
}

/// Creates `path` as `kind` if it doesn't already exist (reusing an
/// existing plain file/device for `T_FILE`, matching `open(O_CREATE)` on an
/// existing name), linking it into its parent directory and, for a fresh
/// directory, seeding `.`/`..`.
fn create(p: &mut Process, path: &Path, kind: InodeType, major: u16, minor: u16) -> Result<VfsInode> {
    let (parent, name) = nameiparent(&p.ns, &p.cwd, path)?;
    if let Ok(existing) = parent.ip.dirlookup(name) {
        if kind == InodeType::File && matches!(existing.kind(), InodeType::File | InodeType::Dev) {
            return Ok(existing);
        }
        return Err(Error::Exists);
    }

    let ip = parent.ip.ialloc(kind)?;
    if kind == InodeType::Dev {
        ip.set_devnum(major, minor);
    }

    if kind == InodeType::Dir {
        parent.ip.link();
        ip.dirlink(FileName::from_str(".").expect("\".\" is a valid name"), &ip)?;
        ip.dirlink(FileName::from_str("..").expect("\"..\" is a valid name"), &parent.ip)?;
    }
    parent.ip.dirlink(name, &ip)?;
    Ok(ip)
}

pub fn sys_open(p: &mut Process, path: &Path, flags: Flags) -> Result<i32> {
    let ip = if flags.contains(Flags::O_CREATE) {
        create(p, path, InodeType::File, 0, 0)?
    } else {
        let anchor = namei(&p.ns, &p.cwd, path)?;
        if anchor.ip.is_dir() && flags != Flags::O_RDONLY {
            return Err(Error::IsDir);
        }
        anchor.ip
    };

    let typ = if ip.kind() == InodeType::Dev {
        let major = ip.major();
        FileType::Device { major, ip }
    } else {
        FileType::Inode { ip, off: Default::default() }
    };
    let file = RcFile::alloc(&p.kernel, typ, flags.readable(), flags.writable()).ok_or(Error::NoSpace)?;
    p.fdalloc(file)
}

pub fn sys_close(p: &mut Process, fd: i32) -> Result<()> {
    let _ = p.getfd(fd)?;
    p.open_files[fd as usize] = None;
    Ok(())
}

pub fn sys_read(p: &mut Process, fd: i32, dst: &mut [u8]) -> Result<usize> {
    p.getfd(fd)?.read(dst)
}

pub fn sys_write(p: &mut Process, fd: i32, src: &[u8]) -> Result<usize> {
    p.getfd(fd)?.write(src)
}

pub fn sys_fstat(p: &mut Process, fd: i32) -> Result<Stat> {
    Ok(p.getfd(fd)?.stat())
}

pub fn sys_dup(p: &mut Process, fd: i32) -> Result<i32> {
    let file = p.getfd(fd)?.clone();
    p.fdalloc(file)
}

pub fn sys_mkdir(p: &mut Process, path: &Path) -> Result<()> {
    create(p, path, InodeType::Dir, 0, 0).map(|_| ())
}

pub fn sys_mknod(p: &mut Process, path: &Path, major: u16, minor: u16) -> Result<()> {
    create(p, path, InodeType::Dev, major, minor).map(|_| ())
}

pub fn sys_chdir(p: &mut Process, path: &Path) -> Result<()> {
    let anchor = namei(&p.ns, &p.cwd, path)?;
    if !anchor.ip.is_dir() {
        return Err(Error::NotDir);
    }
    p.cwd = anchor;
    Ok(())
}

/// Links `new` to the same inode as `old`. Both paths must resolve on the
/// same backend device (§3's inode invariants; a directory entry is a
/// `(name, inum)` pair meaningful only within one device's inode table).
pub fn sys_link(p: &mut Process, old: &Path, new: &Path) -> Result<()> {
    let target = namei(&p.ns, &p.cwd, old)?;
    if target.ip.is_dir() {
        return Err(Error::IsDir);
    }
    target.ip.link();

    let linked = (|| {
        let (parent, name) = nameiparent(&p.ns, &p.cwd, new)?;
        parent.ip.dirlink(name, &target.ip)
    })();
    if linked.is_err() {
        target.ip.unlink();
    }
    linked
}

pub fn sys_unlink(p: &mut Process, path: &Path) -> Result<()> {
    let (parent, name) = nameiparent(&p.ns, &p.cwd, path)?;
    if name.as_bytes() == b"." || name.as_bytes() == b".." {
        return Err(Error::InvalidArgument);
    }
    let target = parent.ip.dirlookup(name)?;
    if target.is_dir() && !target.isdirempty() {
        return Err(Error::NotEmpty);
    }
    parent.ip.dirunlink(name)?;
    if target.is_dir() {
        parent.ip.unlink();
    }
    target.unlink();
    Ok(())
}

pub fn sys_mount(p: &mut Process, target_path: &Path, sb: VfsSuperblock) -> Result<()> {
    let mountpoint = namei(&p.ns, &p.cwd, target_path)?;
    if !mountpoint.ip.is_dir() {
        return Err(Error::NotDir);
    }
    p.ns.mount(mountpoint.ip, &mountpoint.mnt, Target::Fs(sb)).map(|_| ())
}

pub fn sys_bind_mount(p: &mut Process, target_path: &Path, source_path: &Path) -> Result<()> {
    let mountpoint = namei(&p.ns, &p.cwd, target_path)?;
    let source = namei(&p.ns, &p.cwd, source_path)?;
    if !mountpoint.ip.is_dir() {
        return Err(Error::NotDir);
    }
    p.ns.mount(mountpoint.ip, &mountpoint.mnt, Target::Bind(source.ip)).map(|_| ())
}

pub fn sys_umount(p: &mut Process, path: &Path) -> Result<()> {
    let mnt = nameimount(&p.ns, &p.cwd, path)?;
    p.ns.umount(&mnt)
}

/// `unshare(MOUNT_NS)`: from this point on, mounts this process performs
/// are invisible to whoever it shared a namespace with before the call.
/// PID-namespace unsharing lives in the external process layer (§6), out
/// of scope here.
///
/// `cwd.mnt` is an `Arc<Mount>` from the *old* namespace; the copy builds
/// entirely fresh `Mount`s, so it must be relocated to its counterpart in
/// the new one rather than defaulting to the new root (only correct when
/// `cwd` happened to already be at the namespace root).
pub fn sys_unshare_mount_ns(p: &mut Process) {
    let (new_ns, remap) = p.ns.copy_active_mounts_remapping();
    let new_mnt = remap
        .into_iter()
        .find(|(old, _)| Arc::ptr_eq(old, &p.cwd.mnt))
        .map(|(_, new)| new)
        .expect("cwd.mnt missing from its own namespace's active mounts");
    p.ns = new_ns;
    p.cwd.mnt = new_mnt;
}

pub fn sys_pivot_root(p: &mut Process, new_root: &Path, put_old: &Path) -> Result<()> {
    let new_root = namei(&p.ns, &p.cwd, new_root)?;
    let put_old = namei(&p.ns, &p.cwd, put_old)?;
    p.ns.pivot_root(&new_root, &put_old)
}

pub fn register_devsw(kernel: &Arc<Kernel>, major: usize, dev: Arc<dyn crate::file::DevSw>) {
    kernel.devsw.register(major, dev);
}

pub fn devsw_stat(kernel: &Kernel, major: usize, minor: u16) -> Result<DevStat> {
    Ok(kernel.devsw.get(major).ok_or(Error::NotFound)?.stat(minor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::native::{self, NativeFs};

    fn test_process() -> Process {
        let kernel = Arc::new(Kernel::new());
        let dev = kernel.devices.get_or_create_ide_device(0);
        native::format(&kernel, &dev, 2048, 200);
        let fs = NativeFs::mount(Arc::clone(&kernel), dev);
        let ns = MountNamespace::new_root(VfsSuperblock::Native(fs));
        let cwd = Anchor { ip: ns.root_mount().root_inode(), mnt: ns.root_mount() };
        Process::new(kernel, ns, cwd)
    }

    #[test]
    fn open_create_write_read_roundtrips() {
        let mut p = test_process();
        let fd = sys_open(&mut p, Path::new("/f").unwrap(), Flags::O_CREATE | Flags::O_RDWR).unwrap();
        assert_eq!(sys_write(&mut p, fd, b"hello").unwrap(), 5);
        sys_close(&mut p, fd).unwrap();

        let fd = sys_open(&mut p, Path::new("/f").unwrap(), Flags::O_RDONLY).unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(sys_read(&mut p, fd, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn mkdir_then_chdir() {
        let mut p = test_process();
        sys_mkdir(&mut p, Path::new("/sub").unwrap()).unwrap();
        sys_chdir(&mut p, Path::new("/sub").unwrap()).unwrap();
        assert_eq!(p.cwd.ip.inum(), namei(&p.ns, &Anchor { ip: p.ns.root_mount().root_inode(), mnt: p.ns.root_mount() }, Path::new("sub").unwrap()).unwrap().ip.inum());
    }

    #[test]
    fn link_then_unlink() {
        let mut p = test_process();
        let fd = sys_open(&mut p, Path::new("/a").unwrap(), Flags::O_CREATE | Flags::O_RDWR).unwrap();
        sys_close(&mut p, fd).unwrap();
        sys_link(&mut p, Path::new("/a").unwrap(), Path::new("/b").unwrap()).unwrap();
        sys_unlink(&mut p, Path::new("/a").unwrap()).unwrap();
        assert!(sys_open(&mut p, Path::new("/b").unwrap(), Flags::O_RDONLY).is_ok());
        assert!(sys_open(&mut p, Path::new("/a").unwrap(), Flags::O_RDONLY).is_err());
    }

    #[test]
    fn unlink_nonempty_dir_fails() {
        let mut p = test_process();
        sys_mkdir(&mut p, Path::new("/d").unwrap()).unwrap();
        let fd = sys_open(&mut p, Path::new("/d/f").unwrap(), Flags::O_CREATE | Flags::O_RDWR).unwrap();
        sys_close(&mut p, fd).unwrap();
        assert!(matches!(sys_unlink(&mut p, Path::new("/d").unwrap()), Err(Error::NotEmpty)));
    }

    #[test]
    fn unshare_mount_ns_keeps_cwd_on_its_own_mount() {
        let mut p = test_process();
        sys_mkdir(&mut p, Path::new("/sub").unwrap()).unwrap();
        sys_chdir(&mut p, Path::new("/sub").unwrap()).unwrap();
        let cwd_inum_before = p.cwd.ip.inum();
        let old_root_inum = p.ns.root_mount().root_inode().inum();

        sys_unshare_mount_ns(&mut p);

        assert_eq!(p.cwd.ip.inum(), cwd_inum_before);
        assert_eq!(p.cwd.mnt.root_inode().inum(), old_root_inum);
        assert!(Arc::ptr_eq(&p.cwd.mnt, &p.ns.root_mount()));
    }

    #[test]
    fn mount_then_umount_roundtrips() {
        use crate::fs::objfs::ObjFs;

        let mut p = test_process();
        sys_mkdir(&mut p, Path::new("/mnt").unwrap()).unwrap();

        let obj_dev = p.kernel.devices.create_obj_device();
        let obj_fs = ObjFs::mount(Arc::clone(&p.kernel), obj_dev);
        sys_mount(&mut p, Path::new("/mnt").unwrap(), VfsSuperblock::Obj(obj_fs)).unwrap();

        let fd = sys_open(&mut p, Path::new("/mnt/f").unwrap(), Flags::O_CREATE | Flags::O_RDWR).unwrap();
        sys_write(&mut p, fd, b"obj").unwrap();
        sys_close(&mut p, fd).unwrap();

        // The mountpoint directory on the underlying native fs is still
        // empty -- the write went to the mounted objfs, not `/mnt`.
        let fd = sys_open(&mut p, Path::new("/mnt/f").unwrap(), Flags::O_RDONLY).unwrap();
        sys_close(&mut p, fd).unwrap();

        sys_umount(&mut p, Path::new("/mnt").unwrap()).unwrap();
        assert!(sys_open(&mut p, Path::new("/mnt/f").unwrap(), Flags::O_RDONLY).is_err());
    }

    #[test]
    fn umount_fails_while_referenced() {
        use crate::fs::objfs::ObjFs;

        let mut p = test_process();
        sys_mkdir(&mut p, Path::new("/mnt").unwrap()).unwrap();
        let obj_dev = p.kernel.devices.create_obj_device();
        let obj_fs = ObjFs::mount(Arc::clone(&p.kernel), obj_dev);
        sys_mount(&mut p, Path::new("/mnt").unwrap(), VfsSuperblock::Obj(obj_fs)).unwrap();

        let held = nameimount(&p.ns, &p.cwd, Path::new("/mnt").unwrap()).unwrap();
        assert!(matches!(sys_umount(&mut p, Path::new("/mnt").unwrap()), Err(Error::Busy)));
        drop(held);
        sys_umount(&mut p, Path::new("/mnt").unwrap()).unwrap();
    }

    #[test]
    fn pivot_root_swaps_namespace_root() {
        use crate::fs::objfs::ObjFs;

        let mut p = test_process();
        sys_mkdir(&mut p, Path::new("/newroot").unwrap()).unwrap();

        // pivot_root requires the new root to itself be a mount's root
        // inode, not merely a directory on the current root fs.
        let obj_dev = p.kernel.devices.create_obj_device();
        let obj_fs = ObjFs::mount(Arc::clone(&p.kernel), obj_dev);
        let new_root_inum = obj_fs.root_inode().inum();
        sys_mount(&mut p, Path::new("/newroot").unwrap(), VfsSuperblock::Obj(obj_fs)).unwrap();
        sys_mkdir(&mut p, Path::new("/newroot/oldroot").unwrap()).unwrap();

        sys_pivot_root(&mut p, Path::new("/newroot").unwrap(), Path::new("/newroot/oldroot").unwrap()).unwrap();

        assert_eq!(p.ns.root_mount().root_inode().inum(), new_root_inum);
    }

    #[test]
    fn dup_shares_the_same_offset() {
        let mut p = test_process();
        let fd = sys_open(&mut p, Path::new("/f").unwrap(), Flags::O_CREATE | Flags::O_RDWR).unwrap();
        sys_write(&mut p, fd, b"xy").unwrap();
        let fd2 = sys_dup(&mut p, fd).unwrap();
        // `dup` clones the same open file description, so fd2's cursor is
        // already past the two bytes fd just wrote.
        let mut buf = [0u8; 2];
        assert_eq!(sys_read(&mut p, fd2, &mut buf).unwrap(), 0);
    }
}
