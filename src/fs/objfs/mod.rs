//! Object filesystem (§4.7): inodes and directories stored as named,
//! variable-length objects on an obj device rather than as blocks on a
//! block device. Mirrors `fs::native`'s inode-cache/RcInode shape, but
//! has no block map or write-ahead log of its own -- durability and
//! slicing are the object cache's job (`cache.rs`), and a "write" here
//! is just a read-merge-write-through of the whole backing object.

pub mod cache;

use std::mem::size_of;
use std::sync::{Arc, Weak};

use zerocopy::{AsBytes, FromBytes};

use crate::device::Device;
use crate::errno::{Error, Result};
use crate::fs::{FileName, InodeType, Stat};
use crate::kernel::Kernel;
use crate::lock::{Sleeplock, Spinlock};
use crate::param::{DIRSIZ, MAX_INODE_OBJECT_DATA, MAX_OBJECT_NAME_LENGTH, NINODE, OBJ_ROOTINO};

use cache::ObjectCache;

const T_UNUSED: i16 = 0;
const T_DIR: i16 = 1;
const T_FILE: i16 = 2;
const T_DEV: i16 = 3;

fn kind_to_raw(kind: InodeType) -> i16 {
    match kind {
        InodeType::Dir => T_DIR,
        InodeType::File => T_FILE,
        InodeType::Dev => T_DEV,
    }
}

fn raw_to_kind(raw: i16) -> InodeType {
    match raw {
        T_DIR => InodeType::Dir,
        T_DEV => InodeType::Dev,
        _ => InodeType::File,
    }
}

/// Encodes `inum` into 5 bytes, none of them zero, ported from the
/// original project's `inode_name`/`file_name` (both use this identical
/// inner loop). The original appends a NUL to terminate a C string; this
/// crate carries object names as length-delimited `Vec<u8>` instead, so
/// that terminator is dropped.
fn encode_inum(mut inum: u32) -> [u8; 5] {
    let mut out = [0u8; 5];
    for slot in out.iter_mut() {
        *slot = (inum % 127 + 128) as u8;
        inum /= 127;
    }
    out
}

/// Object name for an inode's metadata (type/links/data-object-name).
fn inode_object_name(inum: u32) -> Vec<u8> {
    let mut name = b"inode".to_vec();
    name.extend_from_slice(&encode_inum(inum));
    name
}

/// Object name for an inode's data (file bytes, or packed dirents).
fn file_object_name(inum: u32) -> Vec<u8> {
    encode_inum(inum).to_vec()
}

#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
struct RawObjDinode {
    kind: i16,
    major: i16,
    minor: i16,
    nlink: i16,
    data_object_name: [u8; MAX_OBJECT_NAME_LENGTH],
}

fn pack_object_name(name: &[u8]) -> [u8; MAX_OBJECT_NAME_LENGTH] {
    assert!(name.len() <= MAX_OBJECT_NAME_LENGTH, "object name too long");
    let mut out = [0u8; MAX_OBJECT_NAME_LENGTH];
    out[..name.len()].copy_from_slice(name);
    out
}

fn unpack_object_name(raw: &[u8; MAX_OBJECT_NAME_LENGTH]) -> Vec<u8> {
    let len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    raw[..len].to_vec()
}

#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
struct RawDirent {
    inum: u32,
    name: [u8; DIRSIZ],
}

const DIRENT_SIZE: usize = size_of::<RawDirent>();

impl RawDirent {
    const fn free() -> Self {
        Self {
            inum: 0,
            name: [0; DIRSIZ],
        }
    }
}

#[derive(Clone, Copy)]
struct CacheSlot {
    dev: u32,
    inum: u32,
    refcnt: usize,
}

impl CacheSlot {
    const fn unused() -> Self {
        Self {
            dev: 0,
            inum: 0,
            refcnt: 0,
        }
    }
}

struct InodeMeta {
    valid: bool,
    kind: i16,
    major: i16,
    minor: i16,
    nlink: i16,
    data_object_name: Vec<u8>,
}

impl InodeMeta {
    fn unused() -> Self {
        Self {
            valid: false,
            kind: T_UNUSED,
            major: 0,
            minor: 0,
            nlink: 0,
            data_object_name: Vec::new(),
        }
    }
}

/// In-memory inode cache, same content-lock/bookkeeping-lock split as
/// `fs::native`'s `Itable` (and `bio::Bcache`).
struct Itable {
    content: Vec<Sleeplock<InodeMeta>>,
    shared: Spinlock<Vec<CacheSlot>>,
}

impl Itable {
    fn new() -> Self {
        let mut content = Vec::with_capacity(NINODE);
        content.resize_with(NINODE, || Sleeplock::new("obj inode", InodeMeta::unused()));
        Self {
            content,
            shared: Spinlock::new("obj itable", vec![CacheSlot::unused(); NINODE]),
        }
    }

    fn iget(&self, dev: u32, inum: u32) -> usize {
        let mut slots = self.shared.lock();
        if let Some(i) = slots.iter().position(|s| s.refcnt > 0 && s.dev == dev && s.inum == inum) {
            slots[i].refcnt += 1;
            return i;
        }
        let i = slots
            .iter()
            .position(|s| s.refcnt == 0)
            .unwrap_or_else(|| panic!("obj itable: no free inodes ({} in use)", NINODE));
        slots[i] = CacheSlot { dev, inum, refcnt: 1 };
        drop(slots);
        self.content[i].lock().valid = false;
        i
    }

    fn bump(&self, index: usize) {
        self.shared.lock()[index].refcnt += 1;
    }
}

/// A mounted object filesystem instance.
pub struct ObjFs {
    pub kernel: Arc<Kernel>,
    pub dev: Arc<Device>,
    self_weak: Weak<ObjFs>,
    cache: ObjectCache,
    itable: Itable,
}

impl ObjFs {
    /// Mounts an obj device, formatting it with a fresh root directory
    /// object if it has never been initialized (no "inode1" object yet).
    pub fn mount(kernel: Arc<Kernel>, dev: Arc<Device>) -> Arc<Self> {
        let fs = Arc::new_cyclic(|weak| Self {
            kernel,
            dev,
            self_weak: weak.clone(),
            cache: ObjectCache::new(),
            itable: Itable::new(),
        });
        fs.init_root();
        fs
    }

    fn handle(&self) -> Arc<ObjFs> {
        self.self_weak.upgrade().expect("obj fs dropped while an inode referenced it")
    }

    fn init_root(&self) {
        let dinode_name = inode_object_name(OBJ_ROOTINO);
        if self.cache.object_size(&self.dev, &dinode_name).is_ok() {
            return;
        }
        let inum = self.dev.as_obj_store().new_inode_number();
        assert_eq!(inum, OBJ_ROOTINO, "objfs: root must be the first inode allocated on a fresh device");

        let data_name = file_object_name(inum);
        self.cache.add(&self.kernel, &self.dev, &data_name, &[]).expect("objfs: root data object");
        let dinode = RawObjDinode {
            kind: T_DIR,
            major: 0,
            minor: 0,
            nlink: 1,
            data_object_name: pack_object_name(&data_name),
        };
        self.cache
            .add(&self.kernel, &self.dev, &dinode_name, dinode.as_bytes())
            .expect("objfs: root dinode object");

        let root = self.iget(OBJ_ROOTINO);
        root.dirlink_raw(b".", OBJ_ROOTINO);
        root.dirlink_raw(b"..", OBJ_ROOTINO);
    }

    pub fn root_inode(&self) -> RcInode {
        self.iget(OBJ_ROOTINO)
    }

    fn iget(&self, inum: u32) -> RcInode {
        let index = self.itable.iget(self.dev.id, inum);
        RcInode { fs: self.handle(), index }
    }

    /// Allocates a fresh inode of `kind`. Files and directories get a new
    /// empty data object; device inodes name no data object at all (§3).
    pub fn ialloc(&self, kind: InodeType) -> Result<RcInode> {
        let inum = self.dev.as_obj_store().new_inode_number();
        let data_object_name = if kind == InodeType::Dev {
            [0u8; MAX_OBJECT_NAME_LENGTH]
        } else {
            let data_name = file_object_name(inum);
            self.cache.add(&self.kernel, &self.dev, &data_name, &[])?;
            pack_object_name(&data_name)
        };
        let dinode = RawObjDinode {
            kind: kind_to_raw(kind),
            major: 0,
            minor: 0,
            nlink: 0,
            data_object_name,
        };
        let dinode_name = inode_object_name(inum);
        self.cache.add(&self.kernel, &self.dev, &dinode_name, dinode.as_bytes())?;
        Ok(self.iget(inum))
    }

    /// Loads `ip`'s dinode object on first access.
    fn ilock<'s>(&self, ip: &'s RcInode) -> crate::lock::SleeplockGuard<'s, InodeMeta> {
        let mut guard = self.itable.content[ip.index].lock();
        if !guard.valid {
            let inum = self.itable.shared.lock()[ip.index].inum;
            let dinode_name = inode_object_name(inum);
            let mut bytes = [0u8; size_of::<RawObjDinode>()];
            self.cache
                .read(&self.kernel, &self.dev, &dinode_name, &mut bytes, 0)
                .unwrap_or_else(|e| panic!("ilock: inode {} has no dinode object ({:?})", inum, e));
            let dinode = RawObjDinode::read_from(&bytes[..]).expect("dinode does not fit");
            assert_ne!(dinode.kind, T_UNUSED, "ilock: inode {} has no type", inum);
            guard.kind = dinode.kind;
            guard.major = dinode.major;
            guard.minor = dinode.minor;
            guard.nlink = dinode.nlink;
            guard.data_object_name = unpack_object_name(&dinode.data_object_name);
            guard.valid = true;
        }
        guard
    }

    fn iupdate(&self, ip: &RcInode, meta: &InodeMeta) {
        let inum = self.itable.shared.lock()[ip.index].inum;
        let dinode = RawObjDinode {
            kind: meta.kind,
            major: meta.major,
            minor: meta.minor,
            nlink: meta.nlink,
            data_object_name: pack_object_name(&meta.data_object_name),
        };
        let dinode_name = inode_object_name(inum);
        self.cache
            .write(&self.kernel, &self.dev, &dinode_name, dinode.as_bytes(), 0)
            .expect("iupdate: dinode write");
    }

    fn read_meta(&self, ip: &RcInode) -> Stat {
        let guard = self.ilock(ip);
        let inum = self.itable.shared.lock()[ip.index].inum;
        let size = self
            .cache
            .object_size(&self.dev, &guard.data_object_name)
            .unwrap_or(0);
        Stat {
            dev: self.dev.id,
            ino: inum,
            kind: raw_to_kind(guard.kind),
            nlink: guard.nlink,
            size: size as u64,
        }
    }
}

/// A refcounted handle to a cached objfs inode.
pub struct RcInode {
    fs: Arc<ObjFs>,
    index: usize,
}

impl Clone for RcInode {
    fn clone(&self) -> Self {
        self.fs.itable.bump(self.index);
        Self {
            fs: Arc::clone(&self.fs),
            index: self.index,
        }
    }
}

impl Drop for RcInode {
    /// Object-disk equivalent of `iput`: when unlinked and this is the
    /// last live reference, deletes both the data and dinode objects
    /// instead of truncating blocks in place.
    fn drop(&mut self) {
        let mut guard = self.fs.itable.content[self.index].lock();
        if guard.valid && guard.nlink == 0 {
            let refs = self.fs.itable.shared.lock()[self.index].refcnt;
            if refs == 1 {
                let inum = self.fs.itable.shared.lock()[self.index].inum;
                let _ = self.fs.cache.delete(&self.fs.kernel, &self.fs.dev, &guard.data_object_name);
                let _ = self.fs.cache.delete(&self.fs.kernel, &self.fs.dev, &inode_object_name(inum));
                guard.kind = T_UNUSED;
                guard.valid = false;
            }
        }
        drop(guard);

        let mut slots = self.fs.itable.shared.lock();
        slots[self.index].refcnt -= 1;
        if slots[self.index].refcnt == 0 {
            slots[self.index] = CacheSlot::unused();
        }
    }
}

impl RcInode {
    pub fn fs(&self) -> &Arc<ObjFs> {
        &self.fs
    }

    pub fn dev(&self) -> u32 {
        self.fs.dev.id
    }

    pub fn inum(&self) -> u32 {
        self.fs.itable.shared.lock()[self.index].inum
    }

    pub fn kind(&self) -> InodeType {
        raw_to_kind(self.fs.ilock(self).kind)
    }

    pub fn major(&self) -> u16 {
        self.fs.ilock(self).major as u16
    }

    pub fn minor(&self) -> u16 {
        self.fs.ilock(self).minor as u16
    }

    pub fn stat(&self) -> Stat {
        self.fs.read_meta(self)
    }

    pub fn adjust_nlink(&self, delta: i16) {
        let mut guard = self.fs.ilock(self);
        guard.nlink += delta;
        self.fs.iupdate(self, &guard);
    }

    /// Sets the major/minor pair a `T_DEV` inode dispatches through.
    pub fn set_devnum(&self, major: u16, minor: u16) {
        let mut guard = self.fs.ilock(self);
        guard.major = major as i16;
        guard.minor = minor as i16;
        self.fs.iupdate(self, &guard);
    }

    pub fn read(&self, off: u64, dst: &mut [u8]) -> Result<usize> {
        let guard = self.fs.ilock(self);
        self.fs.cache.read(&self.fs.kernel, &self.fs.dev, &guard.data_object_name, dst, off as usize)
    }

    /// Writes through to the backing data object. Bounds-checked against
    /// the per-inode object size cap (§3 objfs notes).
    pub fn write(&self, off: u64, src: &[u8]) -> Result<usize> {
        if off as usize + src.len() > MAX_INODE_OBJECT_DATA {
            return Err(Error::TooLarge);
        }
        let guard = self.fs.ilock(self);
        self.fs
            .cache
            .write(&self.fs.kernel, &self.fs.dev, &guard.data_object_name, src, off as usize)?;
        Ok(src.len())
    }

    fn data_size(&self, guard: &InodeMeta) -> usize {
        self.fs.cache.object_size(&self.fs.dev, &guard.data_object_name).unwrap_or(0)
    }

    pub fn dirlookup(&self, name: &FileName) -> Result<RcInode> {
        let guard = self.fs.ilock(self);
        assert_eq!(guard.kind, T_DIR, "dirlookup: not a directory");
        let size = self.data_size(&guard);
        let mut off = 0usize;
        let mut buf = [0u8; DIRENT_SIZE];
        while off < size {
            self.fs
                .cache
                .read(&self.fs.kernel, &self.fs.dev, &guard.data_object_name, &mut buf, off)?;
            let entry = RawDirent::read_from(&buf[..]).unwrap();
            if entry.inum != 0 && namecmp(&entry.name, name.as_bytes()) {
                return Ok(self.fs.iget(entry.inum));
            }
            off += DIRENT_SIZE;
        }
        Err(Error::NotFound)
    }

    /// Used only by `ObjFs::init_root` to seed "." and ".." before the
    /// root inode has any other directory entries to look up against.
    fn dirlink_raw(&self, name: &[u8], target: u32) {
        let guard = self.fs.ilock(self);
        let size = self.data_size(&guard);
        let mut entry = RawDirent::free();
        entry.inum = target;
        entry.name[..name.len()].copy_from_slice(name);
        self.fs
            .cache
            .write(&self.fs.kernel, &self.fs.dev, &guard.data_object_name, entry.as_bytes(), size)
            .expect("dirlink_raw: write");
    }

    pub fn dirlink(&self, name: &FileName, child: &RcInode) -> Result<()> {
        if self.dirlookup(name).is_ok() {
            return Err(Error::Exists);
        }
        let guard = self.fs.ilock(self);
        assert_eq!(guard.kind, T_DIR, "dirlink: not a directory");
        let size = self.data_size(&guard);

        let mut off = 0usize;
        let mut buf = [0u8; DIRENT_SIZE];
        let mut free_off = None;
        while off < size {
            self.fs
                .cache
                .read(&self.fs.kernel, &self.fs.dev, &guard.data_object_name, &mut buf, off)?;
            let entry = RawDirent::read_from(&buf[..]).unwrap();
            if entry.inum == 0 {
                free_off = Some(off);
                break;
            }
            off += DIRENT_SIZE;
        }
        let off = free_off.unwrap_or(size);

        let mut entry = RawDirent::free();
        entry.inum = child.inum();
        let bytes = name.as_bytes();
        entry.name[..bytes.len()].copy_from_slice(bytes);
        self.fs
            .cache
            .write(&self.fs.kernel, &self.fs.dev, &guard.data_object_name, entry.as_bytes(), off)?;
        Ok(())
    }

    /// Clears the directory entry named `name`, freeing its slot for reuse
    /// by a later `dirlink`. Does not touch the target inode's link count.
    pub fn dirunlink(&self, name: &FileName) -> Result<()> {
        let guard = self.fs.ilock(self);
        assert_eq!(guard.kind, T_DIR, "dirunlink: not a directory");
        let size = self.data_size(&guard);

        let mut off = 0usize;
        let mut buf = [0u8; DIRENT_SIZE];
        while off < size {
            self.fs
                .cache
                .read(&self.fs.kernel, &self.fs.dev, &guard.data_object_name, &mut buf, off)?;
            let entry = RawDirent::read_from(&buf[..]).unwrap();
            if entry.inum != 0 && namecmp(&entry.name, name.as_bytes()) {
                let empty = RawDirent::free();
                self.fs
                    .cache
                    .write(&self.fs.kernel, &self.fs.dev, &guard.data_object_name, empty.as_bytes(), off)?;
                return Ok(());
            }
            off += DIRENT_SIZE;
        }
        Err(Error::NotFound)
    }

    pub fn isdirempty(&self) -> bool {
        let guard = self.fs.ilock(self);
        let size = self.data_size(&guard);
        let mut off = 2 * DIRENT_SIZE; // skip "." and ".."
        let mut buf = [0u8; DIRENT_SIZE];
        while off < size {
            if self
                .fs
                .cache
                .read(&self.fs.kernel, &self.fs.dev, &guard.data_object_name, &mut buf, off)
                .is_err()
            {
                return true;
            }
            let entry = RawDirent::read_from(&buf[..]).unwrap();
            if entry.inum != 0 {
                return false;
            }
            off += DIRENT_SIZE;
        }
        true
    }
}

/// Bounded 14-byte comparison, same no-terminator-assumed discipline as
/// `fs::native::namecmp`.
fn namecmp(raw: &[u8; DIRSIZ], name: &[u8]) -> bool {
    if name.len() > DIRSIZ {
        return false;
    }
    &raw[..name.len()] == name && raw[name.len()..].iter().all(|&b| b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_fs() -> Arc<ObjFs> {
        let kernel = Arc::new(Kernel::new());
        let dev = kernel.devices.create_obj_device();
        ObjFs::mount(kernel, dev)
    }

    #[test]
    fn inum_encoding_never_produces_a_zero_byte() {
        for inum in [0u32, 1, 126, 127, 128, 1_000_000, u32::MAX] {
            assert!(encode_inum(inum).iter().all(|&b| b != 0));
        }
    }

    #[test]
    fn inode_name_carries_the_inode_prefix() {
        let name = inode_object_name(42);
        assert_eq!(&name[..5], b"inode");
        assert_eq!(name.len(), 10);
        assert_eq!(&name[5..], &file_object_name(42)[..]);
    }

    #[test]
    fn root_inode_is_a_directory_with_dot_entries() {
        let fs = test_fs();
        let root = fs.root_inode();
        assert_eq!(root.kind(), InodeType::Dir);
        let dot = root.dirlookup(FileName::from_str(".").unwrap()).unwrap();
        assert_eq!(dot.inum(), OBJ_ROOTINO);
    }

    #[test]
    fn remounting_an_initialized_device_does_not_reformat() {
        let kernel = Arc::new(Kernel::new());
        let dev = kernel.devices.create_obj_device();
        let fs1 = ObjFs::mount(Arc::clone(&kernel), Arc::clone(&dev));
        let file = fs1.root_inode().fs().ialloc(InodeType::File).unwrap();
        file.write(0, b"hi").unwrap();
        let inum = file.inum();
        drop(file);
        drop(fs1);

        let fs2 = ObjFs::mount(kernel, dev);
        let mut out = [0u8; 2];
        let again = fs2.iget(inum);
        again.read(0, &mut out).unwrap();
        assert_eq!(&out, b"hi");
    }

    #[test]
    fn write_then_read_roundtrips() {
        let fs = test_fs();
        let file = fs.root_inode().fs().ialloc(InodeType::File).unwrap();
        file.write(0, b"hello object world").unwrap();
        let mut out = [0u8; 19];
        let n = file.read(0, &mut out).unwrap();
        assert_eq!(n, 19);
        assert_eq!(&out, b"hello object world");
    }

    #[test]
    fn dirlink_then_dirlookup_finds_child() {
        let fs = test_fs();
        let root = fs.root_inode();
        let child = root.fs().ialloc(InodeType::File).unwrap();
        root.dirlink(FileName::from_str("hello").unwrap(), &child).unwrap();
        let found = root.dirlookup(FileName::from_str("hello").unwrap()).unwrap();
        assert_eq!(found.inum(), child.inum());
    }

    #[test]
    fn dirlink_rejects_duplicate_name() {
        let fs = test_fs();
        let root = fs.root_inode();
        let a = root.fs().ialloc(InodeType::File).unwrap();
        let b = root.fs().ialloc(InodeType::File).unwrap();
        root.dirlink(FileName::from_str("x").unwrap(), &a).unwrap();
        assert!(root.dirlink(FileName::from_str("x").unwrap(), &b).is_err());
    }

    #[test]
    fn unlink_last_reference_frees_objects() {
        let fs = test_fs();
        let root = fs.root_inode();
        let inum;
        {
            let file = root.fs().ialloc(InodeType::File).unwrap();
            inum = file.inum();
            file.write(0, b"temp").unwrap();
            file.adjust_nlink(1);
            root.dirlink(FileName::from_str("f").unwrap(), &file).unwrap();
            file.adjust_nlink(-1);
        }
        assert!(fs.cache.object_size(&fs.dev, &inode_object_name(inum)).is_err());
        assert!(fs.cache.object_size(&fs.dev, &file_object_name(inum)).is_err());
    }

    #[test]
    fn isdirempty_true_for_fresh_directory() {
        let fs = test_fs();
        let root = fs.root_inode();
        let dir = root.fs().ialloc(InodeType::Dir).unwrap();
        dir.dirlink_raw(b".", dir.inum());
        assert!(dir.isdirempty());
        root.dirlink(FileName::from_str("sub").unwrap(), &dir).unwrap();
        assert!(!dir.isdirempty());
    }
}
