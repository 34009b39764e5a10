//! Native filesystem (§4.3): blocks -> inodes -> dirents -> paths on top
//! of the buffer cache and write-ahead log.
//!
//! Disk layout, adapted from the donor's `fs/superblock.rs`:
//! `[boot | super | log | inodes | bitmap | data]`. `format` below plays
//! the donor's host-side `mkfs` tool's role of laying out a blank image --
//! that tool itself is out of scope, but something has to build the
//! layout this module reads, and a library entry point is the natural
//! substitute for a standalone binary here.

pub mod log;

use std::mem::size_of;
use std::sync::{Arc, Weak};

use zerocopy::{AsBytes, FromBytes};

use crate::bio::{BufId, Hint};
use crate::device::Device;
use crate::errno::{Error, Result};
use crate::fs::{FileName, InodeType, Stat};
use crate::kernel::Kernel;
use crate::lock::{Sleeplock, Spinlock};
use crate::param::{BSIZE, DIRSIZ, NINODE};

use log::Log;

pub const NDIRECT: usize = 12;
pub const NINDIRECT: usize = BSIZE / 4;
pub const MAXFILE: usize = NDIRECT + NINDIRECT;
pub const ROOTINO: u32 = 1;
const FSMAGIC: u32 = 0x10203040;

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

#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct RawSuperblock {
    magic: u32,
    /// Size of the filesystem image, in blocks.
    pub size: u32,
    /// Number of data blocks.
    nblocks: u32,
    /// Number of inodes.
    pub ninodes: u32,
    /// Number of log blocks.
    pub nlog: u32,
    /// Block number of the first log block.
    pub logstart: u32,
    /// Block number of the first inode block.
    inodestart: u32,
    /// Block number of the first free-bitmap block.
    bmapstart: u32,
}

/// Inodes per block.
pub const IPB: usize = BSIZE / size_of::<RawDinode>();
/// Bitmap bits per block.
pub const BPB: u32 = (BSIZE * 8) as u32;

impl RawSuperblock {
    const fn iblock(&self, inum: u32) -> u32 {
        inum / IPB as u32 + self.inodestart
    }

    const fn bblock(&self, b: u32) -> u32 {
        b / BPB + self.bmapstart
    }
}

#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
struct RawDinode {
    kind: i16,
    major: i16,
    minor: i16,
    nlink: i16,
    size: u32,
    addrs: [u32; NDIRECT + 1],
}

impl RawDinode {
    const fn unused() -> Self {
        Self {
            kind: T_UNUSED,
            major: 0,
            minor: 0,
            nlink: 0,
            size: 0,
            addrs: [0; NDIRECT + 1],
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
struct RawDirent {
    inum: u16,
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

/// Builds the on-disk layout for a blank device: a superblock, an empty
/// log, zeroed inode blocks, a free bitmap with the meta blocks marked
/// used, and a root directory inode with `.`/`..` entries.
pub fn format(kernel: &Kernel, dev: &Device, total_blocks: u32, ninodes: u32) -> RawSuperblock {
    let ninodeblocks = ninodes as usize / IPB + 1;
    let nlog = crate::param::LOGSIZE as u32 + 1;
    let nmeta = 2 + nlog + ninodeblocks as u32; // boot + super + log + inodes
    let nbitmap = total_blocks / BPB + 1;
    let inodestart = 2 + nlog;
    let bmapstart = inodestart + ninodeblocks as u32;
    let nblocks = total_blocks - nmeta - nbitmap;

    let sb = RawSuperblock {
        magic: FSMAGIC,
        size: total_blocks,
        nblocks,
        ninodes,
        nlog,
        logstart: 2,
        inodestart,
        bmapstart,
    };

    {
        let mut buf = kernel.bcache.get(dev.id, BufId::Block(1), Hint::Default);
        buf[..size_of::<RawSuperblock>()].copy_from_slice(sb.as_bytes());
        buf.mark_valid();
        kernel.devices.bwrite(dev, &buf);
    }
    for b in inodestart..bmapstart {
        let mut buf = kernel.bcache.get(dev.id, BufId::Block(b), Hint::Default);
        buf.iter_mut().for_each(|x| *x = 0);
        buf.mark_valid();
        kernel.devices.bwrite(dev, &buf);
    }
    for b in bmapstart..bmapstart + nbitmap {
        let mut buf = kernel.bcache.get(dev.id, BufId::Block(b), Hint::Default);
        buf.iter_mut().for_each(|x| *x = 0);
        buf.mark_valid();
        kernel.devices.bwrite(dev, &buf);
    }
    // Mark every meta block used so `balloc` never hands one out.
    for b in 0..bmapstart + nbitmap {
        mark_bit(kernel, dev, &sb, b, true);
    }

    // Root directory, inode ROOTINO, with "." and ".." entries.
    let mut root = RawDinode::unused();
    root.kind = T_DIR;
    root.nlink = 1;
    write_dinode(kernel, dev, &sb, ROOTINO, &root);
    format_append_dirent(kernel, dev, &sb, &mut root, ROOTINO, b".", ROOTINO);
    format_append_dirent(kernel, dev, &sb, &mut root, ROOTINO, b"..", ROOTINO);
    sb
}

fn mark_bit(kernel: &Kernel, dev: &Device, sb: &RawSuperblock, b: u32, used: bool) {
    let block = sb.bblock(b);
    let mut buf = kernel.devices.bread(&kernel.bcache, dev, block);
    let byte = (b % BPB) as usize / 8;
    let mask = 1u8 << ((b % BPB) as usize % 8);
    if used {
        buf[byte] |= mask;
    } else {
        buf[byte] &= !mask;
    }
    kernel.devices.bwrite(dev, &buf);
}

fn write_dinode(kernel: &Kernel, dev: &Device, sb: &RawSuperblock, inum: u32, dinode: &RawDinode) {
    let block = sb.iblock(inum);
    let mut buf = kernel.devices.bread(&kernel.bcache, dev, block);
    let off = (inum as usize % IPB) * size_of::<RawDinode>();
    buf[off..off + size_of::<RawDinode>()].copy_from_slice(dinode.as_bytes());
    kernel.devices.bwrite(dev, &buf);
}

fn format_append_dirent(
    kernel: &Kernel,
    dev: &Device,
    sb: &RawSuperblock,
    dir: &mut RawDinode,
    dir_inum: u32,
    name: &[u8],
    target: u32,
) {
    let mut entry = RawDirent::free();
    entry.inum = target as u16;
    entry.name[..name.len()].copy_from_slice(name);
    let off = dir.size as usize;
    let blockno = format_bmap(kernel, dev, sb, dir, off / BSIZE);
    let mut buf = kernel.devices.bread(&kernel.bcache, dev, blockno);
    let inblock = off % BSIZE;
    buf[inblock..inblock + DIRENT_SIZE].copy_from_slice(entry.as_bytes());
    kernel.devices.bwrite(dev, &buf);
    dir.size += DIRENT_SIZE as u32;
    write_dinode(kernel, dev, sb, dir_inum, dir);
}

/// `format`'s own tiny direct-block allocator; runs before the log or
/// inode cache exist, so it cannot reuse `NativeFs::bmap`.
fn format_bmap(kernel: &Kernel, dev: &Device, sb: &RawSuperblock, dir: &mut RawDinode, bn: usize) -> u32 {
    assert!(bn < NDIRECT, "format_bmap: only direct blocks supported");
    if dir.addrs[bn] == 0 {
        dir.addrs[bn] = format_balloc(kernel, dev, sb);
    }
    dir.addrs[bn]
}

fn format_balloc(kernel: &Kernel, dev: &Device, sb: &RawSuperblock) -> u32 {
    for b in 0..sb.size {
        let block = sb.bblock(b);
        let buf = kernel.devices.bread(&kernel.bcache, dev, block);
        let byte = (b % BPB) as usize / 8;
        let mask = 1u8 << ((b % BPB) as usize % 8);
        let free = buf[byte] & mask == 0;
        drop(buf);
        if free {
            mark_bit(kernel, dev, sb, b, true);
            let mut data = kernel.devices.bread(&kernel.bcache, dev, b);
            data.iter_mut().for_each(|x| *x = 0);
            kernel.devices.bwrite(dev, &data);
            return b;
        }
    }
    panic!("format_balloc: out of blocks");
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
    size: u32,
    addrs: [u32; NDIRECT + 1],
}

impl InodeMeta {
    const fn unused() -> Self {
        Self {
            valid: false,
            kind: T_UNUSED,
            major: 0,
            minor: 0,
            nlink: 0,
            size: 0,
            addrs: [0; NDIRECT + 1],
        }
    }
}

/// In-memory inode cache: same content-lock/bookkeeping-lock split as
/// `bio::Bcache`, since loading an inode's metadata (`ilock`) must hold a
/// sleeplock across multiple buffer-cache calls while the cache's own
/// refcount bookkeeping stays under a short spinlock.
struct Itable {
    content: Vec<Sleeplock<InodeMeta>>,
    shared: Spinlock<Vec<CacheSlot>>,
}

impl Itable {
    fn new() -> Self {
        let mut content = Vec::with_capacity(NINODE);
        content.resize_with(NINODE, || Sleeplock::new("inode", InodeMeta::unused()));
        Self {
            content,
            shared: Spinlock::new("itable", vec![CacheSlot::unused(); NINODE]),
        }
    }

    /// Finds `(dev, inum)` in the cache, bumping its refcount, or claims a
    /// free slot. Does not touch disk; the returned slot may be `!valid`.
    fn iget(&self, dev: u32, inum: u32) -> usize {
        let mut slots = self.shared.lock();
        if let Some(i) = slots.iter().position(|s| s.refcnt > 0 && s.dev == dev && s.inum == inum) {
            slots[i].refcnt += 1;
            return i;
        }
        let i = slots
            .iter()
            .position(|s| s.refcnt == 0)
            .unwrap_or_else(|| panic!("itable: no free inodes ({} in use)", NINODE));
        slots[i] = CacheSlot { dev, inum, refcnt: 1 };
        drop(slots);
        self.content[i].lock().valid = false;
        i
    }

    fn bump(&self, index: usize) {
        self.shared.lock()[index].refcnt += 1;
    }
}

/// A mounted native filesystem instance.
pub struct NativeFs {
    pub kernel: Arc<Kernel>,
    pub dev: Arc<Device>,
    self_weak: Weak<NativeFs>,
    sb: RawSuperblock,
    log: Log,
    itable: Itable,
}

impl NativeFs {
    /// Reads the on-disk superblock and starts the log (§4.3/§4.4). The
    /// device must already have been laid out by `format` (or an
    /// equivalent external tool).
    pub fn mount(kernel: Arc<Kernel>, dev: Arc<Device>) -> Arc<Self> {
        let sb = Self::read_superblock(&kernel, &dev);
        let log = Log::new(&kernel, &dev, sb.logstart);
        Arc::new_cyclic(|weak| Self {
            kernel,
            dev,
            self_weak: weak.clone(),
            sb,
            log,
            itable: Itable::new(),
        })
    }

    fn read_superblock(kernel: &Kernel, dev: &Device) -> RawSuperblock {
        let buf = kernel.devices.bread(&kernel.bcache, dev, 1);
        let sb = RawSuperblock::read_from(&buf[..size_of::<RawSuperblock>()])
            .expect("superblock does not fit in one block");
        assert_eq!(sb.magic, FSMAGIC, "native fs: bad superblock magic");
        sb
    }

    fn handle(&self) -> Arc<NativeFs> {
        self.self_weak.upgrade().expect("native fs dropped while an inode referenced it")
    }

    pub fn root_inode(&self) -> RcInode {
        self.iget(ROOTINO)
    }

    pub fn begin_tx(&self) -> Tx<'_> {
        Tx::new(self)
    }

    fn iget(&self, inum: u32) -> RcInode {
        let index = self.itable.iget(self.dev.id, inum);
        RcInode { fs: self.handle(), index }
    }

    /// Reads `ip`'s metadata from disk on first access.
    fn ilock<'s>(&self, ip: &'s RcInode) -> crate::lock::SleeplockGuard<'s, InodeMeta> {
        let mut guard = self.itable.content[ip.index].lock();
        if !guard.valid {
            let inum = self.itable.shared.lock()[ip.index].inum;
            let block = self.sb.iblock(inum);
            let buf = self.kernel.devices.bread(&self.kernel.bcache, &self.dev, block);
            let off = (inum as usize % IPB) * size_of::<RawDinode>();
            let dinode = RawDinode::read_from(&buf[off..off + size_of::<RawDinode>()])
                .expect("dinode does not fit in one block");
            drop(buf);
            assert_ne!(dinode.kind, T_UNUSED, "ilock: inode {} has no type", inum);
            guard.kind = dinode.kind;
            guard.major = dinode.major;
            guard.minor = dinode.minor;
            guard.nlink = dinode.nlink;
            guard.size = dinode.size;
            guard.addrs = dinode.addrs;
            guard.valid = true;
        }
        guard
    }

    /// Writes `ip`'s in-memory metadata back to its disk inode block,
    /// through the log.
    fn iupdate(&self, ip: &RcInode, meta: &InodeMeta) {
        let tx = self.begin_tx();
        let inum = self.itable.shared.lock()[ip.index].inum;
        let block = self.sb.iblock(inum);
        let mut buf = self.kernel.devices.bread(&self.kernel.bcache, &self.dev, block);
        let off = (inum as usize % IPB) * size_of::<RawDinode>();
        let dinode = RawDinode {
            kind: meta.kind,
            major: meta.major,
            minor: meta.minor,
            nlink: meta.nlink,
            size: meta.size,
            addrs: meta.addrs,
        };
        buf[off..off + size_of::<RawDinode>()].copy_from_slice(dinode.as_bytes());
        tx.log_write(&buf);
        drop(tx);
    }

    fn balloc(&self, tx: &Tx<'_>) -> u32 {
        for b in 0..self.sb.size {
            let block = self.sb.bblock(b);
            let mut buf = self.kernel.devices.bread(&self.kernel.bcache, &self.dev, block);
            let byte = (b % BPB) as usize / 8;
            let mask = 1u8 << ((b % BPB) as usize % 8);
            if buf[byte] & mask == 0 {
                buf[byte] |= mask;
                tx.log_write(&buf);
                drop(buf);
                let mut data = self.kernel.bcache.get(self.dev.id, BufId::Block(b), Hint::Default);
                data.iter_mut().for_each(|x| *x = 0);
                data.mark_valid();
                tx.log_write(&data);
                return b;
            }
        }
        panic!("balloc: out of blocks");
    }

    fn bfree(&self, tx: &Tx<'_>, b: u32) {
        let block = self.sb.bblock(b);
        let mut buf = self.kernel.devices.bread(&self.kernel.bcache, &self.dev, block);
        let byte = (b % BPB) as usize / 8;
        let mask = 1u8 << ((b % BPB) as usize % 8);
        assert!(buf[byte] & mask != 0, "bfree: freeing free block {}", b);
        buf[byte] &= !mask;
        tx.log_write(&buf);
    }

    /// Allocates a fresh inode of `kind` and returns an unlocked handle
    /// with refcount 1.
    pub fn ialloc(&self, kind: InodeType) -> Result<RcInode> {
        let tx = self.begin_tx();
        for inum in ROOTINO..self.sb.ninodes {
            let block = self.sb.iblock(inum);
            let mut buf = self.kernel.devices.bread(&self.kernel.bcache, &self.dev, block);
            let off = (inum as usize % IPB) * size_of::<RawDinode>();
            let existing = RawDinode::read_from(&buf[off..off + size_of::<RawDinode>()]).unwrap();
            if existing.kind == T_UNUSED {
                let mut fresh = RawDinode::unused();
                fresh.kind = kind_to_raw(kind);
                buf[off..off + size_of::<RawDinode>()].copy_from_slice(fresh.as_bytes());
                tx.log_write(&buf);
                drop(buf);
                return Ok(self.iget(inum));
            }
        }
        Err(Error::NoSpace)
    }

    fn bmap(&self, tx: &Tx<'_>, meta: &mut InodeMeta, bn: usize) -> u32 {
        if bn < NDIRECT {
            if meta.addrs[bn] == 0 {
                meta.addrs[bn] = self.balloc(tx);
            }
            return meta.addrs[bn];
        }
        let bn = bn - NDIRECT;
        assert!(bn < NINDIRECT, "bmap: offset out of range");
        if meta.addrs[NDIRECT] == 0 {
            meta.addrs[NDIRECT] = self.balloc(tx);
        }
        let indirect_block = meta.addrs[NDIRECT];
        let mut ind = self.kernel.devices.bread(&self.kernel.bcache, &self.dev, indirect_block);
        let off = bn * 4;
        let mut addr = u32::from_ne_bytes(ind[off..off + 4].try_into().unwrap());
        if addr == 0 {
            addr = self.balloc(tx);
            ind[off..off + 4].copy_from_slice(&addr.to_ne_bytes());
            tx.log_write(&ind);
        }
        addr
    }

    fn read_meta(&self, ip: &RcInode) -> Stat {
        let guard = self.ilock(ip);
        let inum = self.itable.shared.lock()[ip.index].inum;
        Stat {
            dev: self.dev.id,
            ino: inum,
            kind: raw_to_kind(guard.kind),
            nlink: guard.nlink,
            size: guard.size as u64,
        }
    }
}

/// RAII guard for a native-fs write-ahead transaction: `begin_op` on
/// construction, `end_op` on drop, mirroring the donor's scope-based
/// `Tx` guard.
pub struct Tx<'a> {
    fs: &'a NativeFs,
}

impl<'a> Tx<'a> {
    fn new(fs: &'a NativeFs) -> Self {
        fs.log.begin_op();
        Self { fs }
    }

    fn log_write(&self, buf: &crate::bio::Buf<'_>) {
        self.fs.log.log_write(buf);
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        self.fs.log.end_op(&self.fs.kernel, &self.fs.dev);
    }
}

/// A refcounted handle to a cached native-fs inode.
pub struct RcInode {
    fs: Arc<NativeFs>,
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
    /// `iput` (§4.3): if this inode was unlinked (`nlink == 0`) and this
    /// is the last live reference, truncates its data and marks the disk
    /// inode free before the cache slot itself is released.
    fn drop(&mut self) {
        let mut guard = self.fs.itable.content[self.index].lock();
        if guard.valid && guard.nlink == 0 {
            let refs = self.fs.itable.shared.lock()[self.index].refcnt;
            if refs == 1 {
                self.itrunc(&mut guard);
                guard.kind = T_UNUSED;
                self.fs.iupdate(self, &guard);
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
    fn itrunc(&self, meta: &mut InodeMeta) {
        let tx = self.fs.begin_tx();
        for addr in meta.addrs[..NDIRECT].iter_mut() {
            if *addr != 0 {
                self.fs.bfree(&tx, *addr);
                *addr = 0;
            }
        }
        if meta.addrs[NDIRECT] != 0 {
            let ind = self.fs.kernel.devices.bread(&self.fs.kernel.bcache, &self.fs.dev, meta.addrs[NDIRECT]);
            for i in 0..NINDIRECT {
                let off = i * 4;
                let addr = u32::from_ne_bytes(ind[off..off + 4].try_into().unwrap());
                if addr != 0 {
                    self.fs.bfree(&tx, addr);
                }
            }
            drop(ind);
            self.fs.bfree(&tx, meta.addrs[NDIRECT]);
            meta.addrs[NDIRECT] = 0;
        }
        meta.size = 0;
    }

    pub fn fs(&self) -> &Arc<NativeFs> {
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

    /// Bounds-checked read through the direct/indirect block map
    /// (§4.3). Device (`T_DEV`) inodes are not modeled here -- devsw
    /// dispatch is an external-collaborator interface (§10.5) this crate
    /// does not implement.
    pub fn read(&self, off: u64, dst: &mut [u8]) -> Result<usize> {
        let guard = self.fs.ilock(self);
        let off = off as u32;
        if off > guard.size {
            return Ok(0);
        }
        let n = std::cmp::min(dst.len() as u32, guard.size - off) as usize;
        let mut done = 0usize;
        while done < n {
            let cur_off = off as usize + done;
            let blockno = self.fs.bmap_ro(&guard, cur_off / BSIZE);
            let buf = self.fs.kernel.devices.bread(&self.fs.kernel.bcache, &self.fs.dev, blockno);
            let inblock = cur_off % BSIZE;
            let take = std::cmp::min(n - done, BSIZE - inblock);
            dst[done..done + take].copy_from_slice(&buf[inblock..inblock + take]);
            done += take;
        }
        Ok(n)
    }

    /// Writes through the log, allocating blocks on demand and bumping
    /// `size` when the write extends past the current end of file.
    pub fn write(&self, off: u64, src: &[u8]) -> Result<usize> {
        let off = off as u32;
        if off as usize + src.len() > MAXFILE * BSIZE {
            return Err(Error::TooLarge);
        }
        let tx = self.fs.begin_tx();
        let mut guard = self.fs.ilock(self);
        let mut done = 0usize;
        while done < src.len() {
            let cur_off = off as usize + done;
            let blockno = self.fs.bmap(&tx, &mut guard, cur_off / BSIZE);
            let mut buf = self.fs.kernel.devices.bread(&self.fs.kernel.bcache, &self.fs.dev, blockno);
            let inblock = cur_off % BSIZE;
            let take = std::cmp::min(src.len() - done, BSIZE - inblock);
            buf[inblock..inblock + take].copy_from_slice(&src[done..done + take]);
            tx.log_write(&buf);
            done += take;
        }
        if off + src.len() as u32 > guard.size {
            guard.size = off + src.len() as u32;
        }
        self.fs.iupdate(self, &guard);
        Ok(done)
    }

    pub fn dirlookup(&self, name: &FileName) -> Result<RcInode> {
        let guard = self.fs.ilock(self);
        assert_eq!(guard.kind, T_DIR, "dirlookup: not a directory");
        let mut off = 0u32;
        while off < guard.size {
            let blockno = self.fs.bmap_ro(&guard, off as usize / BSIZE);
            let buf = self.fs.kernel.devices.bread(&self.fs.kernel.bcache, &self.fs.dev, blockno);
            let inblock = off as usize % BSIZE;
            let entry = RawDirent::read_from(&buf[inblock..inblock + DIRENT_SIZE]).unwrap();
            if entry.inum != 0 && namecmp(&entry.name, name.as_bytes()) {
                drop(buf);
                return Ok(self.fs.iget(entry.inum as u32));
            }
            off += DIRENT_SIZE as u32;
        }
        Err(Error::NotFound)
    }

    /// Links `name -> child.inum()` into this directory: rejects a
    /// duplicate name, otherwise reuses the first free slot or appends.
    pub fn dirlink(&self, name: &FileName, child: &RcInode) -> Result<()> {
        if self.dirlookup(name).is_ok() {
            return Err(Error::Exists);
        }
        let tx = self.fs.begin_tx();
        let mut guard = self.fs.ilock(self);
        assert_eq!(guard.kind, T_DIR, "dirlink: not a directory");

        let mut off = 0u32;
        let mut free_off = None;
        while off < guard.size {
            let blockno = self.fs.bmap(&tx, &mut guard, off as usize / BSIZE);
            let buf = self.fs.kernel.devices.bread(&self.fs.kernel.bcache, &self.fs.dev, blockno);
            let inblock = off as usize % BSIZE;
            let entry = RawDirent::read_from(&buf[inblock..inblock + DIRENT_SIZE]).unwrap();
            if entry.inum == 0 {
                free_off = Some(off);
                break;
            }
            off += DIRENT_SIZE as u32;
        }
        let off = free_off.unwrap_or(guard.size);

        let mut entry = RawDirent::free();
        entry.inum = child.inum() as u16;
        let bytes = name.as_bytes();
        entry.name[..bytes.len()].copy_from_slice(bytes);

        let blockno = self.fs.bmap(&tx, &mut guard, off as usize / BSIZE);
        let mut buf = self.fs.kernel.devices.bread(&self.fs.kernel.bcache, &self.fs.dev, blockno);
        let inblock = off as usize % BSIZE;
        buf[inblock..inblock + DIRENT_SIZE].copy_from_slice(entry.as_bytes());
        tx.log_write(&buf);

        if off >= guard.size {
            guard.size = off + DIRENT_SIZE as u32;
        }
        self.fs.iupdate(self, &guard);
        Ok(())
    }

    /// Clears the directory entry named `name`, freeing its slot for reuse
    /// by a later `dirlink`. Does not touch the target inode's link count;
    /// callers (`syscall::sys_unlink`) adjust that separately.
    pub fn dirunlink(&self, name: &FileName) -> Result<()> {
        let tx = self.fs.begin_tx();
        let guard = self.fs.ilock(self);
        assert_eq!(guard.kind, T_DIR, "dirunlink: not a directory");

        let mut off = 0u32;
        while off < guard.size {
            let blockno = self.fs.bmap_ro(&guard, off as usize / BSIZE);
            let mut buf = self.fs.kernel.devices.bread(&self.fs.kernel.bcache, &self.fs.dev, blockno);
            let inblock = off as usize % BSIZE;
            let entry = RawDirent::read_from(&buf[inblock..inblock + DIRENT_SIZE]).unwrap();
            if entry.inum != 0 && namecmp(&entry.name, name.as_bytes()) {
                let empty = RawDirent::free();
                buf[inblock..inblock + DIRENT_SIZE].copy_from_slice(empty.as_bytes());
                tx.log_write(&buf);
                return Ok(());
            }
            off += DIRENT_SIZE as u32;
        }
        Err(Error::NotFound)
    }

    pub fn isdirempty(&self) -> bool {
        let guard = self.fs.ilock(self);
        let mut off = 2 * DIRENT_SIZE as u32; // skip "." and ".."
        while off < guard.size {
            let blockno = self.fs.bmap_ro(&guard, off as usize / BSIZE);
            let buf = self.fs.kernel.devices.bread(&self.fs.kernel.bcache, &self.fs.dev, blockno);
            let inblock = off as usize % BSIZE;
            let entry = RawDirent::read_from(&buf[inblock..inblock + DIRENT_SIZE]).unwrap();
            if entry.inum != 0 {
                return false;
            }
            off += DIRENT_SIZE as u32;
        }
        true
    }
}

impl NativeFs {
    /// Read-only `bmap`: used by lookups that must not allocate.
    /// Returns 0 (never a valid data block) for holes.
    fn bmap_ro(&self, meta: &InodeMeta, bn: usize) -> u32 {
        if bn < NDIRECT {
            return meta.addrs[bn];
        }
        let bn = bn - NDIRECT;
        assert!(bn < NINDIRECT, "bmap: offset out of range");
        if meta.addrs[NDIRECT] == 0 {
            return 0;
        }
        let ind = self.kernel.devices.bread(&self.kernel.bcache, &self.dev, meta.addrs[NDIRECT]);
        let off = bn * 4;
        u32::from_ne_bytes(ind[off..off + 4].try_into().unwrap())
    }
}

/// Bounded 14-byte comparison: a name exactly `DIRSIZ` bytes long has no
/// terminator on disk, so comparisons must not read past it (§9 open
/// questions).
fn namecmp(raw: &[u8; DIRSIZ], name: &[u8]) -> bool {
    if name.len() > DIRSIZ {
        return false;
    }
    &raw[..name.len()] == name && raw[name.len()..].iter().all(|&b| b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceBackend;

    const TEST_BLOCKS: u32 = 2048;
    const TEST_INODES: u32 = 200;

    fn test_fs() -> Arc<NativeFs> {
        let kernel = Arc::new(Kernel::new());
        let dev = kernel.devices.get_or_create_ide_device(0);
        format(&kernel, &dev, TEST_BLOCKS, TEST_INODES);
        NativeFs::mount(kernel, dev)
    }

    #[test]
    fn root_inode_is_a_directory_with_dot_entries() {
        let fs = test_fs();
        let root = fs.root_inode();
        assert_eq!(root.kind(), InodeType::Dir);
        let dot = root.dirlookup(FileName::from_str(".").unwrap()).unwrap();
        assert_eq!(dot.inum(), ROOTINO);
    }

    #[test]
    fn write_then_read_roundtrips() {
        let fs = test_fs();
        let root = fs.root_inode();
        let file = root.fs().ialloc(InodeType::File).unwrap();
        let data = [b'a'; 100].repeat(5);
        let n = file.write(0, &data).unwrap();
        assert_eq!(n, data.len());
        let mut out = vec![0u8; data.len()];
        let r = file.read(0, &mut out).unwrap();
        assert_eq!(r, data.len());
        assert_eq!(out, data);
    }

    #[test]
    fn write_spanning_indirect_blocks() {
        let fs = test_fs();
        let root = fs.root_inode();
        let file = root.fs().ialloc(InodeType::File).unwrap();
        let data = vec![7u8; BSIZE * (NDIRECT + 3)];
        file.write(0, &data).unwrap();
        let mut out = vec![0u8; data.len()];
        file.read(0, &mut out).unwrap();
        assert_eq!(out, data);
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
    fn unlink_last_reference_truncates_and_frees_inode() {
        let fs = test_fs();
        let root = fs.root_inode();
        let inum;
        {
            let file = root.fs().ialloc(InodeType::File).unwrap();
            inum = file.inum();
            file.write(0, &vec![1u8; BSIZE * 2]).unwrap();
            file.adjust_nlink(1);
            root.dirlink(FileName::from_str("f").unwrap(), &file).unwrap();
            file.adjust_nlink(-1);
        }
        // After the last RcInode handle is dropped, the inode should be
        // freed and reusable.
        let again = root.fs().ialloc(InodeType::File).unwrap();
        assert_eq!(again.inum(), inum);
    }

    #[test]
    fn isdirempty_true_for_fresh_directory() {
        let fs = test_fs();
        let root = fs.root_inode();
        let dir = root.fs().ialloc(InodeType::Dir).unwrap();
        dir.dirlink(FileName::from_str(".").unwrap(), &dir).unwrap();
        assert!(dir.isdirempty());
        root.dirlink(FileName::from_str("sub").unwrap(), &dir).unwrap();
        assert!(!dir.isdirempty());
    }
}
