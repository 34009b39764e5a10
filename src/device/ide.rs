//! Block storage behind IDE and loop devices.
//!
//! The real IDE/virtio disk driver is out of scope (§1): this crate only
//! needs "given a buffer, move its data between cache and backing
//! storage" (component #3 in the leaves-first order). `RamDisk` is the
//! in-memory stand-in used for IDE devices in this hosted, testable core
//! -- the same substitution the donor's `test` feature and the original
//! C project's `tests/host` tree make for exercising the filesystem
//! without real hardware. Loop devices back onto an arbitrary
//! `BackingFile`; `fs::native` supplies the implementation that backs a
//! loop device onto a VFS inode (a file in another, outer filesystem).

use std::sync::Mutex;

use crate::param::BSIZE;

/// Backing storage for an IDE or loop device: read/write fixed-size
/// blocks by block number.
pub trait BackingFile: Send + Sync {
    fn read_block(&self, blockno: u32, buf: &mut [u8; BSIZE]);
    fn write_block(&self, blockno: u32, buf: &[u8; BSIZE]);
}

/// In-memory simulated disk, grown on demand. Stands in for a real IDE
/// disk in this hosted core.
pub struct RamDisk {
    blocks: Mutex<Vec<[u8; BSIZE]>>,
}

impl RamDisk {
    pub fn new(nblocks: usize) -> Self {
        Self {
            blocks: Mutex::new(vec![[0u8; BSIZE]; nblocks]),
        }
    }
}

impl BackingFile for RamDisk {
    fn read_block(&self, blockno: u32, buf: &mut [u8; BSIZE]) {
        let blocks = self.blocks.lock().unwrap();
        buf.copy_from_slice(&blocks[blockno as usize]);
    }

    fn write_block(&self, blockno: u32, buf: &[u8; BSIZE]) {
        let mut blocks = self.blocks.lock().unwrap();
        blocks[blockno as usize].copy_from_slice(buf);
    }
}
