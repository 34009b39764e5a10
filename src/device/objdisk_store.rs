//! The object disk (§4.5): byte-addressed storage for named,
//! variable-length objects, backing an obj device. Sits one layer below
//! the object cache (`fs::objfs::cache`), which is the thing that
//! actually knows about block-sized slices and buffer cache keys -- this
//! store only knows about whole objects and raw bytes.
//!
//! The donor kernel has no equivalent of this (its `fs/ufs`/`fs/lfs` are
//! both block-device filesystems); this module is grounded directly in
//! the spec's own description of the original project's object store,
//! reimplemented as a plain in-memory structure rather than a literal
//! byte-for-byte on-disk layout, matching this crate's general
//! substitution of `RamDisk`/`std::sync` primitives for real hardware
//! and the donor's pinned/branded machinery (§9).

use crate::errno::{Error, Result};
use crate::lock::Sleeplock;
use crate::param::{MAX_OBJECTS, MAX_OBJECT_NAME_LENGTH, STORAGE_DEVICE_SIZE};

/// Object name, reserved names excepted. Names longer than
/// `MAX_OBJECT_NAME_LENGTH` are rejected by `add_object`.
pub type ObjectName = Vec<u8>;

/// Reserved: never a valid argument to `add_object`/`write_object`.
pub const SUPERBLOCK_NAME: &[u8] = b"#superblock";
/// Reserved: never a valid argument to `add_object`/`write_object`.
pub const TABLE_NAME: &[u8] = b"#table";

#[derive(Clone)]
struct TableEntry {
    name: ObjectName,
    disk_offset: usize,
    size: usize,
    occupied: bool,
}

impl TableEntry {
    fn end(&self) -> usize {
        self.disk_offset + self.size
    }
}

struct Inner {
    /// Offset of the first byte available for object bodies. Grows
    /// (shrinking the free region) only when `find_empty_space` needs to
    /// make room for a bigger table.
    store_offset: usize,
    bytes_occupied: usize,
    last_inode: u32,
    table: Vec<TableEntry>,
    /// Flat body storage; `store[offset - store_offset .. ]` holds an
    /// object's bytes. Indexed directly by absolute offset for
    /// simplicity, sized to the full device.
    store: Vec<u8>,
}

/// An in-memory object disk of size `STORAGE_DEVICE_SIZE`.
pub struct ObjDiskStore {
    inner: Sleeplock<Inner>,
}

fn names_equal(a: &[u8], b: &[u8]) -> bool {
    let n = MAX_OBJECT_NAME_LENGTH.min(a.len()).min(b.len());
    a.len() == b.len() && a[..n] == b[..n]
}

impl ObjDiskStore {
    pub fn new() -> Self {
        Self {
            inner: Sleeplock::new(
                "objdisk",
                Inner {
                    store_offset: 0,
                    bytes_occupied: 0,
                    last_inode: 0,
                    table: Vec::new(),
                    store: vec![0u8; STORAGE_DEVICE_SIZE],
                },
            ),
        }
    }

    /// Monotonic per-device inode number allocator, persisted in the
    /// conceptual superblock.
    pub fn new_inode_number(&self) -> u32 {
        let mut inner = self.inner.lock();
        inner.last_inode += 1;
        inner.last_inode
    }

    pub fn add_object(&self, name: &[u8], data: &[u8]) -> Result<()> {
        if name.is_empty()
            || name.len() > MAX_OBJECT_NAME_LENGTH
            || names_equal(name, SUPERBLOCK_NAME)
            || names_equal(name, TABLE_NAME)
        {
            return Err(Error::InvalidArgument);
        }
        let size = data.len();
        let mut inner = self.inner.lock();
        if inner.table.iter().any(|e| e.occupied && names_equal(&e.name, name)) {
            return Err(Error::Exists);
        }

        let slot = inner.table.iter().position(|e| !e.occupied);
        let offset = Self::find_empty_space(&mut inner, size)?;

        inner.store[offset..offset + size].copy_from_slice(data);
        inner.bytes_occupied += size;
        let entry = TableEntry {
            name: name.to_vec(),
            disk_offset: offset,
            size,
            occupied: true,
        };
        match slot {
            Some(i) => inner.table[i] = entry,
            None => inner.table.push(entry),
        }
        Ok(())
    }

    pub fn write_object(&self, name: &[u8], data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        let i = inner
            .table
            .iter()
            .position(|e| e.occupied && names_equal(&e.name, name))
            .ok_or(Error::NotFound)?;

        let old_size = inner.table[i].size;
        let new_size = data.len();
        if new_size <= old_size {
            let offset = inner.table[i].disk_offset;
            inner.store[offset..offset + new_size].copy_from_slice(data);
            inner.bytes_occupied -= old_size - new_size;
            inner.table[i].size = new_size;
            return Ok(());
        }

        inner.table[i].occupied = false;
        inner.bytes_occupied -= old_size;
        let offset = match Self::find_empty_space(&mut inner, new_size) {
            Ok(offset) => offset,
            Err(e) => {
                // restore, the write failed
                inner.table[i].occupied = true;
                inner.bytes_occupied += old_size;
                return Err(e);
            }
        };
        inner.store[offset..offset + new_size].copy_from_slice(data);
        inner.bytes_occupied += new_size;
        inner.table[i].disk_offset = offset;
        inner.table[i].size = new_size;
        inner.table[i].occupied = true;
        Ok(())
    }

    pub fn delete_object(&self, name: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        let i = inner
            .table
            .iter()
            .position(|e| e.occupied && names_equal(&e.name, name))
            .ok_or(Error::NotFound)?;
        inner.table[i].occupied = false;
        inner.bytes_occupied -= inner.table[i].size;
        Ok(())
    }

    /// Copies `name`'s body into a freshly allocated buffer.
    pub fn get_object(&self, name: &[u8]) -> Result<Vec<u8>> {
        let inner = self.inner.lock();
        let e = inner
            .table
            .iter()
            .find(|e| e.occupied && names_equal(&e.name, name))
            .ok_or(Error::NotFound)?;
        Ok(inner.store[e.disk_offset..e.disk_offset + e.size].to_vec())
    }

    pub fn object_size(&self, name: &[u8]) -> Result<usize> {
        let inner = self.inner.lock();
        inner
            .table
            .iter()
            .find(|e| e.occupied && names_equal(&e.name, name))
            .map(|e| e.size)
            .ok_or(Error::NotFound)
    }

    /// Implements the allocator described in §4.5. Takes `inner` by
    /// `&mut` reference (rather than `&mut self`) since `write_object`
    /// needs to call it while already holding the lock.
    fn find_empty_space(inner: &mut Inner, size: usize) -> Result<usize> {
        if inner.table.len() >= MAX_OBJECTS {
            return Err(Error::NoSpace);
        }

        let mut occupied: Vec<&TableEntry> = inner.table.iter().filter(|e| e.occupied).collect();
        occupied.sort_by_key(|e| e.disk_offset);

        // 1 & 2: tail fit.
        let tail_start = occupied.last().map_or(inner.store_offset, |e| e.end());
        if STORAGE_DEVICE_SIZE - tail_start >= size {
            return Ok(tail_start);
        }

        // 3: gap fit between adjacent occupied entries, rightmost match wins.
        let mut best: Option<usize> = None;
        for pair in occupied.windows(2) {
            let gap_start = pair[0].end();
            let gap_end = pair[1].disk_offset;
            if gap_end.saturating_sub(gap_start) >= size {
                best = Some(gap_start);
            }
        }
        if let Some(offset) = best {
            return Ok(offset);
        }

        // 4: shrink the table region into the last entry's slot, if free.
        if let Some(last) = inner.table.last() {
            if !last.occupied && last.size >= size && inner.store_offset <= last.disk_offset {
                let offset = last.disk_offset;
                inner.store_offset = offset;
                return Ok(offset);
            }
        }

        Err(Error::NoSpace)
    }
}

impl Default for ObjDiskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_get_roundtrip() {
        let store = ObjDiskStore::new();
        store.add_object(b"alpha", b"hello world").unwrap();
        assert_eq!(store.get_object(b"alpha").unwrap(), b"hello world");
    }

    #[test]
    fn duplicate_name_rejected() {
        let store = ObjDiskStore::new();
        store.add_object(b"alpha", b"one").unwrap();
        assert!(matches!(store.add_object(b"alpha", b"two"), Err(Error::Exists)));
    }

    #[test]
    fn reserved_names_rejected() {
        let store = ObjDiskStore::new();
        assert!(store.add_object(SUPERBLOCK_NAME, b"x").is_err());
        assert!(store.add_object(TABLE_NAME, b"x").is_err());
    }

    #[test]
    fn write_grow_moves_body_write_shrink_stays_in_place() {
        let store = ObjDiskStore::new();
        store.add_object(b"a", &[1u8; 16]).unwrap();
        store.write_object(b"a", &[2u8; 8]).unwrap();
        assert_eq!(store.get_object(b"a").unwrap(), vec![2u8; 8]);
        store.write_object(b"a", &[3u8; 64]).unwrap();
        assert_eq!(store.get_object(b"a").unwrap(), vec![3u8; 64]);
    }

    #[test]
    fn delete_then_reuse_name() {
        let store = ObjDiskStore::new();
        store.add_object(b"a", b"first").unwrap();
        store.delete_object(b"a").unwrap();
        assert!(store.get_object(b"a").is_err());
        store.add_object(b"a", b"second").unwrap();
        assert_eq!(store.get_object(b"a").unwrap(), b"second");
    }

    #[test]
    fn inode_numbers_are_monotonic() {
        let store = ObjDiskStore::new();
        let a = store.new_inode_number();
        let b = store.new_inode_number();
        assert_eq!(b, a + 1);
    }
}
