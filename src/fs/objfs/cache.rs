//! Object cache (§4.6): sits between objfs and the object disk, slicing
//! variable-length objects into `BSIZE` chunks memoized in the shared
//! buffer cache under `BufId::Object(name, block_index)` keys. All
//! exported operations assume the caller already holds the object's
//! inode sleeplock, same discipline as the donor's `bio.rs` assumes for
//! buffers.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::bio::{BufId, Hint};
use crate::device::Device;
use crate::errno::Result;
use crate::kernel::Kernel;
use crate::param::{BSIZE, OBJ_CACHE_BLOCKS_PADDING};

pub struct ObjectCache {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ObjectCache {
    pub fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Creates `name` on the object disk and primes the cache with its
    /// initial contents.
    pub fn add(&self, kernel: &Kernel, dev: &Device, name: &[u8], data: &[u8]) -> Result<()> {
        dev.as_obj_store().add_object(name, data)?;
        for (b, chunk) in data.chunks(BSIZE).enumerate() {
            let mut buf = kernel.bcache.get(dev.id, BufId::Object(name.to_vec(), b as u32), Hint::Default);
            buf[..chunk.len()].copy_from_slice(chunk);
            buf.mark_valid();
        }
        Ok(())
    }

    /// Overwrites `name[offset..offset+data.len()]`, growing the object
    /// if the write extends past its current size. Write-through: the
    /// object disk is updated before the cache buffers are.
    pub fn write(&self, kernel: &Kernel, dev: &Device, name: &[u8], data: &[u8], offset: usize) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let old_size = dev.as_obj_store().object_size(name)?;
        let new_size = std::cmp::max(old_size, offset + data.len());
        let mut body = dev.as_obj_store().get_object(name)?;
        if body.len() < new_size {
            body.resize(new_size, 0);
        }
        body[offset..offset + data.len()].copy_from_slice(data);
        dev.as_obj_store().write_object(name, &body)?;

        let first_block = offset / BSIZE;
        let last_block = (offset + data.len() - 1) / BSIZE;
        for b in first_block..=last_block {
            let mut buf = kernel.bcache.get(dev.id, BufId::Object(name.to_vec(), b as u32), Hint::Default);
            let start = b * BSIZE;
            let end = std::cmp::min(start + BSIZE, body.len());
            buf[..end - start].copy_from_slice(&body[start..end]);
            buf.mark_valid();
        }
        Ok(())
    }

    /// Reads up to `dst.len()` bytes starting at `offset`, returning the
    /// number actually read (clipped to the object's size). On a cache
    /// miss (probed via the first requested block), fetches the whole
    /// body once and primes a padding window of blocks around the
    /// requested range; blocks outside the window are cached with
    /// `Hint::NoCache` so they don't evict hotter data.
    pub fn read(&self, kernel: &Kernel, dev: &Device, name: &[u8], dst: &mut [u8], offset: usize) -> Result<usize> {
        let size = dev.as_obj_store().object_size(name)?;
        if offset >= size || dst.is_empty() {
            return Ok(0);
        }
        let n = std::cmp::min(dst.len(), size - offset);
        let first_block = offset / BSIZE;
        let last_block = (offset + n - 1) / BSIZE;
        let total_blocks = (size + BSIZE - 1) / BSIZE;
        let pad_lo = first_block.saturating_sub(OBJ_CACHE_BLOCKS_PADDING);
        let pad_hi = std::cmp::min(last_block + OBJ_CACHE_BLOCKS_PADDING, total_blocks - 1);

        let probe = kernel.bcache.get(dev.id, BufId::Object(name.to_vec(), first_block as u32), Hint::Default);
        let hit = probe.is_valid();
        drop(probe);

        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            let body = dev.as_obj_store().get_object(name)?;
            for b in 0..total_blocks {
                let hint = if b >= pad_lo && b <= pad_hi { Hint::Default } else { Hint::NoCache };
                let mut buf = kernel.bcache.get(dev.id, BufId::Object(name.to_vec(), b as u32), hint);
                if !buf.is_valid() {
                    let start = b * BSIZE;
                    let end = std::cmp::min(start + BSIZE, body.len());
                    buf[..end - start].copy_from_slice(&body[start..end]);
                    if end - start < BSIZE {
                        buf[end - start..].iter_mut().for_each(|x| *x = 0);
                    }
                    buf.mark_valid();
                }
            }
        }

        let mut done = 0usize;
        while done < n {
            let cur = offset + done;
            let b = cur / BSIZE;
            let inblock = cur % BSIZE;
            let hint = if b >= pad_lo && b <= pad_hi { Hint::Default } else { Hint::NoCache };
            let buf = kernel.bcache.get(dev.id, BufId::Object(name.to_vec(), b as u32), hint);
            let take = std::cmp::min(n - done, BSIZE - inblock);
            dst[done..done + take].copy_from_slice(&buf[inblock..inblock + take]);
            done += take;
        }
        Ok(n)
    }

    /// Deletes `name` from the object disk and invalidates any cached
    /// blocks for it, so a later `add` reusing the same name cannot
    /// observe stale bytes through a hit.
    pub fn delete(&self, kernel: &Kernel, dev: &Device, name: &[u8]) -> Result<()> {
        let size = dev.as_obj_store().object_size(name)?;
        let total_blocks = (size + BSIZE - 1) / BSIZE;
        dev.as_obj_store().delete_object(name)?;
        for b in 0..total_blocks {
            let buf = kernel.bcache.get(dev.id, BufId::Object(name.to_vec(), b as u32), Hint::NoCache);
            buf.clear_valid();
        }
        Ok(())
    }

    pub fn object_size(&self, dev: &Device, name: &[u8]) -> Result<usize> {
        dev.as_obj_store().object_size(name)
    }
}

impl Default for ObjectCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_dev() -> (Kernel, std::sync::Arc<Device>) {
        let kernel = Kernel::new();
        let dev = kernel.devices.create_obj_device();
        (kernel, dev)
    }

    #[test]
    fn add_then_read_roundtrips() {
        let (kernel, dev) = test_dev();
        let cache = ObjectCache::new();
        cache.add(&kernel, &dev, b"f", b"hello world").unwrap();
        let mut out = [0u8; 11];
        let n = cache.read(&kernel, &dev, b"f", &mut out, 0).unwrap();
        assert_eq!(n, 11);
        assert_eq!(&out, b"hello world");
    }

    #[test]
    fn write_extends_object_and_updates_size() {
        let (kernel, dev) = test_dev();
        let cache = ObjectCache::new();
        cache.add(&kernel, &dev, b"f", b"abc").unwrap();
        cache.write(&kernel, &dev, b"f", b"XYZ", 3).unwrap();
        assert_eq!(cache.object_size(&dev, b"f").unwrap(), 6);
        let mut out = [0u8; 6];
        cache.read(&kernel, &dev, b"f", &mut out, 0).unwrap();
        assert_eq!(&out, b"abcXYZ");
    }

    #[test]
    fn read_spans_multiple_blocks_past_padding_window() {
        let (kernel, dev) = test_dev();
        let cache = ObjectCache::new();
        let data = vec![9u8; BSIZE * 10];
        cache.add(&kernel, &dev, b"big", &data).unwrap();
        let mut out = vec![0u8; data.len()];
        let n = cache.read(&kernel, &dev, b"big", &mut out, 0).unwrap();
        assert_eq!(n, data.len());
        assert_eq!(out, data);
    }

    #[test]
    fn delete_then_add_does_not_see_stale_bytes() {
        let (kernel, dev) = test_dev();
        let cache = ObjectCache::new();
        cache.add(&kernel, &dev, b"f", b"first!!").unwrap();
        cache.delete(&kernel, &dev, b"f").unwrap();
        cache.add(&kernel, &dev, b"f", b"second").unwrap();
        let mut out = [0u8; 6];
        cache.read(&kernel, &dev, b"f", &mut out, 0).unwrap();
        assert_eq!(&out, b"second");
    }
}
