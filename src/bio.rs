//! Buffer cache (§4.2).
//!
//! A linked list of fixed-size buffers holding cached copies of disk (or
//! obj-disk) block contents. Caching blocks in memory reduces backing
//! storage traffic and gives multiple callers a single synchronization
//! point per block.
//!
//! Unlike the donor's `bio.rs`, which stores buffers in a `MruArena` (an
//! intrusive doubly-linked list of pinned, branded slots), the ordering
//! here is a plain `VecDeque<usize>` of indices into a fixed `Vec` of
//! buffers -- the arena module's docs explain why this one piece doesn't
//! reuse `ArrayArena`. One spinlock guards the index list and all
//! metadata (dev, id, VALID, DIRTY, refcount); each buffer's byte
//! content is behind its own sleeplock, borrowed straight off `&self`
//! since the buffer pool is never resized or moved after construction.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::device::DeviceId;
use crate::lock::{Sleeplock, Spinlock};
use crate::param::{BSIZE, NBUF};

/// A buffer's opaque identity: a block number on a block device, or an
/// `(object_name, block_index)` pair on an obj device.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum BufId {
    Block(u32),
    Object(Vec<u8>, u32),
}

/// Caching hint passed to `get`, honored by `release`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Hint {
    /// Re-insert at the MRU head on release: ordinary hot data.
    Default,
    /// Re-insert at the LRU tail on release: padding-window filler that
    /// should not evict hot data (§4.6).
    NoCache,
}

#[derive(Clone)]
struct BufMeta {
    dev: DeviceId,
    id: BufId,
    valid: bool,
    dirty: bool,
    refcnt: usize,
}

impl BufMeta {
    const fn unused() -> Self {
        Self {
            dev: 0,
            id: BufId::Block(0),
            valid: false,
            dirty: false,
            refcnt: 0,
        }
    }
}

struct Shared {
    meta: Vec<BufMeta>,
    /// Front = MRU, back = LRU. Always holds exactly `NBUF` indices.
    order: VecDeque<usize>,
}

pub struct Bcache {
    data: Vec<Sleeplock<[u8; BSIZE]>>,
    shared: Spinlock<Shared>,
    enabled: AtomicBool,
    minor_faults: AtomicU64,
    major_faults: AtomicU64,
}

impl Bcache {
    pub fn new() -> Self {
        let mut data = Vec::with_capacity(NBUF);
        data.resize_with(NBUF, || Sleeplock::new("buffer", [0u8; BSIZE]));
        Self {
            data,
            shared: Spinlock::new(
                "bcache",
                Shared {
                    meta: vec![BufMeta::unused(); NBUF],
                    order: (0..NBUF).collect(),
                },
            ),
            enabled: AtomicBool::new(true),
            minor_faults: AtomicU64::new(0),
            major_faults: AtomicU64::new(0),
        }
    }

    /// Returns a locked buffer for `(dev, id)`: a cached hit, or a
    /// recycled victim initialized with `VALID` clear. Panics if every
    /// buffer is pinned (`refcnt > 0`); the spec explicitly rules out
    /// blocking here.
    pub fn get(&self, dev: DeviceId, id: BufId, hint: Hint) -> Buf<'_> {
        let mut shared = self.shared.lock();

        if let Some(index) = shared
            .order
            .iter()
            .copied()
            .find(|&i| shared.meta[i].dev == dev && shared.meta[i].id == id)
        {
            shared.meta[index].refcnt += 1;
            drop(shared);
            self.minor_faults.fetch_add(1, Ordering::Relaxed);
            return Buf {
                bcache: self,
                index,
                hint,
                guard: Some(self.data[index].lock()),
            };
        }

        let index = shared
            .order
            .iter()
            .rev()
            .copied()
            .find(|&i| shared.meta[i].refcnt == 0 && !shared.meta[i].dirty)
            .unwrap_or_else(|| panic!("bcache: no free buffers ({} in use)", NBUF));
        shared.meta[index] = BufMeta {
            dev,
            id,
            valid: false,
            dirty: false,
            refcnt: 1,
        };
        drop(shared);
        self.major_faults.fetch_add(1, Ordering::Relaxed);
        Buf {
            bcache: self,
            index,
            hint,
            guard: Some(self.data[index].lock()),
        }
    }

    /// Clears `VALID`/`DIRTY` on every buffer owned by `dev`. Called when
    /// a device's last reference is dropped.
    pub fn invalidate_blocks(&self, dev: DeviceId) {
        let mut shared = self.shared.lock();
        for m in shared.meta.iter_mut().filter(|m| m.dev == dev) {
            m.valid = false;
            m.dirty = false;
        }
    }

    pub fn enable_cache(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    /// Disables the cache and immediately invalidates idle clean
    /// buffers, so the next `get` for them is a cold fetch.
    pub fn disable_cache(&self) {
        self.enabled.store(false, Ordering::Relaxed);
        let mut shared = self.shared.lock();
        for m in shared
            .meta
            .iter_mut()
            .filter(|m| m.refcnt == 0 && !m.dirty)
        {
            m.valid = false;
        }
    }

    pub fn cache_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn minor_faults(&self) -> u64 {
        self.minor_faults.load(Ordering::Relaxed)
    }

    pub fn major_faults(&self) -> u64 {
        self.major_faults.load(Ordering::Relaxed)
    }
}

impl Default for Bcache {
    fn default() -> Self {
        Self::new()
    }
}

/// A locked buffer. Content is reached through `Deref`/`DerefMut`;
/// metadata accessors take the list lock independently.
pub struct Buf<'a> {
    bcache: &'a Bcache,
    index: usize,
    hint: Hint,
    guard: Option<crate::lock::SleeplockGuard<'a, [u8; BSIZE]>>,
}

impl Buf<'_> {
    pub fn dev(&self) -> DeviceId {
        self.bcache.shared.lock().meta[self.index].dev
    }

    pub fn id(&self) -> BufId {
        self.bcache.shared.lock().meta[self.index].id.clone()
    }

    /// Panics if this buffer's id is not a block number; native-fs and
    /// the IDE/loop driver never key buffers any other way.
    pub fn blockno(&self) -> u32 {
        match self.id() {
            BufId::Block(b) => b,
            BufId::Object(..) => panic!("blockno() called on an object-keyed buffer"),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.bcache.shared.lock().meta[self.index].valid
    }

    pub fn mark_valid(&self) {
        self.bcache.shared.lock().meta[self.index].valid = true;
    }

    /// Clears VALID without touching DIRTY; used when the backing object
    /// is deleted out from under a cached slice (§4.6), so a later `get`
    /// of the same key re-fetches instead of serving stale bytes.
    pub fn clear_valid(&self) {
        self.bcache.shared.lock().meta[self.index].valid = false;
    }

    pub fn is_dirty(&self) -> bool {
        self.bcache.shared.lock().meta[self.index].dirty
    }

    /// Marks the buffer DIRTY so the cache will not evict it; used by the
    /// log to pin buffers until they are installed (§4.4).
    pub fn mark_dirty(&self) {
        self.bcache.shared.lock().meta[self.index].dirty = true;
    }

    pub fn clear_dirty(&self) {
        self.bcache.shared.lock().meta[self.index].dirty = false;
    }
}

impl Deref for Buf<'_> {
    type Target = [u8; BSIZE];

    fn deref(&self) -> &Self::Target {
        self.guard.as_ref().expect("buffer already released")
    }
}

impl DerefMut for Buf<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.guard.as_mut().expect("buffer already released")
    }
}

impl Drop for Buf<'_> {
    fn drop(&mut self) {
        // Release the sleeplock before touching the list lock, as the
        // spec orders it.
        self.guard.take();

        let mut shared = self.bcache.shared.lock();
        let meta = &mut shared.meta[self.index];
        meta.refcnt -= 1;
        let disabled = !self.bcache.enabled.load(Ordering::Relaxed);
        if meta.refcnt == 0 {
            if disabled && !meta.dirty {
                meta.valid = false;
            }
            shared.order.retain(|&i| i != self.index);
            if self.hint == Hint::NoCache || disabled {
                shared.order.push_back(self.index);
            } else {
                shared.order.push_front(self.index);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_returns_same_buffer_identity() {
        let bc = Bcache::new();
        {
            let mut b = bc.get(1, BufId::Block(5), Hint::Default);
            b[0] = 42;
            b.mark_valid();
        }
        let b = bc.get(1, BufId::Block(5), Hint::Default);
        assert_eq!(b[0], 42);
        assert!(b.is_valid());
        assert_eq!(bc.minor_faults(), 1);
        assert_eq!(bc.major_faults(), 1);
    }

    #[test]
    fn default_hint_reuses_before_no_cache_hint() {
        let bc = Bcache::new();
        // Fill the whole pool through NO_CACHE releases, then through one
        // Default release; the Default one should be evicted last.
        for i in 0..NBUF as u32 {
            drop(bc.get(1, BufId::Block(i), Hint::NoCache));
        }
        drop(bc.get(1, BufId::Block(1000), Hint::Default));
        // Now every buffer but blockno 1000 sits at the LRU tail; the
        // next NBUF - 1 allocations recycle them before touching 1000.
        for i in 0..NBUF as u32 - 1 {
            let b = bc.get(2, BufId::Block(i), Hint::NoCache);
            assert_ne!((b.dev(), b.id()), (1, BufId::Block(1000)));
        }
    }

    #[test]
    fn invalidate_blocks_clears_device() {
        let bc = Bcache::new();
        {
            let mut b = bc.get(1, BufId::Block(0), Hint::Default);
            b.mark_valid();
            b.mark_dirty();
        }
        bc.invalidate_blocks(1);
        let b = bc.get(1, BufId::Block(0), Hint::Default);
        assert!(!b.is_valid());
        assert!(!b.is_dirty());
    }

    #[test]
    fn no_live_buffer_shares_identity() {
        let bc = Bcache::new();
        let a = bc.get(1, BufId::Block(1), Hint::Default);
        let b = bc.get(1, BufId::Block(2), Hint::Default);
        assert_ne!(a.index, b.index);
    }

    #[test]
    #[should_panic]
    fn exhausting_pool_panics() {
        let bc = Bcache::new();
        let mut held = Vec::new();
        for i in 0..=NBUF as u32 {
            held.push(bc.get(1, BufId::Block(i), Hint::Default));
        }
    }

    #[test]
    fn disable_cache_invalidates_idle_clean_buffers() {
        let bc = Bcache::new();
        {
            let mut b = bc.get(1, BufId::Block(0), Hint::Default);
            b.mark_valid();
        }
        bc.disable_cache();
        let b = bc.get(1, BufId::Block(0), Hint::Default);
        assert!(!b.is_valid());
    }
}
