//! Fixed-capacity, reference-counted object pools.
//!
//! The donor kernel models its inode/buffer/mount tables as intrusive
//! doubly-linked lists of refcounted entries (`arena::{Arena, ArrayArena,
//! MruArena}`), each entry embedded in a branded, pinned allocation. The
//! design notes for this spec (§9) license a simpler substitute: "express
//! with explicit pool + free list + index-based links... avoid raw
//! back-pointers." `ArrayArena` below is that substitute -- a flat `Vec`
//! of slots guarded by one spinlock, searched linearly (tables here are a
//! few dozen entries, exactly the donor's own `NINODE`/`NFILE` scale).
//!
//! The buffer cache's MRU/LRU ordering is different enough (hint-based
//! insertion point, eviction only from the clean end) that it is modeled
//! directly in `bio` rather than squeezed into this generic arena.

use crate::lock::Spinlock;

/// Runs when an arena slot's reference count drops to zero, before the
/// slot is made available for reuse.
pub trait ArenaObject {
    fn finalize(&mut self);
}

struct Slot<T> {
    refcnt: usize,
    data: Option<T>,
}

pub struct ArrayArena<T> {
    name: &'static str,
    slots: Spinlock<Vec<Slot<T>>>,
}

/// A reference-counted handle into an `ArrayArena`. Dropping the last
/// handle to a given slot finalizes and frees it.
pub struct ArenaRc<'a, T: ArenaObject> {
    arena: &'a ArrayArena<T>,
    index: usize,
}

impl<T> ArrayArena<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || Slot {
            refcnt: 0,
            data: None,
        });
        Self {
            name,
            slots: Spinlock::new("arena", slots),
        }
    }
}

impl<T: ArenaObject> ArrayArena<T> {
    /// Finds a slot matching `matches`, bumping its refcount, or -- if
    /// none match -- claims a free slot (`refcnt == 0`) and initializes
    /// it with `make`.
    pub fn find_or_alloc<F, M>(&self, matches: F, make: M) -> Option<ArenaRc<'_, T>>
    where
        F: Fn(&T) -> bool,
        M: FnOnce() -> T,
    {
        let mut slots = self.slots.lock();
        if let Some(i) = slots
            .iter()
            .position(|s| s.refcnt > 0 && s.data.as_ref().is_some_and(&matches))
        {
            slots[i].refcnt += 1;
            drop(slots);
            return Some(ArenaRc {
                arena: self,
                index: i,
            });
        }
        let i = slots.iter().position(|s| s.refcnt == 0)?;
        slots[i] = Slot {
            refcnt: 1,
            data: Some(make()),
        };
        drop(slots);
        Some(ArenaRc {
            arena: self,
            index: i,
        })
    }

    /// Like `find_or_alloc`, but returns the raw slot index with its
    /// refcount already bumped/initialized, for callers that want to
    /// wrap it in their own owned, `Arc`-backed handle (e.g. an inode
    /// handle that must outlive the borrow of `&ArrayArena` itself)
    /// rather than the borrowed `ArenaRc` this arena hands out directly.
    pub fn find_or_alloc_index<F, M>(&self, matches: F, make: M) -> Option<usize>
    where
        F: Fn(&T) -> bool,
        M: FnOnce() -> T,
    {
        let mut slots = self.slots.lock();
        if let Some(i) = slots
            .iter()
            .position(|s| s.refcnt > 0 && s.data.as_ref().is_some_and(&matches))
        {
            slots[i].refcnt += 1;
            return Some(i);
        }
        let i = slots.iter().position(|s| s.refcnt == 0)?;
        slots[i] = Slot {
            refcnt: 1,
            data: Some(make()),
        };
        Some(i)
    }

    pub fn bump(&self, index: usize) {
        self.slots.lock()[index].refcnt += 1;
    }

    pub fn drop_ref(&self, index: usize) {
        let mut slots = self.slots.lock();
        slots[index].refcnt -= 1;
        if slots[index].refcnt == 0 {
            let mut slot = std::mem::replace(
                &mut slots[index],
                Slot {
                    refcnt: 0,
                    data: None,
                },
            );
            drop(slots);
            if let Some(mut data) = slot.data.take() {
                data.finalize();
            }
        }
    }

    pub fn with<R>(&self, index: usize, f: impl FnOnce(&T) -> R) -> R {
        let slots = self.slots.lock();
        f(slots[index].data.as_ref().expect("arena slot freed while referenced"))
    }

    pub fn with_mut<R>(&self, index: usize, f: impl FnOnce(&mut T) -> R) -> R {
        let mut slots = self.slots.lock();
        f(slots[index].data.as_mut().expect("arena slot freed while referenced"))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T: ArenaObject> Clone for ArenaRc<'_, T> {
    fn clone(&self) -> Self {
        self.arena.bump(self.index);
        ArenaRc {
            arena: self.arena,
            index: self.index,
        }
    }
}

impl<T: ArenaObject> Drop for ArenaRc<'_, T> {
    fn drop(&mut self) {
        self.arena.drop_ref(self.index);
    }
}

impl<'a, T: ArenaObject> ArenaRc<'a, T> {
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.arena.with(self.index, f)
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        self.arena.with_mut(self.index, f)
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter(u32);
    impl ArenaObject for Counter {
        fn finalize(&mut self) {}
    }

    #[test]
    fn reuses_freed_slot() {
        let arena = ArrayArena::<Counter>::new("test", 2);
        let a = arena.find_or_alloc(|c| c.0 == 1, || Counter(1)).unwrap();
        let b = arena.find_or_alloc(|c| c.0 == 2, || Counter(2)).unwrap();
        assert!(arena.find_or_alloc(|c| c.0 == 3, || Counter(3)).is_none());
        drop(a);
        let c = arena.find_or_alloc(|c| c.0 == 3, || Counter(3)).unwrap();
        assert_eq!(c.with(|c| c.0), 3);
        drop(b);
        drop(c);
    }

    #[test]
    fn dedups_matching_entries() {
        let arena = ArrayArena::<Counter>::new("test", 4);
        let a = arena.find_or_alloc(|c| c.0 == 7, || Counter(7)).unwrap();
        let b = arena.find_or_alloc(|c| c.0 == 7, || Counter(7)).unwrap();
        assert_eq!(a.index(), b.index());
    }
}
