//! Mount table & namespaces (§4.9): filesystem mounts, bind mounts,
//! nested mounts, `pivot_root`, and per-container mount namespaces.
//!
//! Grounded on the same bounded-registration shape as
//! `device::DeviceRegistry`'s `Table` (a capacity-checked `Vec` rather
//! than a literal fixed-size array): a namespace's `active_mounts` is a
//! `Vec<Arc<Mount>>` under one spinlock, capped at `NMOUNT`, most
//! recently mounted first.

use std::sync::Arc;

use crate::errno::{Error, Result};
use crate::fs::{VfsInode, VfsSuperblock};
use crate::lock::Spinlock;
use crate::param::NMOUNT;

/// What a mount resolves to: a fresh backend instance, or another
/// inode's subtree (bind mount).
pub enum Target {
    Fs(VfsSuperblock),
    Bind(VfsInode),
}

/// One entry in a namespace's mount list. The root mount of a namespace
/// has no parent and no mountpoint; every other mount has both.
pub struct Mount {
    pub parent: Option<Arc<Mount>>,
    pub mountpoint: Option<VfsInode>,
    pub target: Target,
}

impl Mount {
    pub fn root_inode(&self) -> VfsInode {
        match &self.target {
            Target::Fs(sb) => sb.root_inode(),
            Target::Bind(ip) => ip.clone(),
        }
    }

    fn is_bind(&self) -> bool {
        matches!(self.target, Target::Bind(_))
    }
}

/// A location in the VFS namespace: an inode plus the mount it was
/// reached through. Path resolution (`fs::namex`) walks these.
#[derive(Clone)]
pub struct Anchor {
    pub ip: VfsInode,
    pub mnt: Arc<Mount>,
}

struct NsState {
    active_mounts: Vec<Arc<Mount>>,
    root: Arc<Mount>,
}

/// One process container's view of the mount tree. `fork` shares a
/// namespace; `unshare(MOUNT_NS)` calls `copy_active_mounts` to deep-copy
/// one (§4.9).
pub struct MountNamespace {
    state: Spinlock<NsState>,
}

impl MountNamespace {
    /// Creates a fresh namespace rooted at `sb`.
    pub fn new_root(sb: VfsSuperblock) -> Arc<Self> {
        let root = Arc::new(Mount {
            parent: None,
            mountpoint: None,
            target: Target::Fs(sb),
        });
        Arc::new(Self {
            state: Spinlock::new(
                "mount namespace",
                NsState {
                    active_mounts: vec![Arc::clone(&root)],
                    root,
                },
            ),
        })
    }

    pub fn root_mount(&self) -> Arc<Mount> {
        Arc::clone(&self.state.lock().root)
    }

    /// `mount(mountpoint_ip, target_dev, bind_ip, parent)`: rejects a
    /// duplicate (same parent mount + same mountpoint), else allocates a
    /// fresh slot and prepends it to the namespace's active list.
    pub fn mount(&self, mountpoint: VfsInode, parent: &Arc<Mount>, target: Target) -> Result<Arc<Mount>> {
        let mut state = self.state.lock();
        if state.active_mounts.iter().any(|m| {
            m.mountpoint.as_ref().map_or(false, |mp| mp.same_inode(&mountpoint)) && Arc::ptr_eq(m.parent.as_ref().unwrap_or(&state.root), parent)
        }) {
            return Err(Error::Exists);
        }
        assert!(state.active_mounts.len() < NMOUNT, "mount table exhausted (capacity {})", NMOUNT);

        let mnt = Arc::new(Mount {
            parent: Some(Arc::clone(parent)),
            mountpoint: Some(mountpoint),
            target,
        });
        state.active_mounts.insert(0, Arc::clone(&mnt));
        Ok(mnt)
    }

    /// Unmounts `mnt`: requires it currently hold no references beyond
    /// the list's own and the caller's, and (if it is the namespace
    /// root) no child mount still parented to it.
    pub fn umount(&self, mnt: &Arc<Mount>) -> Result<()> {
        let mut state = self.state.lock();
        let pos = state
            .active_mounts
            .iter()
            .position(|m| Arc::ptr_eq(m, mnt))
            .ok_or(Error::NotFound)?;
        if Arc::strong_count(mnt) > 2 {
            return Err(Error::Busy);
        }
        if state
            .active_mounts
            .iter()
            .any(|m| m.parent.as_ref().map_or(false, |p| Arc::ptr_eq(p, mnt)))
        {
            return Err(Error::Busy);
        }
        state.active_mounts.remove(pos);
        Ok(())
    }

    /// Returns the child mount pinned at `ip`: for ordinary fs mounts,
    /// only one whose parent is also `parent`; bind mounts match on
    /// mountpoint alone, regardless of parent (§4.9).
    pub fn mntlookup(&self, ip: &VfsInode, parent: &Arc<Mount>) -> Option<Arc<Mount>> {
        let state = self.state.lock();
        state
            .active_mounts
            .iter()
            .find(|m| {
                let mp_matches = m.mountpoint.as_ref().map_or(false, |mp| mp.same_inode(ip));
                mp_matches && (m.is_bind() || m.parent.as_ref().map_or(false, |p| Arc::ptr_eq(p, parent)))
            })
            .cloned()
    }

    /// `pivot_root(new_root, put_old)`: the namespace's new root becomes
    /// `new_root.mnt`; the old root is reparented under `put_old.mnt` at
    /// `put_old.ip`, reachable until it is later `umount`ed.
    pub fn pivot_root(&self, new_root: &Anchor, put_old: &Anchor) -> Result<()> {
        if !new_root.ip.same_inode(&new_root.mnt.root_inode()) {
            return Err(Error::InvalidArgument);
        }
        // §4.9: `new_root` must be an ancestor of `put_old`, else the old
        // root would be reparented somewhere unreachable from the new one.
        // Checked before taking `state`'s lock -- `is_child_of` walks `..`
        // through this same namespace and would deadlock re-entering it.
        if !crate::fs::namex::is_child_of(self, new_root, put_old) {
            return Err(Error::InvalidArgument);
        }

        let mut state = self.state.lock();
        if Arc::ptr_eq(&new_root.mnt, &state.root) {
            return Err(Error::InvalidArgument);
        }

        let old_root = Arc::clone(&state.root);
        let new_mnt = Arc::clone(&new_root.mnt);

        let pos = state
            .active_mounts
            .iter()
            .position(|m| Arc::ptr_eq(m, &new_mnt))
            .ok_or(Error::NotFound)?;
        let reparented = Arc::new(Mount {
            parent: Some(Arc::clone(&put_old.mnt)),
            mountpoint: Some(put_old.ip.clone()),
            target: match &old_root.target {
                Target::Fs(sb) => Target::Fs(sb.clone()),
                Target::Bind(ip) => Target::Bind(ip.clone()),
            },
        });
        state.active_mounts[pos] = Arc::new(Mount {
            parent: None,
            mountpoint: None,
            target: match &new_mnt.target {
                Target::Fs(sb) => Target::Fs(sb.clone()),
                Target::Bind(ip) => Target::Bind(ip.clone()),
            },
        });
        state.root = Arc::clone(&state.active_mounts[pos]);
        state.active_mounts.push(reparented);
        Ok(())
    }

    /// `copy_active_mounts`: shallow-copies every active mount (dup
    /// mountpoint inodes and bind targets, bump superblock refcounts),
    /// then replicates the parent-pointer graph into the new list.
    /// `Mount.parent` is set at construction and never mutated, so the
    /// graph is rebuilt bottom-up: each old mount's copy is built only
    /// after its parent's copy exists, memoized by old-list position.
    pub fn copy_active_mounts(&self) -> Arc<MountNamespace> {
        self.copy_active_mounts_remapping().0
    }

    /// Like `copy_active_mounts`, but also returns each old mount paired
    /// with its freshly built copy. A caller holding an `Anchor` into this
    /// namespace (a process's `cwd`) looks its old `mnt` up in the returned
    /// list to find the corresponding mount in the new namespace -- the
    /// copy's `Arc<Mount>`s are entirely fresh, so no old handle is valid
    /// there by pointer identity alone.
    pub fn copy_active_mounts_remapping(&self) -> (Arc<MountNamespace>, Vec<(Arc<Mount>, Arc<Mount>)>) {
        let state = self.state.lock();
        let old_list = &state.active_mounts;

        fn build(i: usize, old: &[Arc<Mount>], built: &mut Vec<Option<Arc<Mount>>>) -> Arc<Mount> {
            if let Some(m) = &built[i] {
                return Arc::clone(m);
            }
            let parent = old[i].parent.as_ref().map(|p| {
                let pi = old.iter().position(|m| Arc::ptr_eq(m, p)).expect("parent mount missing from list");
                build(pi, old, built)
            });
            let copy = Arc::new(Mount {
                parent,
                mountpoint: old[i].mountpoint.clone(),
                target: match &old[i].target {
                    Target::Fs(sb) => Target::Fs(sb.clone()),
                    Target::Bind(ip) => Target::Bind(ip.clone()),
                },
            });
            built[i] = Some(Arc::clone(&copy));
            copy
        }

        let mut built: Vec<Option<Arc<Mount>>> = vec![None; old_list.len()];
        let new_list: Vec<Arc<Mount>> = (0..old_list.len()).map(|i| build(i, old_list, &mut built)).collect();
        let root_pos = old_list
            .iter()
            .position(|m| Arc::ptr_eq(m, &state.root))
            .expect("root missing from active_mounts");
        let new_root = Arc::clone(&new_list[root_pos]);

        let remap = old_list.iter().cloned().zip(new_list.iter().cloned()).collect();
        let ns = Arc::new(MountNamespace {
            state: Spinlock::new(
                "mount namespace",
                NsState {
                    active_mounts: new_list,
                    root: new_root,
                },
            ),
        });
        (ns, remap)
    }
}
