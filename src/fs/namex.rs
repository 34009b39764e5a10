//! VFS pathname resolution (§4.8): `namex` and its thin wrappers
//! `namei`/`nameiparent`/`nameimount`/`nameiparentmount`, plus
//! `is_child_of`. Walks one path element at a time across both fs
//! backends uniformly (dispatch lives in `VfsInode`/`VfsInode::dirlookup`)
//! and across mount boundaries (mount-point descent, `..` ascent into a
//! parent mount).

use std::sync::Arc;

use crate::errno::{Error, Result};
use crate::mount::{Anchor, Mount, MountNamespace};

use super::{FileName, Path};

/// Core routine. `cwd` anchors a relative path; an absolute path is
/// resolved from `ns`'s root instead. When `get_parent` is set, stops one
/// element short of the end and returns that last element's name instead
/// of looking it up -- `path` must have at least one element in that
/// case, or the caller gets `None` back (bare `/`, or an empty path).
pub fn namex<'p>(ns: &MountNamespace, cwd: &Anchor, path: &'p Path, get_parent: bool) -> Result<(Anchor, Option<&'p FileName>)> {
    let mut cur = if path.is_absolute() {
        let root = ns.root_mount();
        let ip = root.root_inode();
        Anchor { ip, mnt: root }
    } else {
        cwd.clone()
    };

    let mut rest = path;
    loop {
        let (next_rest, name) = match rest.skipelem() {
            Some(v) => v,
            None => return Ok((cur, None)),
        };
        if !cur.ip.is_dir() {
            return Err(Error::NotDir);
        }
        if get_parent && next_rest.is_empty_string() {
            return Ok((cur, Some(name)));
        }

        if name.as_bytes() == b".." && !Arc::ptr_eq(&cur.mnt, &ns.root_mount()) && cur.ip.same_inode(&cur.mnt.root_inode()) {
            let parent_mnt = Arc::clone(cur.mnt.parent.as_ref().expect("non-root mount has a parent"));
            let mountpoint = cur.mnt.mountpoint.clone().expect("non-root mount has a mountpoint");
            // Land on the mountpoint itself and re-loop without consuming
            // `..` -- it still needs to be looked up *in* the mountpoint
            // (yielding the mountpoint's own parent), not stop at it.
            cur = Anchor { ip: mountpoint, mnt: parent_mnt };
            continue;
        }

        let found = cur.ip.dirlookup(name)?;
        cur = match ns.mntlookup(&found, &cur.mnt) {
            Some(child_mnt) => {
                let root_ip = child_mnt.root_inode();
                Anchor { ip: root_ip, mnt: child_mnt }
            }
            None => Anchor { ip: found, mnt: Arc::clone(&cur.mnt) },
        };
        rest = next_rest;
    }
}

pub fn namei(ns: &MountNamespace, cwd: &Anchor, path: &Path) -> Result<Anchor> {
    namex(ns, cwd, path, false).map(|(anchor, _)| anchor)
}

pub fn nameiparent<'p>(ns: &MountNamespace, cwd: &Anchor, path: &'p Path) -> Result<(Anchor, &'p FileName)> {
    let (anchor, name) = namex(ns, cwd, path, true)?;
    let name = name.ok_or(Error::InvalidArgument)?;
    Ok((anchor, name))
}

pub fn nameimount(ns: &MountNamespace, cwd: &Anchor, path: &Path) -> Result<Arc<Mount>> {
    namei(ns, cwd, path).map(|a| a.mnt)
}

pub fn nameiparentmount(ns: &MountNamespace, cwd: &Anchor, path: &Path) -> Result<Arc<Mount>> {
    nameiparent(ns, cwd, path).map(|(a, _)| a.mnt)
}

/// Walks upward from `child` via `..` until `parent` is found (same
/// inode and mount) or the namespace root is reached without a match.
pub fn is_child_of(ns: &MountNamespace, parent: &Anchor, child: &Anchor) -> bool {
    let mut cur = child.clone();
    loop {
        if cur.ip.same_inode(&parent.ip) && Arc::ptr_eq(&cur.mnt, &parent.mnt) {
            return true;
        }
        let root = ns.root_mount();
        if Arc::ptr_eq(&cur.mnt, &root) && cur.ip.same_inode(&root.root_inode()) {
            return false;
        }
        let dotdot = Path::new("..").expect("\"..\" has no NUL bytes");
        match namex(ns, &cur, dotdot, false) {
            Ok((next, _)) if !(next.ip.same_inode(&cur.ip) && Arc::ptr_eq(&next.mnt, &cur.mnt)) => cur = next,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceRegistry;
    use crate::fs::{InodeType, VfsSuperblock};
    use crate::fs::native::{self, NativeFs};
    use crate::kernel::Kernel;
    use crate::mount::Target;

    fn test_namespace() -> (Arc<Kernel>, Arc<MountNamespace>) {
        let kernel = Arc::new(Kernel::new());
        let dev = kernel.devices.get_or_create_ide_device(0);
        native::format(&kernel, &dev, 2048, 200);
        let fs = NativeFs::mount(Arc::clone(&kernel), dev);
        let ns = MountNamespace::new_root(VfsSuperblock::Native(fs));
        (kernel, ns)
    }

    fn root_anchor(ns: &MountNamespace) -> Anchor {
        let mnt = ns.root_mount();
        let ip = mnt.root_inode();
        Anchor { ip, mnt }
    }

    #[test]
    fn absolute_path_resolves_from_namespace_root() {
        let (_kernel, ns) = test_namespace();
        let cwd = root_anchor(&ns);
        let root = cwd.ip.clone();
        let found = namei(&ns, &cwd, Path::new("/").unwrap()).unwrap();
        assert!(found.ip.same_inode(&root));
    }

    #[test]
    fn relative_path_walks_through_directories() {
        let (_kernel, ns) = test_namespace();
        let cwd = root_anchor(&ns);
        let sub = cwd.ip.ialloc(InodeType::Dir).unwrap();
        sub.dirlink(FileName::from_str(".").unwrap(), &sub).unwrap();
        sub.dirlink(FileName::from_str("..").unwrap(), &cwd.ip).unwrap();
        cwd.ip.dirlink(FileName::from_str("sub").unwrap(), &sub).unwrap();
        let file = sub.ialloc(InodeType::File).unwrap();
        sub.dirlink(FileName::from_str("f").unwrap(), &file).unwrap();

        let found = namei(&ns, &cwd, Path::new("sub/f").unwrap()).unwrap();
        assert!(found.ip.same_inode(&file));
    }

    #[test]
    fn nameiparent_returns_last_element_name_unresolved() {
        let (_kernel, ns) = test_namespace();
        let cwd = root_anchor(&ns);
        let (parent, name) = nameiparent(&ns, &cwd, Path::new("newfile").unwrap()).unwrap();
        assert!(parent.ip.same_inode(&cwd.ip));
        assert_eq!(name.as_bytes(), b"newfile");
    }

    #[test]
    fn dotdot_crosses_into_parent_mount_at_mountpoint() {
        let (kernel, ns) = test_namespace();
        let cwd = root_anchor(&ns);

        let mnt_dir = cwd.ip.ialloc(InodeType::Dir).unwrap();
        mnt_dir.dirlink(FileName::from_str(".").unwrap(), &mnt_dir).unwrap();
        mnt_dir.dirlink(FileName::from_str("..").unwrap(), &cwd.ip).unwrap();
        cwd.ip.dirlink(FileName::from_str("mnt").unwrap(), &mnt_dir).unwrap();

        let child_dev = kernel.devices.create_obj_device();
        let child_fs = crate::fs::objfs::ObjFs::mount(Arc::clone(&kernel), child_dev);
        let child_sb = VfsSuperblock::Obj(child_fs);
        let child_mnt = ns.mount(mnt_dir.clone(), &cwd.mnt, Target::Fs(child_sb)).unwrap();
        let child_root = child_mnt.root_inode();

        let down = namei(&ns, &cwd, Path::new("mnt").unwrap()).unwrap();
        assert!(down.ip.same_inode(&child_root));
        assert!(Arc::ptr_eq(&down.mnt, &child_mnt));

        // ".." from the child root must resolve *through* the mountpoint to
        // its parent, not stop at the mountpoint itself.
        let up = namei(&ns, &down, Path::new("..").unwrap()).unwrap();
        assert!(up.ip.same_inode(&cwd.ip));
        assert!(Arc::ptr_eq(&up.mnt, &cwd.mnt));
    }

    #[test]
    fn is_child_of_true_for_descendant_false_otherwise() {
        let (_kernel, ns) = test_namespace();
        let cwd = root_anchor(&ns);
        let sub = cwd.ip.ialloc(InodeType::Dir).unwrap();
        sub.dirlink(FileName::from_str(".").unwrap(), &sub).unwrap();
        sub.dirlink(FileName::from_str("..").unwrap(), &cwd.ip).unwrap();
        cwd.ip.dirlink(FileName::from_str("sub").unwrap(), &sub).unwrap();

        let sub_anchor = Anchor { ip: sub.clone(), mnt: Arc::clone(&cwd.mnt) };
        assert!(is_child_of(&ns, &cwd, &sub_anchor));
        assert!(!is_child_of(&ns, &sub_anchor, &cwd));
    }
}
