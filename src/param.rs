//! Compile-time tunables.
//!
//! Sizes here are chosen for a teaching kernel, not computed from hardware
//! probing -- the same spirit as the donor kernel's `param.rs`.

/// Open files per system.
pub const NFILE: usize = 100;

/// Open files per process.
pub const NOFILE: usize = 16;

/// Maximum number of active i-nodes, per backend in-memory inode table.
pub const NINODE: usize = 50;

/// Maximum major device number (devsw table size).
pub const NDEV: usize = 10;

/// Device number of the file system root disk.
pub const ROOTDEV: u32 = 1;

/// Block size, in bytes. Also the object cache's slice size.
pub const BSIZE: usize = 1024;

/// Max # of distinct blocks any single FS op writes.
pub const MAXOPBLOCKS: usize = 10;

/// Max data blocks in the on-disk log.
pub const LOGSIZE: usize = MAXOPBLOCKS * 3;

/// Size of the shared disk block cache, in buffers.
pub const NBUF: usize = MAXOPBLOCKS * 3;

/// Maximum file path name, in bytes.
pub const MAXPATH: usize = 128;

/// Directory entry name length (not NUL-terminated at exactly this length).
pub const DIRSIZ: usize = 14;

// --- device registry ---

/// Maximum number of IDE devices.
pub const NIDE: usize = 4;

/// Size, in blocks, of the simulated storage behind a fresh IDE device.
pub const IDE_DISK_BLOCKS: usize = 4096;

/// Maximum number of loop devices.
pub const NLOOP: usize = 8;

/// Maximum number of obj (in-memory) devices.
pub const NOBJDEV: usize = 8;

// --- mount table & namespaces ---

/// Maximum number of simultaneously active mounts, system-wide.
pub const NMOUNT: usize = 16;

/// Maximum number of mount namespaces (one per running container).
pub const NNAMESPACE: usize = 8;

// --- object filesystem / object disk ---

/// Size of the in-memory backing store created for a fresh obj device.
pub const STORAGE_DEVICE_SIZE: usize = 4 * 1024 * 1024;

/// Maximum length of an object name, including the inode-name encoding's
/// fixed prefix and its non-zero-byte-safe integer suffix.
pub const MAX_OBJECT_NAME_LENGTH: usize = 16;

/// Maximum number of objects an obj-disk device can hold.
pub const MAX_OBJECTS: usize = 512;

/// Number of blocks of padding kept hot around a requested range in the
/// object cache; blocks outside the window are fetched with `NO_CACHE`.
pub const OBJ_CACHE_BLOCKS_PADDING: usize = 4;

/// Maximum size of a single inode's data object (32 MiB).
pub const MAX_INODE_OBJECT_DATA: usize = 32 * 1024 * 1024;

/// Root directory inode number on objfs (native fs uses `1`, see `fs::native::ROOTINO`).
pub const OBJ_ROOTINO: u32 = 1;
