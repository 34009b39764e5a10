//! The kernel context value (§9): a once-constructed bundle of the
//! coarse global state the donor kernel keeps as separate module
//! singletons (`bio::BCACHE`, `kernel().devices`, ...). Passed by
//! reference to every operation that needs the buffer cache or device
//! registry, rather than reached through ambient statics.

use crate::arena::ArrayArena;
use crate::bio::Bcache;
use crate::device::DeviceRegistry;
use crate::file::{new_ftable, DevTable, File};

pub struct Kernel {
    pub bcache: Bcache,
    pub devices: DeviceRegistry,
    pub ftable: ArrayArena<File>,
    pub devsw: DevTable,
}

impl Kernel {
    pub fn new() -> Self {
        Self {
            bcache: Bcache::new(),
            devices: DeviceRegistry::new(),
            ftable: new_ftable(),
            devsw: DevTable::new(),
        }
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}
