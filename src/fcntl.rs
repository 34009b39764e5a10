//! Open-flag bits for `syscall::sys_open` (§6).

use bitflags::bitflags;

bitflags! {
    pub struct Flags: i32 {
        const O_RDONLY = 0;
        const O_WRONLY = 0x1;
        const O_RDWR = 0x2;
        const O_CREATE = 0x200;
    }
}

impl Flags {
    pub fn readable(self) -> bool {
        !self.intersects(Flags::O_WRONLY)
    }

    pub fn writable(self) -> bool {
        self.intersects(Flags::O_WRONLY | Flags::O_RDWR)
    }
}
