//! Write-ahead log for the native filesystem (§4.4).
//!
//! A transaction contains the updates of one or more FS system calls; the
//! log only commits when no system call has an operation outstanding, so
//! `commit` never needs to reason about a half-finished caller. Adapted
//! from the donor's `fs/log.rs`: in place of the donor's `ArrayVec<BufUnlocked, LOGSIZE>`
//! of live buffer handles (which would tie this struct's lifetime to the
//! buffer cache's), the header here is a plain `Vec<u32>` of block
//! numbers -- the log re-fetches each block from the cache when it needs
//! the data, trading one extra cache hit for not needing to hold buffers
//! across the whole transaction.

use crate::device::Device;
use crate::kernel::Kernel;
use crate::lock::SleepableLock;
use crate::param::LOGSIZE;

struct LogState {
    outstanding: usize,
    committing: bool,
    header: Vec<u32>,
}

pub struct Log {
    /// First block of the on-disk log region (the header block).
    start: u32,
    state: SleepableLock<LogState>,
}

impl Log {
    /// Reads the on-disk header at `start` and replays any committed
    /// transaction found there (crash recovery).
    pub fn new(kernel: &Kernel, dev: &Device, start: u32) -> Self {
        let log = Self {
            start,
            state: SleepableLock::new(
                "log",
                LogState {
                    outstanding: 0,
                    committing: false,
                    header: Vec::with_capacity(LOGSIZE),
                },
            ),
        };
        log.recover(kernel, dev);
        log
    }

    fn read_header(&self, kernel: &Kernel, dev: &Device) -> Vec<u32> {
        let buf = kernel.devices.bread(&kernel.bcache, dev, self.start);
        let n = u32::from_ne_bytes(buf[0..4].try_into().unwrap()) as usize;
        (0..n)
            .map(|i| {
                let off = 4 + i * 4;
                u32::from_ne_bytes(buf[off..off + 4].try_into().unwrap())
            })
            .collect()
    }

    fn write_header(&self, kernel: &Kernel, dev: &Device, header: &[u32]) {
        let mut buf = kernel.devices.bread(&kernel.bcache, dev, self.start);
        buf[0..4].copy_from_slice(&(header.len() as u32).to_ne_bytes());
        for (i, b) in header.iter().enumerate() {
            let off = 4 + i * 4;
            buf[off..off + 4].copy_from_slice(&b.to_ne_bytes());
        }
        kernel.devices.bwrite(dev, &buf);
    }

    fn recover(&self, kernel: &Kernel, dev: &Device) {
        let header = self.read_header(kernel, dev);
        if header.is_empty() {
            return;
        }
        self.install(kernel, dev, &header);
        self.write_header(kernel, dev, &[]);
    }

    /// Copies each logged block from its log slot to its home location.
    fn install(&self, kernel: &Kernel, dev: &Device, header: &[u32]) {
        for (tail, &blockno) in header.iter().enumerate() {
            let log_block = self.start + 1 + tail as u32;
            let log_buf = kernel.devices.bread(&kernel.bcache, dev, log_block);
            let mut home = kernel.bcache.get(dev.id, crate::bio::BufId::Block(blockno), crate::bio::Hint::Default);
            home.copy_from_slice(&log_buf[..]);
            kernel.devices.bwrite(dev, &home);
            home.mark_valid();
            // Safe to recycle now that the block is durable at its home
            // location; otherwise every block ever logged stays pinned
            // forever (bio.rs only recycles `refcnt == 0 && !dirty`).
            home.clear_dirty();
        }
    }

    /// Blocks the calling thread while `committing` is set, or while
    /// logging one more block's worth of operations would overflow
    /// `LOGSIZE`. Otherwise registers one outstanding operation.
    pub fn begin_op(&self) {
        let mut state = self.state.lock();
        loop {
            if state.committing || state.header.len() + 1 > LOGSIZE {
                state.sleep();
                continue;
            }
            state.outstanding += 1;
            return;
        }
    }

    /// Ends one outstanding operation. If this was the last one, runs
    /// `commit` with the list lock released, then wakes waiters.
    pub fn end_op(&self, kernel: &Kernel, dev: &Device) {
        let mut state = self.state.lock();
        state.outstanding -= 1;
        assert!(!state.committing, "end_op: already committing");
        let do_commit = state.outstanding == 0;
        if do_commit {
            state.committing = true;
        }
        drop(state);

        if do_commit {
            self.commit(kernel, dev);
            let mut state = self.state.lock();
            state.committing = false;
            state.wakeup();
        }
    }

    /// Records that `blockno` was modified inside the current
    /// transaction; absorbs repeat writes to the same block. Marks the
    /// buffer DIRTY so the cache will not recycle it before `commit`.
    pub fn log_write(&self, buf: &crate::bio::Buf<'_>) {
        let blockno = buf.blockno();
        let mut state = self.state.lock();
        assert!(state.outstanding >= 1, "log_write outside a transaction");
        if !state.header.contains(&blockno) {
            assert!(state.header.len() < LOGSIZE, "log_write: transaction too big");
            state.header.push(blockno);
        }
        buf.mark_dirty();
    }

    fn commit(&self, kernel: &Kernel, dev: &Device) {
        let header = self.state.lock().header.clone();
        if header.is_empty() {
            return;
        }
        for (tail, &blockno) in header.iter().enumerate() {
            let cached = kernel.bcache.get(dev.id, crate::bio::BufId::Block(blockno), crate::bio::Hint::Default);
            let mut log_buf = kernel.devices.bread(&kernel.bcache, dev, self.start + 1 + tail as u32);
            log_buf.copy_from_slice(&cached[..]);
            kernel.devices.bwrite(dev, &log_buf);
        }
        // Persisting the header is the true commit point.
        self.write_header(kernel, dev, &header);
        self.install(kernel, dev, &header);
        self.write_header(kernel, dev, &[]);
        self.state.lock().header.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceBackend;

    fn test_kernel() -> (Kernel, std::sync::Arc<Device>) {
        let kernel = Kernel::new();
        let dev = kernel.devices.get_or_create_ide_device(0);
        (kernel, dev)
    }

    #[test]
    fn absorbs_repeat_writes_to_same_block() {
        let (kernel, dev) = test_kernel();
        let log = Log::new(&kernel, &dev, 2);
        log.begin_op();
        {
            let b = kernel.devices.bread(&kernel.bcache, &dev, 10);
            log.log_write(&b);
        }
        {
            let b = kernel.devices.bread(&kernel.bcache, &dev, 10);
            log.log_write(&b);
        }
        assert_eq!(log.state.lock().header.len(), 1);
        log.end_op(&kernel, &dev);
    }

    #[test]
    fn commit_persists_block_contents() {
        let (kernel, dev) = test_kernel();
        let log = Log::new(&kernel, &dev, 2);
        log.begin_op();
        {
            let mut b = kernel.devices.bread(&kernel.bcache, &dev, 50);
            b[0] = 7;
            log.log_write(&b);
        }
        log.end_op(&kernel, &dev);

        kernel.bcache.invalidate_blocks(dev.id);
        let b = kernel.devices.bread(&kernel.bcache, &dev, 50);
        assert_eq!(b[0], 7);
    }
}
