//! Buffer cache.
//!
//! The buffer cache holds cached copies of disk block contents. Caching
//! blocks in memory reduces the number of disk reads and also provides a
//! synchronization point for blocks used by multiple processes.
//!
//! Interface:
//! * To get a buffer for a particular disk block, call `bread`.
//! * After changing buffer data, call `write` on the guard.
//! * When done with the buffer, drop the guard.
//! * Only one process at a time can use a buffer, so do not keep guards
//!   longer than necessary.
//!
//! Two caches implement this interface. [`lru::Bcache`] keeps one
//! most-recently-used list under a single lock; simple, strictly LRU, and
//! every operation serializes on that lock. [`sharded::Bcache`] spreads the
//! same semantics over hash buckets with per-bucket locks, so parallel
//! harts contend only on a miss.

pub mod lru;
pub mod sharded;

use core::ops::{Deref, DerefMut};
use core::sync::atomic::AtomicBool;

use crate::param::BSIZE;
use crate::sleeplock::SleepLock;

/// Performs the actual I/O for one block. Transfers are synchronous:
/// `read` and `write` return once the data has moved, and may sleep. The
/// cache calls both with the buffer's sleep-lock held.
pub trait BlockDevice: Sync {
    /// Fill `data` from block `(dev, blockno)`.
    fn read(&self, dev: u32, blockno: u32, data: &mut BufData);

    /// Flush `data` to block `(dev, blockno)`.
    fn write(&self, dev: u32, blockno: u32, data: &BufData);
}

/// One block's payload.
#[repr(C, align(8))]
pub struct BufData([u8; BSIZE]);

impl BufData {
    pub const fn new() -> Self {
        Self([0; BSIZE])
    }
}

impl Deref for BufData {
    type Target = [u8; BSIZE];
    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for BufData {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// A buffer slot: the payload under its sleep-lock, plus the flag saying
/// whether the payload currently reflects the disk contents.
pub(crate) struct Buf {
    // has data been read from disk?
    pub(crate) valid: AtomicBool,
    pub(crate) data: SleepLock<BufData>,
}

impl Buf {
    pub(crate) const fn new() -> Self {
        Self {
            valid: AtomicBool::new(false),
            data: SleepLock::new(BufData::new(), "buffer"),
        }
    }
}
