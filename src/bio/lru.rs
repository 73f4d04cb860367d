//! Baseline cache: one spinlock over all buffer metadata plus a doubly
//! linked list ordered by recency of use. `bget` scans forward from the
//! head for a hit and backward from the tail for a victim, so reclamation
//! is strictly least-recently-used.

use core::sync::atomic::Ordering;

use array_macro::array;
use log::debug;

use super::{BlockDevice, Buf, BufData};
use crate::param::NBUF;
use crate::sleeplock::SleepLockGuard;
use crate::spinlock::SpinLock;

pub struct Bcache<D, const N: usize = NBUF> {
    disk: D,
    lru: SpinLock<LruList<N>>,
    bufs: [Buf; N],
}

impl<D: BlockDevice, const N: usize> Bcache<D, N> {
    pub const fn new(disk: D) -> Self {
        Self {
            disk,
            lru: SpinLock::new(LruList::new(), "bcache"),
            bufs: array![_ => Buf::new(); N],
        }
    }

    /// Link every buffer onto the recency list. Call once before use.
    pub fn init(&self) {
        self.lru.lock().init();
        debug!("bcache: {} buffers", N);
    }

    /// Return a locked buffer with the contents of the indicated block.
    pub fn bread(&self, dev: u32, blockno: u32) -> BufGuard<'_, D, N> {
        let mut b = self.bget(dev, blockno);
        if !self.bufs[b.index].valid.load(Ordering::Relaxed) {
            self.disk.read(dev, blockno, b.data_mut());
            self.bufs[b.index].valid.store(true, Ordering::Relaxed);
        }
        b
    }

    /// Look through the cache for the block; if it is absent, rebind an
    /// unused buffer to it. Either way, return the buffer sleep-locked.
    fn bget(&self, dev: u32, blockno: u32) -> BufGuard<'_, D, N> {
        let mut lru = self.lru.lock();

        // Is the block already cached?
        if let Some(index) = lru.find(dev, blockno) {
            drop(lru);
            return self.guard(index, dev, blockno);
        }

        // Not cached. Recycle the least recently used unused buffer.
        if let Some(index) = lru.recycle(dev, blockno) {
            self.bufs[index].valid.store(false, Ordering::Relaxed);
            drop(lru);
            return self.guard(index, dev, blockno);
        }

        panic!("bget: no buffers");
    }

    /// The reference is counted; the sleep-lock is taken with no spinlock
    /// held.
    fn guard(&self, index: usize, dev: u32, blockno: u32) -> BufGuard<'_, D, N> {
        BufGuard {
            cache: self,
            index,
            dev,
            blockno,
            data: Some(self.bufs[index].data.lock()),
        }
    }

    fn brelse(&self, index: usize) {
        self.lru.lock().brelse(index);
    }

    fn pin(&self, index: usize) {
        self.lru.lock().meta[index].refcnt += 1;
    }

    fn unpin(&self, index: usize) {
        self.lru.lock().meta[index].refcnt -= 1;
    }

    /// Sum of live references across all buffers. At a quiescent point
    /// this equals references taken (`bread` plus `pin`) minus references
    /// given back (releases plus `unpin`).
    pub fn total_refcnt(&self) -> usize {
        let lru = self.lru.lock();
        lru.meta.iter().map(|m| m.refcnt).sum()
    }
}

/// A locked buffer. Dereferences to the block payload; dropping it gives
/// the buffer back to the cache.
pub struct BufGuard<'a, D: BlockDevice, const N: usize> {
    cache: &'a Bcache<D, N>,
    index: usize,
    dev: u32,
    blockno: u32,
    data: Option<SleepLockGuard<'a, BufData>>,
}

impl<'a, D: BlockDevice, const N: usize> BufGuard<'a, D, N> {
    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn blockno(&self) -> u32 {
        self.blockno
    }

    /// Flush the buffer's contents to disk.
    pub fn write(&mut self) {
        let data = self.data.as_ref().unwrap();
        self.cache.disk.write(self.dev, self.blockno, data);
    }

    /// Keep the buffer resident after this guard is dropped. Used by the
    /// transaction log to hold a written block in the cache until commit.
    pub fn pin(&self) {
        self.cache.pin(self.index);
    }

    /// Undo one `pin`.
    pub fn unpin(&self) {
        self.cache.unpin(self.index);
    }

    fn data_mut(&mut self) -> &mut BufData {
        self.data.as_mut().unwrap()
    }
}

impl<'a, D: BlockDevice, const N: usize> core::ops::Deref for BufGuard<'a, D, N> {
    type Target = BufData;
    fn deref(&self) -> &Self::Target {
        self.data.as_ref().unwrap()
    }
}

impl<'a, D: BlockDevice, const N: usize> core::ops::DerefMut for BufGuard<'a, D, N> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data.as_mut().unwrap()
    }
}

impl<'a, D: BlockDevice, const N: usize> Drop for BufGuard<'a, D, N> {
    fn drop(&mut self) {
        // Release the sleep-lock before touching the recency list; the
        // list lock is a spinlock.
        drop(self.data.take());
        self.cache.brelse(self.index);
    }
}

/// Metadata for one buffer slot. `prev`/`next` are indices into the
/// metadata arena; index `N` is the list sentinel.
struct BufMeta {
    dev: u32,
    blockno: u32,
    refcnt: usize,
    prev: usize,
    next: usize,
}

impl BufMeta {
    const fn new() -> Self {
        Self {
            dev: 0,
            blockno: 0,
            refcnt: 0,
            prev: 0,
            next: 0,
        }
    }
}

/// Doubly linked recency list through an index arena. `sentinel.next` is
/// the most recently used buffer, `sentinel.prev` the least.
struct LruList<const N: usize> {
    meta: [BufMeta; N],
    sentinel: BufMeta,
}

impl<const N: usize> LruList<N> {
    const fn new() -> Self {
        Self {
            meta: array![_ => BufMeta::new(); N],
            sentinel: BufMeta::new(),
        }
    }

    fn node(&mut self, i: usize) -> &mut BufMeta {
        if i == N {
            &mut self.sentinel
        } else {
            &mut self.meta[i]
        }
    }

    fn init(&mut self) {
        self.sentinel.prev = N;
        self.sentinel.next = N;
        for i in 0..N {
            self.link_front(i);
        }
    }

    fn unlink(&mut self, i: usize) {
        let (prev, next) = {
            let n = self.node(i);
            (n.prev, n.next)
        };
        self.node(prev).next = next;
        self.node(next).prev = prev;
    }

    fn link_front(&mut self, i: usize) {
        let first = self.sentinel.next;
        {
            let n = self.node(i);
            n.prev = N;
            n.next = first;
        }
        self.node(first).prev = i;
        self.sentinel.next = i;
    }

    fn find(&mut self, dev: u32, blockno: u32) -> Option<usize> {
        let mut i = self.sentinel.next;
        while i != N {
            let m = &mut self.meta[i];
            if m.dev == dev && m.blockno == blockno {
                m.refcnt += 1;
                return Some(i);
            }
            i = m.next;
        }
        None
    }

    /// Backward scan: `sentinel.prev` is the least recently used position.
    fn recycle(&mut self, dev: u32, blockno: u32) -> Option<usize> {
        let mut i = self.sentinel.prev;
        while i != N {
            let m = &mut self.meta[i];
            if m.refcnt == 0 {
                m.dev = dev;
                m.blockno = blockno;
                m.refcnt = 1;
                return Some(i);
            }
            i = m.prev;
        }
        None
    }

    /// On last release, move the buffer to the head of the recency list.
    fn brelse(&mut self, i: usize) {
        self.meta[i].refcnt -= 1;
        if self.meta[i].refcnt == 0 {
            self.unlink(i);
            self.link_front(i);
        }
    }
}
