//! Scaled cache: the same bread/write/release semantics spread over
//! NBUCKET hash buckets keyed by block number, each bucket list under its
//! own lock. A hit touches only its bucket's lock, so parallel harts
//! working on different blocks no longer serialize. Misses funnel through
//! one eviction lock and steal the stalest unused buffer from any bucket;
//! a per-buffer release timestamp stands in for the global recency list.
//!
//! Lock ordering:
//! 1. the eviction lock is acquired before any bucket lock;
//! 2. the victim search holds at most one bucket lock at a time, and the
//!    cross-bucket splice releases the source bucket before locking the
//!    destination;
//! 3. no spinlock is held while taking a buffer's sleep-lock.
//!
//! Rule 1 makes all miss handling mutually exclusive; rules 2 and 3 leave
//! no nested acquisition that could close a cycle.

use core::cell::UnsafeCell;
use core::sync::atomic::Ordering;

use array_macro::array;
use log::{debug, trace};

use super::{BlockDevice, Buf, BufData};
use crate::clock;
use crate::param::{NBUCKET, NBUF};
use crate::sleeplock::SleepLockGuard;
use crate::spinlock::SpinLock;

const BUCKET_NAMES: [&str; NBUCKET] = [
    "bcache.bucket0",
    "bcache.bucket1",
    "bcache.bucket2",
    "bcache.bucket3",
    "bcache.bucket4",
    "bcache.bucket5",
    "bcache.bucket6",
    "bcache.bucket7",
    "bcache.bucket8",
    "bcache.bucket9",
    "bcache.bucket10",
    "bcache.bucket11",
    "bcache.bucket12",
];

fn hash(blockno: u32) -> usize {
    blockno as usize % NBUCKET
}

pub struct Bcache<D, const N: usize = NBUF> {
    disk: D,
    // Serializes miss handling: every transition of a buffer's refcnt from
    // 0 to 1 that rebinds its identity happens under this lock.
    hash_lock: SpinLock<()>,
    buckets: [SpinLock<()>; NBUCKET],
    // Node i < N is buffer i's metadata; node N + b is bucket b's list
    // sentinel. A node is guarded by the lock of the bucket whose list it
    // is currently on, which only phase-3 eviction ever changes.
    meta: [UnsafeCell<BufMeta>; N],
    heads: [UnsafeCell<BufMeta>; NBUCKET],
    bufs: [Buf; N],
}

unsafe impl<D: BlockDevice, const N: usize> Sync for Bcache<D, N> {}

impl<D: BlockDevice, const N: usize> Bcache<D, N> {
    pub const fn new(disk: D) -> Self {
        Self {
            disk,
            hash_lock: SpinLock::new((), "bcache.hash"),
            buckets: array![b => SpinLock::new((), BUCKET_NAMES[b]); NBUCKET],
            meta: array![_ => UnsafeCell::new(BufMeta::new()); N],
            heads: array![_ => UnsafeCell::new(BufMeta::new()); NBUCKET],
            bufs: array![_ => Buf::new(); N],
        }
    }

    /// Seed every buffer onto bucket 0's list; stealing spreads them over
    /// the table on demand. Call once before use.
    pub fn init(&self) {
        let _hash = self.hash_lock.lock();
        for b in 0..NBUCKET {
            let _bucket = self.buckets[b].lock();
            unsafe {
                let s = self.node(N + b);
                s.prev = N + b;
                s.next = N + b;
            }
        }
        let _bucket = self.buckets[0].lock();
        let now = clock::tick_now();
        for i in 0..N {
            unsafe {
                self.node(i).timestamp = now;
                self.link_front(0, i);
            }
        }
        debug!("bcache: {} buffers across {} buckets", N, NBUCKET);
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

    /// Look through the cache for the block; if it is absent, rebind the
    /// stalest unused buffer to it. Either way, return the buffer
    /// sleep-locked.
    fn bget(&self, dev: u32, blockno: u32) -> BufGuard<'_, D, N> {
        let h = hash(blockno);

        // Fast path: the block is already in its bucket.
        {
            let _bucket = self.buckets[h].lock();
            if let Some(index) = unsafe { self.scan(h, dev, blockno) } {
                drop(_bucket);
                return self.guard(index, dev, blockno);
            }
        }

        // Miss. Serialize eviction, then rescan: another hart may have
        // bound this very block while the bucket lock was released above.
        let hash_guard = self.hash_lock.lock();
        {
            let _bucket = self.buckets[h].lock();
            if let Some(index) = unsafe { self.scan(h, dev, blockno) } {
                drop(_bucket);
                drop(hash_guard);
                return self.guard(index, dev, blockno);
            }
        }

        // Really absent. Steal the stalest unused buffer, searching one
        // bucket at a time and settling for the first bucket that has any.
        for b in 0..NBUCKET {
            let bucket = self.buckets[b].lock();

            let mut victim: Option<(usize, u32)> = None;
            unsafe {
                let s = N + b;
                let mut i = self.node(s).next;
                while i != s {
                    let m = self.node(i);
                    let next = m.next;
                    if m.refcnt == 0 && victim.map_or(true, |(_, ts)| m.timestamp < ts) {
                        victim = Some((i, m.timestamp));
                    }
                    i = next;
                }
            }

            if let Some((index, _)) = victim {
                unsafe {
                    let m = self.node(index);
                    m.dev = dev;
                    m.blockno = blockno;
                    m.refcnt = 1;
                }
                self.bufs[index].valid.store(false, Ordering::Relaxed);
                trace!("bcache: rebind buf{} (bucket{} -> bucket{})", index, b, h);

                if b != h {
                    unsafe { self.unlink(index) };
                    drop(bucket);
                    let _dst = self.buckets[h].lock();
                    unsafe { self.link_front(h, index) };
                } else {
                    drop(bucket);
                }
                drop(hash_guard);
                return self.guard(index, dev, blockno);
            }

            drop(bucket);
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

    fn brelse(&self, index: usize, blockno: u32) {
        let _bucket = self.buckets[hash(blockno)].lock();
        unsafe {
            let m = self.node(index);
            m.refcnt -= 1;
            if m.refcnt == 0 {
                m.timestamp = clock::tick_now();
            }
        }
    }

    fn pin(&self, index: usize, blockno: u32) {
        let _bucket = self.buckets[hash(blockno)].lock();
        unsafe { self.node(index).refcnt += 1 };
    }

    fn unpin(&self, index: usize, blockno: u32) {
        let _bucket = self.buckets[hash(blockno)].lock();
        unsafe { self.node(index).refcnt -= 1 };
    }

    /// Validate the bucket lists at a quiescent point: every buffer sits on
    /// exactly one list, an in-use or valid buffer sits on the bucket its
    /// block number hashes to, and no two buffers are bound to the same
    /// block. Takes the eviction lock and then every bucket lock, so it
    /// cannot run concurrently with a miss.
    pub fn check_invariants(&self) {
        let _hash = self.hash_lock.lock();
        let _buckets = array![b => self.buckets[b].lock(); NBUCKET];

        let mut seen = [false; N];
        let mut bound = [(0u32, 0u32, false); N];
        for b in 0..NBUCKET {
            let s = N + b;
            let mut i = unsafe { self.node(s).next };
            while i != s {
                assert!(i < N, "bcache: corrupt bucket list");
                assert!(!seen[i], "bcache: buffer on two lists");
                seen[i] = true;
                let (dev, blockno, refcnt, next) = unsafe {
                    let m = self.node(i);
                    (m.dev, m.blockno, m.refcnt, m.next)
                };
                let in_use = refcnt > 0 || self.bufs[i].valid.load(Ordering::Relaxed);
                if in_use {
                    assert_eq!(b, hash(blockno), "bcache: buffer outside its bucket");
                }
                bound[i] = (dev, blockno, in_use);
                i = next;
            }
        }
        for i in 0..N {
            assert!(seen[i], "bcache: buffer fell off the bucket lists");
            for j in 0..i {
                if bound[i].2 && bound[j].2 {
                    assert!(
                        (bound[i].0, bound[i].1) != (bound[j].0, bound[j].1),
                        "bcache: two buffers bound to one block"
                    );
                }
            }
        }
    }

    /// Sum of live references across all buffers. At a quiescent point
    /// this equals references taken (`bread` plus `pin`) minus references
    /// given back (releases plus `unpin`). Takes the eviction lock and
    /// then every bucket lock so the snapshot is consistent.
    pub fn total_refcnt(&self) -> usize {
        let _hash = self.hash_lock.lock();
        let _buckets = array![b => self.buckets[b].lock(); NBUCKET];

        let mut total = 0;
        for i in 0..N {
            total += unsafe { self.node(i).refcnt };
        }
        total
    }

    /// Node `i`: buffer metadata for `i < N`, bucket sentinel for `N + b`.
    ///
    /// # Safety
    /// Caller must hold the lock of the bucket the node is on, and must not
    /// hold two references to the same node.
    #[allow(clippy::mut_from_ref)]
    unsafe fn node(&self, i: usize) -> &mut BufMeta {
        if i < N {
            &mut *self.meta[i].get()
        } else {
            &mut *self.heads[i - N].get()
        }
    }

    /// Search bucket `h` for the block; a hit takes a reference. Caller
    /// holds the bucket's lock.
    unsafe fn scan(&self, h: usize, dev: u32, blockno: u32) -> Option<usize> {
        let s = N + h;
        let mut i = self.node(s).next;
        while i != s {
            let m = self.node(i);
            if m.dev == dev && m.blockno == blockno {
                m.refcnt += 1;
                return Some(i);
            }
            i = m.next;
        }
        None
    }

    /// Caller holds the lock of the bucket node `i` is on.
    unsafe fn unlink(&self, i: usize) {
        let (prev, next) = {
            let n = self.node(i);
            (n.prev, n.next)
        };
        self.node(prev).next = next;
        self.node(next).prev = prev;
    }

    /// Caller holds `bucket`'s lock; node `i` is on no list.
    unsafe fn link_front(&self, bucket: usize, i: usize) {
        let s = N + bucket;
        let first = self.node(s).next;
        {
            let n = self.node(i);
            n.prev = s;
            n.next = first;
        }
        self.node(first).prev = i;
        self.node(s).next = i;
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
    ///
    /// Taking the bucket from the guard's block number is sound because a
    /// guard keeps `refcnt > 0`, and a counted buffer is never rebound or
    /// moved between buckets.
    pub fn pin(&self) {
        self.cache.pin(self.index, self.blockno);
    }

    /// Undo one `pin`.
    pub fn unpin(&self) {
        self.cache.unpin(self.index, self.blockno);
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
        // Release the sleep-lock before taking the bucket lock.
        drop(self.data.take());
        self.cache.brelse(self.index, self.blockno);
    }
}

/// Metadata for one buffer slot, plus the bucket-list links.
struct BufMeta {
    dev: u32,
    blockno: u32,
    refcnt: usize,
    // Tick of the release that last dropped refcnt to zero; the eviction
    // victim is the smallest stamp among unused buffers.
    timestamp: u32,
    prev: usize,
    next: usize,
}

impl BufMeta {
    const fn new() -> Self {
        Self {
            dev: 0,
            blockno: 0,
            refcnt: 0,
            timestamp: 0,
            prev: 0,
            next: 0,
        }
    }
}
