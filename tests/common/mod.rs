//! Shared scaffolding for the integration suites: a hart runtime backed by
//! std threads, an in-memory block device, and a deterministic generator
//! for randomized traces.

#![allow(dead_code)]

use std::cell::Cell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};

use teachos::bio::{BlockDevice, BufData};
use teachos::hart::{self, HartRuntime};
use teachos::param::{NCPU, PGSIZE};

thread_local! {
    static HART: Cell<Option<usize>> = Cell::new(None);
    static NOFF: Cell<usize> = Cell::new(0);
}

/// Test-harness hart runtime: threads are harts. Ids are handed out
/// round-robin on first use and can be pinned with [`as_hart`].
pub struct TestHarts {
    next: AtomicUsize,
}

impl HartRuntime for TestHarts {
    fn hart_id(&self) -> usize {
        HART.with(|h| match h.get() {
            Some(id) => id,
            None => {
                let id = self.next.fetch_add(1, Ordering::Relaxed) % NCPU;
                h.set(Some(id));
                id
            }
        })
    }

    fn push_off(&self) {
        NOFF.with(|n| n.set(n.get() + 1));
    }

    fn pop_off(&self) {
        NOFF.with(|n| {
            assert!(n.get() > 0, "pop_off without push_off");
            n.set(n.get() - 1);
        });
    }

    fn yield_now(&self) {
        std::thread::yield_now();
    }
}

static INSTALL: Once = Once::new();

pub fn install_runtime() {
    INSTALL.call_once(|| {
        let rt = Box::leak(Box::new(TestHarts {
            next: AtomicUsize::new(0),
        }));
        let _ = hart::set_runtime(rt);
    });
}

/// Run `f` with the calling thread pinned to hart `id`.
pub fn as_hart<R>(id: usize, f: impl FnOnce() -> R) -> R {
    assert!(id < NCPU);
    install_runtime();
    let prev = HART.with(|h| h.replace(Some(id)));
    let out = f();
    HART.with(|h| h.set(prev));
    out
}

struct DiskInner {
    reads: AtomicUsize,
    writes: AtomicUsize,
    blocks: Mutex<BTreeMap<(u32, u32), Vec<u8>>>,
}

/// Shareable in-memory device double. Clones see the same blocks and
/// counters, so a test keeps a handle to the disk it hands the cache and
/// can tell a hit from a miss.
#[derive(Clone)]
pub struct MemDisk(Arc<DiskInner>);

impl MemDisk {
    pub fn new() -> Self {
        MemDisk(Arc::new(DiskInner {
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            blocks: Mutex::new(BTreeMap::new()),
        }))
    }

    pub fn reads(&self) -> usize {
        self.0.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.0.writes.load(Ordering::SeqCst)
    }
}

impl BlockDevice for MemDisk {
    fn read(&self, dev: u32, blockno: u32, data: &mut BufData) {
        self.0.reads.fetch_add(1, Ordering::SeqCst);
        match self.0.blocks.lock().unwrap().get(&(dev, blockno)) {
            Some(block) => data.copy_from_slice(block),
            None => data.fill(0),
        }
    }

    fn write(&self, dev: u32, blockno: u32, data: &BufData) {
        self.0.writes.fetch_add(1, Ordering::SeqCst);
        self.0
            .blocks
            .lock()
            .unwrap()
            .insert((dev, blockno), data.to_vec());
    }
}

/// Page-aligned test arena for the frame allocators. Leaked; tests hand
/// the range to an allocator for the rest of the process.
pub fn arena(pages: usize) -> (usize, usize) {
    let layout = std::alloc::Layout::from_size_align(pages * PGSIZE, PGSIZE).unwrap();
    let p = unsafe { std::alloc::alloc(layout) };
    assert!(!p.is_null());
    (p as usize, p as usize + pages * PGSIZE)
}

/// Tiny deterministic generator for randomized traces.
pub struct XorShift(u64);

impl XorShift {
    pub fn new(seed: u64) -> Self {
        XorShift(if seed == 0 { 0x9e3779b9 } else { seed })
    }

    pub fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}
