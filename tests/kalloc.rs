//! Frame-allocator scenarios: junk poisoning, cross-hart stealing, and the
//! frame-partition audit — every frame is on exactly one list or in
//! exactly one caller's hands.

mod common;

use teachos::kalloc::{Frame, Kmem, PerHartKmem};
use teachos::param::PGSIZE;

#[test]
fn poison_patterns() {
    let kmem = Kmem::new();
    let (start, end) = common::arena(2);
    unsafe { kmem.init(start, end) };

    let frame = kmem.alloc().unwrap();
    let p = frame.as_ptr();
    for off in [0, 1, 8, PGSIZE / 2, PGSIZE - 1] {
        assert_eq!(0x05, unsafe { *p.add(off) }, "alloc junk at offset {off}");
    }

    let addr = frame.addr();
    unsafe { kmem.free(frame) };
    // The first word now carries the free-list link; the junk fill is
    // visible everywhere past it.
    for off in [8, 9, PGSIZE / 2, PGSIZE - 1] {
        assert_eq!(
            0x01,
            unsafe { *((addr + off) as *const u8) },
            "free junk at offset {off}"
        );
    }
}

#[test]
fn steals_from_loaded_hart() {
    let kmem = PerHartKmem::new();
    let (start, end) = common::arena(4);

    // Seed everything on hart 0, then allocate from hart 1.
    common::as_hart(0, || unsafe { kmem.init(start, end) });
    assert_eq!(4, kmem.free_frames());

    let frame = common::as_hart(1, || kmem.alloc()).expect("steal failed with frames available");
    assert_eq!(3, kmem.free_frames());
    assert_eq!(0x05, unsafe { *frame.as_ptr() });

    // Freeing from hart 1 lands on hart 1's list; the frame stays counted.
    common::as_hart(1, || unsafe { kmem.free(frame) });
    assert_eq!(4, kmem.free_frames());
}

#[test]
fn per_hart_lifo_round_trip() {
    let kmem = PerHartKmem::new();
    let (start, end) = common::arena(4);
    common::as_hart(2, || {
        unsafe { kmem.init(start, end) };
        let frame = kmem.alloc().unwrap();
        let addr = frame.addr();
        unsafe { kmem.free(frame) };
        assert_eq!(addr, kmem.alloc().unwrap().addr());
    });
}

#[test]
fn exhaustion_after_stealing_everything() {
    let kmem = PerHartKmem::new();
    let (start, end) = common::arena(3);
    common::as_hart(0, || unsafe { kmem.init(start, end) });

    let held: Vec<Frame> = common::as_hart(3, || (0..3).map(|_| kmem.alloc().unwrap()).collect());
    assert!(common::as_hart(3, || kmem.alloc()).is_none());
    assert!(common::as_hart(0, || kmem.alloc()).is_none());

    for frame in held {
        common::as_hart(0, || unsafe { kmem.free(frame) });
    }
    assert_eq!(3, kmem.free_frames());
}

#[test]
fn frames_partition_under_parallel_churn() {
    const PAGES: usize = 16;

    let kmem = PerHartKmem::new();
    let (start, end) = common::arena(PAGES);
    common::as_hart(0, || unsafe { kmem.init(start, end) });

    let mut held: Vec<Frame> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|hart| {
                let kmem = &kmem;
                s.spawn(move || {
                    common::as_hart(hart, || {
                        let mut rng = common::XorShift::new(0xFA11 + hart as u64);
                        let mut mine: Vec<Frame> = Vec::new();
                        for _ in 0..400 {
                            if rng.next() % 2 == 0 {
                                if let Some(frame) = kmem.alloc() {
                                    mine.push(frame);
                                }
                            } else if !mine.is_empty() {
                                let i = (rng.next() as usize) % mine.len();
                                unsafe { kmem.free(mine.swap_remove(i)) };
                            }
                        }
                        mine
                    })
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect()
    });

    // Whatever the interleaving, no frame was lost or duplicated.
    assert_eq!(PAGES, kmem.free_frames() + held.len());
    let mut addrs: Vec<usize> = held.iter().map(|f| f.addr()).collect();
    addrs.sort_unstable();
    addrs.dedup();
    assert_eq!(held.len(), addrs.len(), "two callers hold the same frame");
    for addr in &addrs {
        assert_eq!(0, addr % PGSIZE);
        assert!((start..end).contains(addr));
    }

    common::as_hart(0, || {
        for frame in held.drain(..) {
            unsafe { kmem.free(frame) };
        }
    });
    assert_eq!(PAGES, kmem.free_frames());
}
