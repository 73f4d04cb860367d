//! Kernel tick counter.
//!
//! The buffer cache stamps a buffer with the tick of its last release and
//! evicts the stalest stamp. Reads are lock-free: the counter is a single
//! word and an approximate value is fine for a recency hint.

use core::sync::atomic::{AtomicU32, Ordering};

static TICKS: AtomicU32 = AtomicU32::new(0);

/// Current tick. Monotonically non-decreasing.
#[inline]
pub fn tick_now() -> u32 {
    TICKS.load(Ordering::Relaxed)
}

/// Advance the tick counter. Called by the hosting timer interrupt.
pub fn clock_tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
}
