//! Hart (hardware thread) runtime facade.
//!
//! A spinlock must keep its holder from being preempted: an interrupt
//! handler on the same hart could try to take the lock again and spin
//! forever. And a hart id is only meaningful while preemption is off; read
//! it afterwards and the caller may already be running somewhere else.
//!
//! The crate does not own interrupt control, so the hosting kernel (or the
//! test harness) installs a [`HartRuntime`] once at startup, the same way a
//! `log` logger is installed. Until one is installed the crate behaves as a
//! single hart with no preemption, which is exactly the situation during
//! early boot.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::param::NCPU;

/// What the hosting runtime provides to the locking layer.
pub trait HartRuntime: Sync {
    /// Id of the calling hart, in `0..NCPU`. The answer is stable only
    /// while preemption is disabled; bracket reads with `push_off`.
    fn hart_id(&self) -> usize;

    /// Disable preemption on the calling hart. Nests: two `push_off`s need
    /// two `pop_off`s.
    fn push_off(&self);

    /// Undo one `push_off`.
    fn pop_off(&self);

    /// Give up the hart while waiting on a sleep-lock. Called with
    /// preemption enabled and no spinlocks held.
    fn yield_now(&self);
}

/// Fallback for hosts that never install a runtime.
struct SingleHart;

impl HartRuntime for SingleHart {
    fn hart_id(&self) -> usize {
        0
    }
    fn push_off(&self) {}
    fn pop_off(&self) {}
    fn yield_now(&self) {
        core::hint::spin_loop();
    }
}

static SINGLE_HART: SingleHart = SingleHart;

const UNINITIALIZED: usize = 0;
const INITIALIZING: usize = 1;
const INITIALIZED: usize = 2;

static STATE: AtomicUsize = AtomicUsize::new(UNINITIALIZED);
static mut RUNTIME: &dyn HartRuntime = &SINGLE_HART;

/// Returned by [`set_runtime`] when a runtime is already installed.
#[derive(Debug)]
pub struct SetRuntimeError;

/// Install the hart runtime. Succeeds at most once, and must happen before
/// any secondary hart touches the locking layer.
pub fn set_runtime(rt: &'static dyn HartRuntime) -> Result<(), SetRuntimeError> {
    match STATE.compare_exchange(
        UNINITIALIZED,
        INITIALIZING,
        Ordering::Acquire,
        Ordering::Relaxed,
    ) {
        Ok(_) => {
            unsafe { RUNTIME = rt };
            STATE.store(INITIALIZED, Ordering::Release);
            Ok(())
        }
        Err(_) => Err(SetRuntimeError),
    }
}

pub(crate) fn runtime() -> &'static dyn HartRuntime {
    if STATE.load(Ordering::Acquire) == INITIALIZED {
        unsafe { RUNTIME }
    } else {
        &SINGLE_HART
    }
}

/// Id of the calling hart, read under a `push_off` bracket.
pub fn current() -> usize {
    let rt = runtime();
    rt.push_off();
    let id = rt.hart_id();
    rt.pop_off();
    debug_assert!(id < NCPU);
    id
}

#[inline]
pub(crate) fn push_off() {
    runtime().push_off();
}

#[inline]
pub(crate) fn pop_off() {
    runtime().pop_off();
}

#[inline]
pub(crate) fn yield_now() {
    runtime().yield_now();
}
