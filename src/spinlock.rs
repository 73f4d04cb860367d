//! Spinlocks protect data shared between harts running in parallel.
//!
//! A hart holding a spinlock must not be preempted: other harts burn cycles
//! spinning while the holder is off the hart, and an interrupt handler on
//! the same hart could try to take the lock again and deadlock. Acquisition
//! therefore disables preemption on the local hart (through the installed
//! [`HartRuntime`]) and release re-enables it.
//!
//! The lock is a smart pointer: the protected value lives inside the lock
//! and is reachable only through the guard returned by `lock()`. References
//! to the data always go through an acquisition, so unlocked access is
//! unrepresentable, and dropping the guard releases the lock.
//!
//! [`HartRuntime`]: crate::hart::HartRuntime

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, AtomicIsize, Ordering},
};

use crate::hart;

pub struct SpinLock<T: ?Sized> {
    locked: AtomicBool,
    name: &'static str, // for debugging
    // Hart currently holding the lock, -1 when unheld. Re-acquisition on
    // the same hart would spin forever; with the holder recorded it panics
    // with the lock's name instead.
    hart: AtomicIsize,
    data: UnsafeCell<T>,
}

// Handing out `&mut T` from whichever hart acquires the lock moves T
// between harts, so the lock is only Sync for T: Send.
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            locked: AtomicBool::new(false),
            name,
            hart: AtomicIsize::new(-1),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.acquire();
        SpinLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn acquire(&self) {
        hart::push_off();
        if self.holding() {
            panic!("acquire {}", self.name);
        }

        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }

        self.hart
            .store(hart::runtime().hart_id() as isize, Ordering::Relaxed);
    }

    fn release(&self) {
        if !self.holding() {
            panic!("release {}", self.name);
        }
        self.hart.store(-1, Ordering::Relaxed);
        // Release ordering pairs with the Acquire in `acquire`: writes made
        // under the lock are visible to the next holder.
        self.locked.store(false, Ordering::Release);
        hart::pop_off();
    }

    /// Whether the calling hart holds the lock. Preemption must be off.
    fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
            && self.hart.load(Ordering::Relaxed) == hart::runtime().hart_id() as isize
    }
}

pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    data: &'a mut T,
}

impl<'a, T: ?Sized> Deref for SpinLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}
