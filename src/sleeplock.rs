//! Long-term locks for use across blocking operations.
//!
//! Disk I/O takes milliseconds. A hart must not busy-wait that long, and
//! preemption has to stay enabled while the holder sleeps inside a driver,
//! so a spinlock is the wrong tool for protecting a buffer's contents. The
//! sleep-lock covers this case: contending callers keep preemption on and
//! give up the hart between probes of the `locked` flag, which is itself
//! guarded by a short-lived spinlock.
//!
//! Spinlocks must never be held across [`SleepLock::lock`]; the wait can
//! suspend the caller indefinitely.

use core::{
    cell::Cell,
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
};

use crate::{hart, spinlock::SpinLock};

pub struct SleepLock<T> {
    inner: SpinLock<()>,
    locked: Cell<bool>, // guarded by `inner`
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            inner: SpinLock::new((), name),
            locked: Cell::new(false),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let mut guard = self.inner.lock();
        while self.locked.get() {
            // Probe again after the holder has had a chance to run; the
            // inner lock is dropped first so the wait suspends bare.
            drop(guard);
            hart::yield_now();
            guard = self.inner.lock();
        }
        self.locked.set(true);
        drop(guard);

        SleepLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    /// called by the guard when dropped
    fn unlock(&self) {
        let guard = self.inner.lock();
        self.locked.set(false);
        drop(guard);
    }
}

pub struct SleepLockGuard<'a, T> {
    lock: &'a SleepLock<T>,
    data: &'a mut T,
}

impl<'a, T> Deref for SleepLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &*self.data
    }
}

impl<'a, T> DerefMut for SleepLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T> Drop for SleepLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
