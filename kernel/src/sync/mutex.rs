//! Sleeping mutex that yields to the scheduler instead of spinning.
//!
//! Contention on an already-held lock gives up the rest of the current
//! timeslice via [`crate::task::scheduler::yield_now`] rather than burning
//! cycles in a spin loop — appropriate once a real scheduler exists to hand
//! the CPU to once a real scheduler exists to hand it to.

use crate::sync::spinlock::Spinlock;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

/// A mutex that yields the current process if the lock is held.
pub struct Mutex<T> {
    inner: Spinlock<MutexInner>,
    data: UnsafeCell<T>,
}

struct MutexInner {
    locked: bool,
}

unsafe impl<T: Send> Sync for Mutex<T> {}
unsafe impl<T: Send> Send for Mutex<T> {}

/// RAII guard for a held [`Mutex`].
///
/// Provides `Deref`/`DerefMut` access to the protected data. Releases the
/// mutex when dropped.
pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<T> Mutex<T> {
    /// Create a new unlocked mutex wrapping the given data.
    pub const fn new(data: T) -> Self {
        Mutex {
            inner: Spinlock::new(MutexInner { locked: false }),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the mutex, blocking until it becomes available.
    pub fn lock(&self) -> MutexGuard<T> {
        loop {
            {
                let mut inner = self.inner.lock();
                if !inner.locked {
                    inner.locked = true;
                    return MutexGuard { mutex: self };
                }
            }
            crate::task::scheduler::yield_now();
        }
    }
}

impl<'a, T> Deref for MutexGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<'a, T> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<'a, T> Drop for MutexGuard<'a, T> {
    fn drop(&mut self) {
        let mut inner = self.mutex.inner.lock();
        inner.locked = false;
    }
}
