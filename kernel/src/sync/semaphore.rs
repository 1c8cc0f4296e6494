//! Counting semaphore for resource-count-based synchronization.
//!
//! Yields to the scheduler while the count is zero rather than spinning.

use crate::sync::spinlock::Spinlock;

/// Counting semaphore.
pub struct Semaphore {
    inner: Spinlock<SemaphoreInner>,
}

struct SemaphoreInner {
    count: i32,
}

impl Semaphore {
    /// Create a new semaphore with the given initial count.
    pub const fn new(initial: i32) -> Self {
        Semaphore {
            inner: Spinlock::new(SemaphoreInner { count: initial }),
        }
    }

    /// Decrement (wait/P operation). Blocks if count <= 0.
    pub fn wait(&self) {
        loop {
            {
                let mut inner = self.inner.lock();
                if inner.count > 0 {
                    inner.count -= 1;
                    return;
                }
            }
            crate::task::scheduler::yield_now();
        }
    }

    /// Increment (signal/V operation). The next waiter's poll will observe
    /// the incremented count on its following scheduler pass.
    pub fn signal(&self) {
        let mut inner = self.inner.lock();
        inner.count += 1;
    }

    /// Try to decrement the semaphore without blocking.
    ///
    /// Returns `true` if the count was positive and was decremented, `false` otherwise.
    pub fn try_wait(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.count > 0 {
            inner.count -= 1;
            true
        } else {
            false
        }
    }
}
