//! Busy-wait lock for very short critical sections

use std::cell::UnsafeCell;
use std::hint;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

/// Spins between yields of the processor
const SPINS_PER_YIELD: u32 = 1000;

/// Test-and-set lock that spins, yielding the processor every
/// [`SPINS_PER_YIELD`] attempts.
///
/// Meant for critical sections of a few loads and stores on a hot path,
/// where parking a thread would cost more than the section itself.
///
/// # Example
///
/// ```
/// use flowtile_parallel::Spinlock;
///
/// let total = Spinlock::new(0u64);
/// std::thread::scope(|s| {
///     for _ in 0..4 {
///         s.spawn(|| *total.lock() += 1);
///     }
/// });
/// assert_eq!(total.into_inner(), 4);
/// ```
pub struct Spinlock<T> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

// SAFETY: access to `value` is serialized by `locked`
unsafe impl<T: Send> Send for Spinlock<T> {}
unsafe impl<T: Send> Sync for Spinlock<T> {}

impl<T> Spinlock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Spin until the lock is acquired
    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        let mut spins = 0u32;
        loop {
            if !self.locked.swap(true, Ordering::Acquire) {
                return SpinlockGuard { lock: self };
            }
            // Wait on a plain load so contended lines stay shared
            while self.locked.load(Ordering::Relaxed) {
                spins += 1;
                if spins % SPINS_PER_YIELD == 0 {
                    thread::yield_now();
                } else {
                    hint::spin_loop();
                }
            }
        }
    }

    /// Acquire the lock only if it is free
    pub fn try_lock(&self) -> Option<SpinlockGuard<'_, T>> {
        if self.locked.swap(true, Ordering::Acquire) {
            None
        } else {
            Some(SpinlockGuard { lock: self })
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: Default> Default for Spinlock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Releases the [`Spinlock`] when dropped
pub struct SpinlockGuard<'a, T> {
    lock: &'a Spinlock<T>,
}

impl<T> Deref for SpinlockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves exclusive access
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves exclusive access
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinlockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_lock_while_held() {
        let lock = Spinlock::new(1);
        let guard = lock.lock();
        assert!(lock.is_locked());
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn test_contended_increments() {
        let lock = Spinlock::new(0usize);
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..10_000 {
                        *lock.lock() += 1;
                    }
                });
            }
        });
        assert_eq!(lock.into_inner(), 80_000);
    }

    #[test]
    fn test_guards_non_atomic_pair() {
        let lock = Spinlock::new((0u64, 0u64));
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..5_000 {
                        let mut pair = lock.lock();
                        pair.0 += 1;
                        pair.1 = pair.0 * 2;
                    }
                });
            }
        });
        let (a, b) = lock.into_inner();
        assert_eq!(a, 20_000);
        assert_eq!(b, 40_000);
    }
}
