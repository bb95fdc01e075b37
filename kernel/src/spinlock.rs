// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Spinlock primitive (spec §4.1, component C1).
//!
//! A single machine word manipulated with atomic test-and-set on acquire and
//! atomic store-release on release, with a pause hint in the spin loop.
//! Non-reentrant: re-acquiring from the same CPU deadlocks, by design (no
//! priority inheritance, no recursion bookkeeping to keep the fast path
//! branch-free).
//!
//! Spinlocks must never be held across anything that can suspend the current
//! thread (spec §5). Holding one across a call into [`crate::sched`] that
//! blocks is a bug, not a runtime-checked condition; see each module's lock
//! ordering notes.

use core::cell::UnsafeCell;
use core::hint;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// A test-and-set spinlock guarding a `T`.
pub struct SpinLock<T: ?Sized> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is only ever granted through a `SpinLockGuard`
// obtained while `locked` is held, so `SpinLock<T>` is `Sync` whenever `T` is
// `Send` -- exactly the bound `std::sync::Mutex` uses.
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        SpinLock {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Spins until the lock is acquired.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            while self.locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
    }

    /// Attempts to acquire the lock without spinning; returns `None` if it
    /// is already held. This is the only primitive the klog emergency path
    /// and the panic path are allowed to use.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self
            .locked
            .compare_exchange_weak(
                false,
                true,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            Some(SpinLockGuard { lock: self })
        } else {
            None
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Reaches into the protected data without acquiring the lock.
    ///
    /// # Safety
    /// The caller must guarantee no other access (locked or not) races this
    /// one. The only legitimate caller in this crate is the klog emergency
    /// path, which accepts a race in exchange for making forward progress
    /// while the lock is stuck held by a CPU that has crashed or is spinning
    /// on a deadlock elsewhere.
    pub unsafe fn force_unsynchronized_mut(&self) -> &mut T {
        &mut *self.data.get()
    }
}

pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
}

impl<'a, T: ?Sized> Deref for SpinLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: holding the guard means we hold the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T: ?Sized> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: holding the guard means we hold the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T: ?Sized> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;

    #[test]
    fn mutual_exclusion_across_threads() {
        let lock = Arc::new(SpinLock::new(0u64));
        let mut handles = std::vec::Vec::new();
        for _ in 0..8 {
            let lock = lock.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    *lock.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 8000);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = SpinLock::new(());
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }
}
