use core::{
    cell::UnsafeCell,
    fmt, hint,
    ops::{Deref, DerefMut},
    panic::Location,
    ptr,
    sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering},
};

use misaka_kernel_params::SPIN_BACKOFF_LIMIT;

use crate::{
    cpu::{self, INVALID_CPUID},
    error::KernelError,
};

pub struct RawSpinLock {
    locked: AtomicBool,
    /// CPU holding the lock, or `INVALID_CPUID`.
    cpu: AtomicUsize,
    /// Call site of the current holder (debug builds only).
    location: AtomicPtr<Location<'static>>,
}

impl Default for RawSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RawSpinLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("RawSpinLock");
        d.field("locked", &self.locked.load(Ordering::Relaxed))
            .field("cpu", &self.cpu.load(Ordering::Relaxed));
        let location = self.location.load(Ordering::Relaxed);
        if !location.is_null() {
            d.field("location", unsafe { &*location });
        }
        d.finish()
    }
}

impl RawSpinLock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            cpu: AtomicUsize::new(INVALID_CPUID),
            location: AtomicPtr::new(ptr::null_mut()),
        }
    }

    #[track_caller]
    pub fn try_acquire(&self) -> Result<(), KernelError> {
        assert!(!self.holding(), "recursive spinlock acquisition");

        if self.locked.swap(true, Ordering::Acquire) {
            return Err(KernelError::LockContended);
        }

        self.record_owner(Location::caller());
        Ok(())
    }

    /// Acquires the lock.
    ///
    /// Loops (spins) until the lock is acquired. Never sleeps.
    #[track_caller]
    pub fn acquire(&self) {
        assert!(!self.holding(), "recursive spinlock acquisition");

        // `Ordering::Acquire` keeps the critical section's loads and stores
        // after the point the lock is taken.
        let mut backoff = 1;
        while self.locked.swap(true, Ordering::Acquire) {
            while self.locked.load(Ordering::Relaxed) {
                if backoff <= SPIN_BACKOFF_LIMIT {
                    for _ in 0..backoff {
                        hint::spin_loop();
                    }
                    backoff <<= 1;
                } else {
                    std::thread::yield_now();
                }
            }
        }

        self.record_owner(Location::caller());
    }

    /// Releases the lock.
    pub fn release(&self) {
        assert!(self.holding(), "releasing a spinlock not held by this cpu");

        self.cpu.store(INVALID_CPUID, Ordering::Relaxed);
        if cfg!(debug_assertions) {
            self.location.store(ptr::null_mut(), Ordering::Relaxed);
        }

        // `Ordering::Release` makes every store of the critical section
        // visible before the lock is observed free.
        self.locked.store(false, Ordering::Release);
    }

    /// Checks whether this cpu is holding the lock.
    pub fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed) && self.cpu.load(Ordering::Relaxed) == cpu::current_id()
    }

    fn record_owner(&self, location: &'static Location<'static>) {
        self.cpu.store(cpu::current_id(), Ordering::Relaxed);
        if cfg!(debug_assertions) {
            self.location
                .store(ptr::from_ref(location).cast_mut(), Ordering::Relaxed);
        }
    }
}

#[derive(Default)]
pub struct SpinLock<T> {
    lock: RawSpinLock,
    value: UnsafeCell<T>,
}

unsafe impl<T> Sync for SpinLock<T> where T: Send {}

impl<T> fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinLock")
            .field("lock", &self.lock)
            .finish_non_exhaustive()
    }
}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            lock: RawSpinLock::new(),
            value: UnsafeCell::new(value),
        }
    }

    #[track_caller]
    pub fn try_lock(&self) -> Result<SpinLockGuard<'_, T>, KernelError> {
        self.lock.try_acquire()?;
        Ok(SpinLockGuard { lock: self })
    }

    /// Acquires the lock.
    ///
    /// Loops (spins) until the lock is acquired.
    #[track_caller]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.lock.acquire();
        SpinLockGuard { lock: self }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

unsafe impl<T> Send for SpinLockGuard<'_, T> where T: Send {}
unsafe impl<T> Sync for SpinLockGuard<'_, T> where T: Sync {}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.lock.release();
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<'a, T> SpinLockGuard<'a, T> {
    /// Releases the lock and returns the lock it guarded, so that the caller
    /// can take it again later.
    pub fn into_lock(self) -> &'a SpinLock<T> {
        let lock = self.lock;
        drop(self);
        lock
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn counter_is_exclusive() {
        let counter = Arc::new(SpinLock::new(0_usize));
        let handles = (0..4)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        *counter.lock() += 1;
                    }
                })
            })
            .collect::<Vec<_>>();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*counter.lock(), 40_000);
    }

    #[test]
    fn try_lock_fails_while_held_elsewhere() {
        let lock = Arc::new(SpinLock::new(()));
        let guard = lock.lock();
        let other = Arc::clone(&lock);
        let res = thread::spawn(move || other.try_lock().is_err())
            .join()
            .unwrap();
        assert!(res);
        drop(guard);
        assert!(lock.try_lock().is_ok());
    }

    #[test]
    fn into_lock_releases() {
        let lock = SpinLock::new(1);
        let guard = lock.lock();
        assert!(lock.lock.holding());
        let lock = guard.into_lock();
        assert!(!lock.lock.holding());
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    #[should_panic = "recursive spinlock acquisition"]
    fn recursive_acquire_panics() {
        let lock = SpinLock::new(());
        let _guard = lock.lock();
        let _again = lock.lock();
    }
}
