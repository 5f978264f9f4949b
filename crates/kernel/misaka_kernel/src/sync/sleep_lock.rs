use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
};
use std::sync::Arc;

use misaka_types::process::ProcId;

use super::{SpinLock, WaitQueue};
use crate::{
    error::KernelError,
    proc::{ProcTable, Process},
};

struct State {
    /// Is the lock held?
    locked: bool,
    owner: Option<ProcId>,
}

/// Mutual exclusion lock that puts contenders to sleep instead of spinning.
///
/// May only be used from process context.
pub struct RawSleepLock {
    inner: SpinLock<State>,
    waiters: WaitQueue,
}

impl RawSleepLock {
    pub fn new(procs: &Arc<ProcTable>) -> Self {
        Self {
            inner: SpinLock::new(State {
                locked: false,
                owner: None,
            }),
            waiters: WaitQueue::new(procs),
        }
    }

    pub fn try_acquire(&self) -> Result<(), KernelError> {
        let mut inner = self.inner.lock();
        if inner.locked {
            return Err(KernelError::LockContended);
        }
        inner.locked = true;
        inner.owner = Some(Process::current().pid());
        Ok(())
    }

    pub fn acquire(&self) {
        let pid = Process::current().pid();
        let mut inner = self.inner.lock();
        while inner.locked {
            inner = self.waiters.sleep_on_unlocking_uninterruptible(inner);
        }
        inner.locked = true;
        inner.owner = Some(pid);
    }

    pub fn release(&self) {
        let mut inner = self.inner.lock();
        assert!(
            inner.locked && inner.owner == Process::try_current().map(|p| p.pid()),
            "releasing a sleep lock not held by the caller"
        );
        inner.locked = false;
        inner.owner = None;
        self.waiters.wake_one();
    }

    /// Checks whether the current process holds the lock.
    pub fn holding(&self) -> bool {
        let inner = self.inner.lock();
        inner.locked && inner.owner == Process::try_current().map(|p| p.pid())
    }
}

pub struct SleepLock<T> {
    lock: RawSleepLock,
    value: UnsafeCell<T>,
}

unsafe impl<T> Sync for SleepLock<T> where T: Send {}

impl<T> SleepLock<T> {
    pub fn new(procs: &Arc<ProcTable>, value: T) -> Self {
        Self {
            lock: RawSleepLock::new(procs),
            value: UnsafeCell::new(value),
        }
    }

    pub fn try_lock(&self) -> Result<SleepLockGuard<'_, T>, KernelError> {
        self.lock.try_acquire()?;
        Ok(SleepLockGuard { lock: self })
    }

    /// Acquires the lock.
    ///
    /// Sleeps until the lock is acquired.
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        self.lock.acquire();
        SleepLockGuard { lock: self }
    }

    pub fn holding(&self) -> bool {
        self.lock.holding()
    }
}

pub struct SleepLockGuard<'a, T> {
    lock: &'a SleepLock<T>,
}

unsafe impl<T> Sync for SleepLockGuard<'_, T> where T: Sync {}

impl<T> Drop for SleepLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.lock.release();
    }
}

impl<T> Deref for SleepLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.value.get() }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::proc::tests::with_process;

    #[test]
    fn try_lock_reports_contention() {
        let procs = ProcTable::new(1);
        let lock = SleepLock::new(&procs, 0);
        with_process(&procs, |_| {
            let guard = lock.lock();
            assert!(lock.holding());
            assert_eq!(lock.try_lock().err(), Some(KernelError::LockContended));
            drop(guard);
            assert!(!lock.holding());
            assert!(lock.try_lock().is_ok());
        });
    }

    #[test]
    fn contended_increments_are_exclusive() {
        const THREADS: usize = 4;
        const ROUNDS: usize = 500;

        let procs = ProcTable::new(THREADS);
        let lock = Arc::new(SleepLock::new(&procs, 0_usize));
        let handles = (0..THREADS)
            .map(|_| {
                let (procs, lock) = (Arc::clone(&procs), Arc::clone(&lock));
                thread::spawn(move || {
                    with_process(&procs, |_| {
                        for _ in 0..ROUNDS {
                            let mut guard = lock.lock();
                            let v = *guard;
                            thread::yield_now();
                            *guard = v + 1;
                        }
                    });
                })
            })
            .collect::<Vec<_>>();
        for h in handles {
            h.join().unwrap();
        }
        let procs2 = ProcTable::new(1);
        with_process(&procs2, |_| assert_eq!(*lock.lock(), THREADS * ROUNDS));
    }

    #[test]
    #[should_panic = "releasing a sleep lock not held by the caller"]
    fn release_by_non_owner_panics() {
        let procs = ProcTable::new(1);
        let lock = RawSleepLock::new(&procs);
        with_process(&procs, |_| lock.release());
    }
}
