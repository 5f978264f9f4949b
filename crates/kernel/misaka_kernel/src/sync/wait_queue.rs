use std::{collections::VecDeque, sync::Arc};

use super::{SpinLock, SpinLockGuard};
use crate::{
    error::KernelError,
    proc::{ProcHandle, ProcTable, Process},
};

#[derive(Default)]
struct Waiters {
    /// Processes blocked in `sleep_on_unlocking*`, oldest first.
    sleepers: VecDeque<ProcHandle>,
    /// Processes waiting for any of several queues (see `subscribe`).
    subscribers: Vec<ProcHandle>,
}

/// A FIFO list of processes sleeping until some condition changes.
///
/// Entries are process handles, so an entry left behind by an exited
/// process is recognized and skipped. Wakeups may be spurious; sleepers
/// re-check their condition.
pub struct WaitQueue {
    procs: Arc<ProcTable>,
    waiters: SpinLock<Waiters>,
}

type SleepResult<'a, T> = Result<SpinLockGuard<'a, T>, (SpinLockGuard<'a, T>, KernelError)>;

impl WaitQueue {
    pub fn new(procs: &Arc<ProcTable>) -> Self {
        Self {
            procs: Arc::clone(procs),
            waiters: SpinLock::new(Waiters::default()),
        }
    }

    /// Atomically releases `guard` and sleeps on this queue.
    ///
    /// Reacquires the lock when awakened.
    ///
    /// Returns `Err` if the process is killed or a signal is ready for
    /// delivery. A sleeper that was taken off the queue by a wake reports
    /// success even if a signal arrived meanwhile, so that the wake is not
    /// lost; the signal is seen at the next check.
    pub fn sleep_on_unlocking<'a, T>(&self, guard: SpinLockGuard<'a, T>) -> SleepResult<'a, T> {
        self.sleep_common(guard, true)
    }

    /// Atomically releases `guard` and sleeps on this queue, ignoring
    /// signals and kills.
    pub fn sleep_on_unlocking_uninterruptible<'a, T>(
        &self,
        guard: SpinLockGuard<'a, T>,
    ) -> SpinLockGuard<'a, T> {
        self.sleep_common(guard, false)
            .unwrap_or_else(|_| unreachable!())
    }

    fn sleep_common<'a, T>(&self, guard: SpinLockGuard<'a, T>, interruptible: bool) -> SleepResult<'a, T> {
        let p = Process::current();
        if interruptible && p.killed() {
            return Err((guard, KernelError::CallerProcessAlreadyKilled));
        }

        // A waker must find the entry only once the process is marked
        // sleeping, so both happen under the queue lock.
        {
            let mut waiters = self.waiters.lock();
            waiters.sleepers.push_back(p.handle());
            p.prepare_sleep(interruptible);
        }

        let lock = guard.into_lock();

        if !(interruptible && p.has_wake_reason() && p.cancel_sleep()) {
            p.block();
        }

        let dequeued = {
            let mut waiters = self.waiters.lock();
            let pos = waiters.sleepers.iter().position(|h| *h == p.handle());
            match pos {
                Some(pos) => {
                    waiters.sleepers.remove(pos);
                    false
                }
                None => true,
            }
        };

        let guard = lock.lock();

        if interruptible && !dequeued {
            if p.killed() {
                return Err((guard, KernelError::CallerProcessAlreadyKilled));
            }
            if p.has_wake_reason() {
                return Err((guard, KernelError::Interrupted));
            }
        }

        Ok(guard)
    }

    /// Registers `p` to be woken by the next `wake_all()` on this queue.
    ///
    /// Unlike the sleep functions this does not block; the caller sleeps on
    /// its own after subscribing to every queue it is interested in.
    pub fn subscribe(&self, p: &Process) {
        let mut waiters = self.waiters.lock();
        let handle = p.handle();
        if !waiters.subscribers.contains(&handle) {
            waiters.subscribers.push(handle);
        }
    }

    /// Wakes the oldest live sleeper.
    ///
    /// Returns `false` if there was none.
    pub fn wake_one(&self) -> bool {
        let mut waiters = self.waiters.lock();
        while let Some(handle) = waiters.sleepers.pop_front() {
            let Some(p) = self.procs.get(handle) else {
                continue;
            };
            if p.wake() {
                return true;
            }
        }
        false
    }

    /// Wakes every sleeper and subscriber.
    ///
    /// Returns the number of processes woken.
    pub fn wake_all(&self) -> usize {
        let mut waiters = self.waiters.lock();
        let subscribers = core::mem::take(&mut waiters.subscribers);
        waiters
            .sleepers
            .drain(..)
            .chain(subscribers)
            .filter_map(|handle| self.procs.get(handle))
            .filter(|p| p.wake())
            .count()
    }

    pub fn len(&self) -> usize {
        let waiters = self.waiters.lock();
        waiters.sleepers.len() + waiters.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Barrier, thread, time::Duration};

    use super::*;
    use crate::proc::{ProcState, tests::with_process};

    #[test]
    fn wake_one_without_sleepers() {
        let procs = ProcTable::new(1);
        let queue = WaitQueue::new(&procs);
        assert!(!queue.wake_one());
        assert_eq!(queue.wake_all(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn sleeper_sees_condition_after_wake() {
        let procs = ProcTable::new(2);
        let queue = Arc::new(WaitQueue::new(&procs));
        let flag = Arc::new(SpinLock::new(false));
        let barrier = Arc::new(Barrier::new(2));

        let sleeper = {
            let (procs, queue, flag, barrier) = (
                Arc::clone(&procs),
                Arc::clone(&queue),
                Arc::clone(&flag),
                Arc::clone(&barrier),
            );
            thread::spawn(move || {
                with_process(&procs, |_| {
                    let mut guard = flag.lock();
                    barrier.wait();
                    while !*guard {
                        guard = queue.sleep_on_unlocking_uninterruptible(guard);
                    }
                })
            })
        };

        barrier.wait();
        *flag.lock() = true;
        // holding the flag lock means the sleeper is either queued or done
        while !sleeper.is_finished() {
            let guard = flag.lock();
            queue.wake_one();
            drop(guard);
            thread::sleep(Duration::from_millis(1));
        }
        sleeper.join().unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn killed_caller_does_not_sleep() {
        let procs = ProcTable::new(1);
        let queue = WaitQueue::new(&procs);
        let lock = SpinLock::new(());
        with_process(&procs, |p| {
            p.kill();
            let res = queue.sleep_on_unlocking(lock.lock());
            let (_guard, err) = res.err().unwrap();
            assert_eq!(err, KernelError::CallerProcessAlreadyKilled);
            assert_eq!(p.state(), ProcState::Running);
        });
        assert!(queue.is_empty());
    }

    #[test]
    fn subscribers_are_woken_once() {
        let procs = ProcTable::new(1);
        let queue = WaitQueue::new(&procs);
        with_process(&procs, |p| {
            queue.subscribe(p);
            queue.subscribe(p);
            assert_eq!(queue.len(), 1);
            p.prepare_sleep(true);
            assert_eq!(queue.wake_all(), 1);
            p.block();
            assert_eq!(queue.wake_all(), 0);
        });
    }
}
