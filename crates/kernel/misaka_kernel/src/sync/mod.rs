mod sleep_lock;
mod spin_lock;
mod wait_queue;

pub use self::{
    sleep_lock::{RawSleepLock, SleepLock, SleepLockGuard},
    spin_lock::{RawSpinLock, SpinLock, SpinLockGuard},
    wait_queue::WaitQueue,
};
