//! Processes.
//!
//! A process is bound to the host thread that runs it. Blocking is done by
//! parking that thread; the `Sleeping -> Running` transition, made under the
//! process lock by whoever wakes it, hands over a single wake token so that
//! no wakeup is lost between deciding to sleep and actually parking.

use core::{
    cell::RefCell,
    sync::atomic::{AtomicBool, Ordering},
};
use std::{
    string::{String, ToString as _},
    sync::{Arc, OnceLock},
    thread::{self, Thread},
};

use arrayvec::ArrayString;
use misaka_kernel_params::{MAX_PROC_NAME, NOFILE};
use misaka_types::process::ProcId;

pub use self::table::{ProcHandle, ProcTable};
use crate::{
    error::KernelError,
    file::File,
    signal::SignalState,
    sync::{SpinLock, SpinLockGuard},
};

mod table;

thread_local! {
    static CURRENT: RefCell<Option<Arc<Process>>> = const { RefCell::new(None) };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ProcState {
    #[strum(serialize = "run")]
    Running,
    #[strum(serialize = "sleep")]
    Sleeping { interruptible: bool },
    #[strum(serialize = "stop")]
    Stopped,
    #[strum(serialize = "zombie")]
    Zombie,
}

/// Per-process state that can be accessed from other processes.
pub struct ProcSharedData {
    state: ProcState,
    /// Process is killed
    killed: bool,
    exit_status: Option<i32>,
    pgid: ProcId,
    sid: ProcId,
}

impl ProcSharedData {
    pub fn state(&self) -> ProcState {
        self.state
    }

    pub fn killed(&self) -> bool {
        self.killed
    }
}

/// Open files and working directory.
struct ProcFiles {
    ofile: [Option<File>; NOFILE],
    cwd: String,
}

struct Waker {
    thread: OnceLock<Thread>,
    notified: AtomicBool,
}

impl Waker {
    /// Hands the wake token to the sleeper.
    ///
    /// Caller must hold the process lock and have moved the process out of
    /// a sleeping state.
    fn notify(&self) {
        self.notified.store(true, Ordering::Release);
        if let Some(thread) = self.thread.get() {
            thread.unpark();
        }
    }

    fn wait(&self) {
        while !self.notified.swap(false, Ordering::Acquire) {
            thread::park();
        }
    }
}

/// Attributes a new process starts with.
pub(crate) struct ProcInit {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub pgid: Option<ProcId>,
    pub sid: Option<ProcId>,
    pub cwd: String,
    pub ofile: [Option<File>; NOFILE],
    pub signals: SignalState,
}

/// Per-process state.
pub struct Process {
    pid: ProcId,
    handle: ProcHandle,
    /// Process name (for debugging)
    name: ArrayString<MAX_PROC_NAME>,
    uid: u32,
    gid: u32,
    shared: SpinLock<ProcSharedData>,
    pub(crate) signals: SpinLock<SignalState>,
    files: SpinLock<ProcFiles>,
    waker: Waker,
}

impl Process {
    pub(crate) fn new(pid: ProcId, handle: ProcHandle, init: ProcInit) -> Self {
        let mut name = ArrayString::new();
        for ch in init.name.chars() {
            if name.try_push(ch).is_err() {
                break;
            }
        }
        Self {
            pid,
            handle,
            name,
            uid: init.uid,
            gid: init.gid,
            shared: SpinLock::new(ProcSharedData {
                state: ProcState::Running,
                killed: false,
                exit_status: None,
                pgid: init.pgid.unwrap_or(pid),
                sid: init.sid.unwrap_or(pid),
            }),
            signals: SpinLock::new(init.signals),
            files: SpinLock::new(ProcFiles {
                ofile: init.ofile,
                cwd: init.cwd,
            }),
            waker: Waker {
                thread: OnceLock::new(),
                notified: AtomicBool::new(false),
            },
        }
    }

    /// Returns the current process.
    ///
    /// Panics when the calling thread does not run a process.
    pub fn current() -> Arc<Self> {
        Self::try_current().unwrap_or_else(|| panic!("no process bound to this thread"))
    }

    pub fn try_current() -> Option<Arc<Self>> {
        CURRENT.with(|current| current.borrow().clone())
    }

    /// Binds `p` to the calling thread.
    pub(crate) fn bind_current(p: &Arc<Self>) {
        let _ = p.waker.thread.set(thread::current());
        CURRENT.with(|current| {
            let old = current.borrow_mut().replace(Arc::clone(p));
            assert!(old.is_none(), "thread already runs a process");
        });
    }

    pub(crate) fn unbind_current() -> Option<Arc<Self>> {
        CURRENT.with(|current| current.borrow_mut().take())
    }

    pub fn pid(&self) -> ProcId {
        self.pid
    }

    pub fn handle(&self) -> ProcHandle {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn gid(&self) -> u32 {
        self.gid
    }

    pub fn shared(&self) -> SpinLockGuard<'_, ProcSharedData> {
        self.shared.lock()
    }

    pub fn state(&self) -> ProcState {
        self.shared.lock().state
    }

    pub fn pgid(&self) -> ProcId {
        self.shared.lock().pgid
    }

    pub fn sid(&self) -> ProcId {
        self.shared.lock().sid
    }

    pub fn set_pgid(&self, pgid: ProcId) {
        self.shared.lock().pgid = pgid;
    }

    /// Makes the process the leader of a new session and process group.
    pub fn set_sid(&self) -> Result<ProcId, KernelError> {
        let mut shared = self.shared.lock();
        if shared.pgid == self.pid {
            return Err(KernelError::NotPermitted);
        }
        shared.sid = self.pid;
        shared.pgid = self.pid;
        Ok(self.pid)
    }

    pub fn killed(&self) -> bool {
        self.shared.lock().killed
    }

    /// Marks the process killed and wakes it if it is sleeping
    /// interruptibly or stopped.
    ///
    /// The victim won't exit until it reaches a check point.
    pub fn kill(&self) {
        self.kill_with_status(None);
    }

    pub(crate) fn kill_with_status(&self, status: Option<i32>) {
        let mut shared = self.shared.lock();
        shared.killed = true;
        if shared.exit_status.is_none() {
            shared.exit_status = status;
        }
        if matches!(
            shared.state,
            ProcState::Sleeping {
                interruptible: true
            } | ProcState::Stopped
        ) {
            shared.state = ProcState::Running;
            self.waker.notify();
        }
    }

    pub fn exit_status(&self) -> Option<i32> {
        self.shared.lock().exit_status
    }

    /// Marks the current process as about to sleep.
    ///
    /// Must be followed by either `cancel_sleep()` or `block()`.
    pub(crate) fn prepare_sleep(&self, interruptible: bool) {
        let mut shared = self.shared.lock();
        assert_eq!(shared.state, ProcState::Running);
        shared.state = ProcState::Sleeping { interruptible };
    }

    /// Backs out of `prepare_sleep()`.
    ///
    /// Returns `false` if a waker already moved the process back to running;
    /// the caller must then `block()` to consume the wake token.
    pub(crate) fn cancel_sleep(&self) -> bool {
        let mut shared = self.shared.lock();
        if let ProcState::Sleeping { .. } = shared.state {
            shared.state = ProcState::Running;
            return true;
        }
        false
    }

    /// Parks the calling thread until the process is woken.
    pub(crate) fn block(&self) {
        self.waker.wait();
    }

    /// Wakes the process from any sleep.
    ///
    /// Returns `false` if it was not sleeping.
    pub(crate) fn wake(&self) -> bool {
        let mut shared = self.shared.lock();
        if let ProcState::Sleeping { .. } = shared.state {
            shared.state = ProcState::Running;
            self.waker.notify();
            return true;
        }
        false
    }

    /// Wakes the process only from an interruptible sleep.
    pub(crate) fn wake_interruptible(&self) -> bool {
        let mut shared = self.shared.lock();
        if shared.state
            == (ProcState::Sleeping {
                interruptible: true,
            })
        {
            shared.state = ProcState::Running;
            self.waker.notify();
            return true;
        }
        false
    }

    /// Stops the current process until `resume()` or `kill()`.
    ///
    /// The caller holds the signal lock so that a concurrent `SIGCONT`
    /// cannot slip in between deciding to stop and stopping.
    pub(crate) fn stop_locked(&self, signals: SpinLockGuard<'_, SignalState>) {
        {
            let mut shared = self.shared.lock();
            if shared.killed {
                return;
            }
            shared.state = ProcState::Stopped;
        }
        drop(signals);
        self.block();
    }

    /// Continues a stopped process.
    pub(crate) fn resume(&self) -> bool {
        let mut shared = self.shared.lock();
        if shared.state == ProcState::Stopped {
            shared.state = ProcState::Running;
            self.waker.notify();
            return true;
        }
        false
    }

    /// Returns true if a blocking call should give up: the process was
    /// killed or has a signal ready for delivery.
    pub(crate) fn has_wake_reason(&self) -> bool {
        self.signals.lock().has_deliverable() || self.killed()
    }

    /// Gives up the CPU, delivering pending signals first.
    pub fn yield_now(&self) {
        crate::signal::handle_pending(self);
        thread::yield_now();
    }

    /// Returns a clone of open file `fd`.
    pub fn ofile(&self, fd: usize) -> Result<File, KernelError> {
        self.files
            .lock()
            .ofile
            .get(fd)
            .and_then(Option::clone)
            .ok_or(KernelError::BadFileDescriptor)
    }

    /// Installs `file` in the lowest free descriptor.
    pub fn add_ofile(&self, file: File) -> Result<usize, KernelError> {
        let mut files = self.files.lock();
        let (fd, slot) = files
            .ofile
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.is_none())
            .ok_or(KernelError::TooManyOpenFiles)?;
        assert!(slot.replace(file).is_none());
        Ok(fd)
    }

    /// Installs `file` at `fd`, returning the file previously there.
    pub fn set_ofile(&self, fd: usize, file: File) -> Result<Option<File>, KernelError> {
        let mut files = self.files.lock();
        let slot = files
            .ofile
            .get_mut(fd)
            .ok_or(KernelError::BadFileDescriptor)?;
        Ok(slot.replace(file))
    }

    pub fn unset_ofile(&self, fd: usize) -> Result<File, KernelError> {
        self.files
            .lock()
            .ofile
            .get_mut(fd)
            .and_then(Option::take)
            .ok_or(KernelError::BadFileDescriptor)
    }

    /// Clones the descriptor table, for a child process.
    pub(crate) fn clone_ofiles(&self) -> [Option<File>; NOFILE] {
        self.files.lock().ofile.clone()
    }

    pub fn cwd(&self) -> String {
        self.files.lock().cwd.clone()
    }

    pub fn set_cwd(&self, cwd: &str) {
        self.files.lock().cwd = cwd.to_string();
    }

    /// Closes every open file and records the exit status.
    ///
    /// Returns the final status, which a fatal signal may have set earlier.
    pub(crate) fn exit(&self, status: i32) -> i32 {
        let ofile = {
            let mut files = self.files.lock();
            core::mem::replace(&mut files.ofile, [const { None }; NOFILE])
        };
        // close outside of the lock; closing may wake other processes
        drop(ofile);

        let mut shared = self.shared.lock();
        shared.state = ProcState::Zombie;
        *shared.exit_status.get_or_insert(status)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::signal::SignalState;

    pub(crate) fn init(name: &str) -> ProcInit {
        ProcInit {
            name: name.to_string(),
            uid: 0,
            gid: 0,
            pgid: None,
            sid: None,
            cwd: "/".to_string(),
            ofile: [const { None }; NOFILE],
            signals: SignalState::new(),
        }
    }

    /// Runs `f` as a freshly allocated process on the calling thread.
    pub(crate) fn with_process<T>(procs: &Arc<ProcTable>, f: impl FnOnce(&Arc<Process>) -> T) -> T {
        let p = procs
            .allocate(|pid, handle| Process::new(pid, handle, init("test")))
            .unwrap();
        Process::bind_current(&p);
        let ret = f(&p);
        Process::unbind_current();
        p.exit(0);
        procs.free(p.handle());
        ret
    }

    #[test]
    fn stale_handle_does_not_resolve() {
        let procs = ProcTable::new(1);
        let handle = with_process(&procs, |p| {
            assert!(Arc::ptr_eq(&procs.get(p.handle()).unwrap(), p));
            p.handle()
        });
        assert!(procs.get(handle).is_none());
        with_process(&procs, |p| {
            assert_ne!(p.handle(), handle);
            assert!(procs.get(handle).is_none());
        });
    }

    #[test]
    fn table_full() {
        let procs = ProcTable::new(1);
        with_process(&procs, |_| {
            let res = procs.allocate(|pid, handle| Process::new(pid, handle, init("second")));
            assert_eq!(res.err(), Some(KernelError::NoFreeProc));
        });
    }

    #[test]
    fn wake_token_is_not_lost() {
        let procs = ProcTable::new(2);
        with_process(&procs, |p| {
            p.prepare_sleep(true);
            let other = Arc::clone(p);
            std::thread::spawn(move || assert!(other.wake()))
                .join()
                .unwrap();
            // woken before parking: the token is already there
            assert!(!p.cancel_sleep());
            p.block();
            assert_eq!(p.state(), ProcState::Running);
        });
    }

    #[test]
    fn fd_table() {
        let procs = ProcTable::new(1);
        with_process(&procs, |p| {
            assert_eq!(p.ofile(0).err(), Some(KernelError::BadFileDescriptor));
            assert_eq!(p.unset_ofile(NOFILE).err(), Some(KernelError::BadFileDescriptor));
        });
    }
}
