use core::cell::RefCell;
use std::{
    string::ToString as _,
    sync::Arc,
    thread::{self, JoinHandle},
};

use misaka_kernel_params::NOFILE;
use misaka_types::{process::ProcId, signal::Signal};

use crate::{
    config::KernelConfig,
    error::KernelError,
    logger,
    pex::PexBus,
    proc::{ProcInit, ProcTable, Process},
    pty::PtyTable,
    signal::SignalState,
    vfs::{Vfs, tmpfs::Tmpfs},
};

struct KernelInner {
    config: KernelConfig,
    procs: Arc<ProcTable>,
    vfs: Vfs,
    pex: Arc<PexBus>,
    ptys: Arc<PtyTable>,
}

/// One kernel instance: the process table, the mount table and the IPC
/// registries.
#[derive(Clone)]
pub struct Kernel(Arc<KernelInner>);

thread_local! {
    static CURRENT: RefCell<Option<Kernel>> = const { RefCell::new(None) };
}

/// Exit status of a process whose body panicked.
const PANIC_STATUS: i32 = 128 + Signal::Abrt as i32;

impl Kernel {
    /// Builds a kernel with a tmpfs root, `/dev` listing its mounts,
    /// the packet exchange at `/dev/pex` and terminals under `/dev/pts`.
    pub fn new(config: KernelConfig) -> Result<Self, KernelError> {
        let procs = ProcTable::new(config.nproc);
        let vfs = Vfs::new();

        let tmpfs_procs = Arc::clone(&procs);
        let pipe_size = config.pipe_size;
        vfs.register_fs(
            "tmpfs",
            Arc::new(move |_: &str, _: &str| Ok(Tmpfs::new(&tmpfs_procs, pipe_size).root())),
        )?;
        vfs.mount_type("tmpfs", "tmpfs", "/")?;
        vfs.map_directory("/dev")?;

        let pex = PexBus::new(&procs, config.pex_size);
        vfs.mount("/dev/pex", pex.root())?;
        let ptys = PtyTable::new(&procs, config.pty_size);
        vfs.mount("/dev/pts", ptys.pts_root())?;

        log::info!(
            "kernel up: nproc={} pipe={} pty={} pex={}",
            config.nproc,
            config.pipe_size,
            config.pty_size,
            config.pex_size
        );
        Ok(Self(Arc::new(KernelInner {
            config,
            procs,
            vfs,
            pex,
            ptys,
        })))
    }

    /// Parses `cmdline`, installs the kernel logger at the requested level
    /// and builds the kernel.
    pub fn boot(cmdline: &str) -> Result<Self, KernelError> {
        let config = KernelConfig::from_cmdline(cmdline)?;
        if logger::init(config.log_level).is_err() {
            log::set_max_level(config.log_level);
        }
        Self::new(config)
    }

    pub fn config(&self) -> &KernelConfig {
        &self.0.config
    }

    pub fn procs(&self) -> &Arc<ProcTable> {
        &self.0.procs
    }

    pub fn vfs(&self) -> &Vfs {
        &self.0.vfs
    }

    pub fn pex(&self) -> &Arc<PexBus> {
        &self.0.pex
    }

    pub fn ptys(&self) -> &Arc<PtyTable> {
        &self.0.ptys
    }

    /// Logs the process listing and the mount table.
    pub fn dump(&self) {
        self.0.procs.dump();
        self.0.vfs.dump();
    }

    /// Returns the kernel the calling thread runs in.
    ///
    /// Panics outside a process.
    pub fn current() -> Self {
        Self::try_current().unwrap_or_else(|| panic!("no kernel bound to this thread"))
    }

    pub fn try_current() -> Option<Self> {
        CURRENT.with(|current| current.borrow().clone())
    }

    /// Builds the initial state of a new process, inheriting from the
    /// current process if there is one.
    fn init_for(name: &str) -> ProcInit {
        match Process::try_current() {
            Some(parent) => ProcInit {
                name: name.to_string(),
                uid: parent.uid(),
                gid: parent.gid(),
                pgid: Some(parent.pgid()),
                sid: Some(parent.sid()),
                cwd: parent.cwd(),
                ofile: parent.clone_ofiles(),
                signals: parent.signals.lock().inherit(),
            },
            None => ProcInit {
                name: name.to_string(),
                uid: 0,
                gid: 0,
                pgid: None,
                sid: None,
                cwd: "/".to_string(),
                ofile: [const { None }; NOFILE],
                signals: SignalState::new(),
            },
        }
    }

    fn enter(&self, p: Arc<Process>) -> ProcGuard {
        CURRENT.with(|current| *current.borrow_mut() = Some(self.clone()));
        Process::bind_current(&p);
        log::debug!("pid {} ({}) started", p.pid(), p.name());
        ProcGuard {
            kernel: self.clone(),
            process: p,
            finished: false,
        }
    }

    /// Runs the calling thread as a new process until the returned guard
    /// is dropped or exited.
    pub fn attach(&self, name: &str) -> Result<ProcGuard, KernelError> {
        if Process::try_current().is_some() {
            return Err(KernelError::InvalidInput);
        }
        let init = Self::init_for(name);
        let p = self
            .0
            .procs
            .allocate(|pid, handle| Process::new(pid, handle, init))?;
        Ok(self.enter(p))
    }

    /// Starts `body` as a new process on its own thread.
    ///
    /// The child inherits credentials, process group, session, working
    /// directory, open files and signal dispositions from the calling
    /// process. `body` returns the exit status.
    pub fn spawn<F>(&self, name: &str, body: F) -> Result<ProcJoin, KernelError>
    where
        F: FnOnce() -> i32 + Send + 'static,
    {
        let init = Self::init_for(name);
        let p = self
            .0
            .procs
            .allocate(|pid, handle| Process::new(pid, handle, init))?;
        let pid = p.pid();
        let handle = p.handle();

        let kernel = self.clone();
        let child = Arc::clone(&p);
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let guard = kernel.enter(child);
                let status = body();
                guard.exit(status)
            });
        match thread {
            Ok(thread) => Ok(ProcJoin { pid, thread }),
            Err(e) => {
                log::error!("{name}: cannot start thread: {e}");
                p.exit(PANIC_STATUS);
                self.0.procs.free(handle);
                Err(KernelError::NoFreeProc)
            }
        }
    }
}

/// A process started by [`Kernel::spawn`].
#[derive(Debug)]
pub struct ProcJoin {
    pid: ProcId,
    thread: JoinHandle<i32>,
}

impl ProcJoin {
    pub fn pid(&self) -> ProcId {
        self.pid
    }

    /// Waits for the process to finish and returns its exit status.
    pub fn join(self) -> i32 {
        self.thread.join().unwrap_or(PANIC_STATUS)
    }
}

/// The process the calling thread runs as.
///
/// Dropping the guard exits the process with status 0.
pub struct ProcGuard {
    kernel: Kernel,
    process: Arc<Process>,
    finished: bool,
}

impl ProcGuard {
    pub fn process(&self) -> &Arc<Process> {
        &self.process
    }

    pub fn pid(&self) -> ProcId {
        self.process.pid()
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    /// Exits with `status` and returns the final status, which differs
    /// when the process was killed by a signal.
    pub fn exit(mut self, status: i32) -> i32 {
        self.finish(status)
    }

    fn finish(&mut self, status: i32) -> i32 {
        self.finished = true;
        Process::unbind_current();
        let status = self.process.exit(status);
        self.kernel.0.procs.free(self.process.handle());
        CURRENT.with(|current| current.borrow_mut().take());
        log::debug!("pid {} exited with {status}", self.process.pid());
        status
    }
}

impl Drop for ProcGuard {
    fn drop(&mut self) {
        if !self.finished {
            let status = if thread::panicking() { PANIC_STATUS } else { 0 };
            self.finish(status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::resolve;

    #[test]
    fn boots_with_device_directories() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        let vfs = kernel.vfs();
        assert!(resolve(&vfs.lookup("/dev").unwrap()).is_dir());
        assert!(resolve(&vfs.lookup("/dev/pex").unwrap()).is_dir());
        assert!(resolve(&vfs.lookup("/dev/pts").unwrap()).is_dir());
        kernel.dump();
    }

    #[test]
    fn boot_applies_cmdline() {
        let kernel = Kernel::boot("console=ttyS0 nproc=4 pex_size=2048 loglevel=warn").unwrap();
        assert_eq!(kernel.config().nproc, 4);
        assert_eq!(kernel.procs().capacity(), 4);
        assert_eq!(kernel.config().pex_size, 2048);
        assert!(Kernel::boot("nproc=0").is_err());
    }

    #[test]
    fn spawned_process_inherits_and_exits() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        let parent = kernel.attach("parent").unwrap();
        parent.process().set_cwd("/tmp");
        let parent_pgid = parent.process().pgid();

        let child = kernel
            .spawn("child", move || {
                let p = Process::current();
                assert_eq!(p.cwd(), "/tmp");
                assert_eq!(p.pgid(), parent_pgid);
                7
            })
            .unwrap();
        let pid = child.pid();
        assert_eq!(child.join(), 7);
        assert!(kernel.procs().find(pid).is_none());

        assert_eq!(parent.exit(3), 3);
        assert!(Kernel::try_current().is_none());
        assert!(Process::try_current().is_none());
    }

    #[test]
    fn attach_twice_is_rejected() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        let _guard = kernel.attach("a").unwrap();
        assert!(matches!(kernel.attach("b"), Err(KernelError::InvalidInput)));
    }

    #[test]
    fn killed_status_wins() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        let guard = kernel.attach("victim").unwrap();
        crate::signal::deliver(guard.process(), Signal::Kill);
        assert_eq!(guard.exit(0), 128 + 9);
    }
}
