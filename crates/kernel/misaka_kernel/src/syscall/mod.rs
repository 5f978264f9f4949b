//! System calls.
//!
//! Every call acts for the process bound to the calling thread and panics
//! outside one. Deliverable signals are handled before a call returns, and
//! a killed process gets `Killed` from every call.

use std::sync::Arc;

use misaka_types::error::SyscallError;

pub use self::{
    file::{
        chdir, close, dup, dup2, fswait, getcwd, ioctl, mkdir, mkfifo, mount, open, openpty, pipe,
        read, readdir, unlink, write,
    },
    pex::{Packet, bind, broadcast, connect, listen, query, recv, reply, send},
    proc::{
        getpgid, getpid, getsid, kill, setpgid, setsid, sigaction, sigpending, sigprocmask,
        sigsuspend, sigwait, yield_now,
    },
};
use crate::{error::KernelError, kernel::Kernel, proc::Process, signal};

mod file;
mod pex;
mod proc;

/// Runs `f` as a system call of the current process.
fn syscall<T, F>(f: F) -> Result<T, SyscallError>
where
    F: FnOnce(&Kernel, &Arc<Process>) -> Result<T, KernelError>,
{
    let kernel = Kernel::current();
    let p = Process::current();
    if p.killed() {
        return Err(SyscallError::Killed);
    }

    let res = f(&kernel, &p);

    signal::handle_pending(&p);
    if p.killed() {
        return Err(SyscallError::Killed);
    }
    res.map_err(|e| {
        log::trace!("pid {}: {e}", p.pid());
        SyscallError::from(e)
    })
}
