use std::sync::Arc;

use misaka_types::{
    error::SyscallError,
    process::ProcId,
    signal::{SigHow, SigSet, Signal},
};

use super::syscall;
use crate::{
    error::KernelError,
    kernel::Kernel,
    proc::Process,
    signal::{self, Disposition},
};

/// Finds process `pid`, where 0 names the caller.
fn target(kernel: &Kernel, p: &Arc<Process>, pid: u32) -> Result<Arc<Process>, KernelError> {
    match ProcId::from_raw(pid) {
        None => Ok(Arc::clone(p)),
        Some(pid) if pid == p.pid() => Ok(Arc::clone(p)),
        Some(pid) => kernel.procs().find(pid).ok_or(KernelError::ProcessNotFound),
    }
}

pub fn getpid() -> Result<ProcId, SyscallError> {
    syscall(|_, p| Ok(p.pid()))
}

/// Returns the process group of `pid` (0 for the caller).
pub fn getpgid(pid: u32) -> Result<ProcId, SyscallError> {
    syscall(|kernel, p| Ok(target(kernel, p, pid)?.pgid()))
}

/// Returns the session of `pid` (0 for the caller).
pub fn getsid(pid: u32) -> Result<ProcId, SyscallError> {
    syscall(|kernel, p| Ok(target(kernel, p, pid)?.sid()))
}

/// Moves `pid` (0 for the caller) into process group `pgid` (0 for a new
/// group led by `pid`).
///
/// The target must be in the caller's session and must not lead a
/// session; the group joined must exist in that session.
pub fn setpgid(pid: u32, pgid: u32) -> Result<(), SyscallError> {
    syscall(|kernel, p| {
        let t = target(kernel, p, pid)?;
        if t.sid() != p.sid() || t.sid() == t.pid() {
            return Err(KernelError::NotPermitted);
        }
        let pgid = ProcId::from_raw(pgid).unwrap_or_else(|| t.pid());
        if pgid != t.pid() {
            let members = kernel.procs().group(pgid);
            if !members.iter().any(|m| m.sid() == t.sid()) {
                return Err(KernelError::NotPermitted);
            }
        }
        t.set_pgid(pgid);
        Ok(())
    })
}

/// Starts a new session led by the caller.
pub fn setsid() -> Result<ProcId, SyscallError> {
    syscall(|_, p| p.set_sid())
}

/// Sends signal number `signo` to `pid` (see [`signal::kill`]).
pub fn kill(pid: i32, signo: u32) -> Result<(), SyscallError> {
    syscall(|kernel, p| signal::kill(kernel.procs(), p, pid, signo))
}

/// Changes the blocked mask and returns the previous one.
pub fn sigprocmask(how: SigHow, set: SigSet) -> Result<SigSet, SyscallError> {
    syscall(|_, p| Ok(signal::sigprocmask(p, how, set)))
}

pub fn sigpending() -> Result<SigSet, SyscallError> {
    syscall(|_, p| Ok(signal::sigpending(p)))
}

/// Installs `action` for `sig` and returns the previous disposition.
pub fn sigaction(sig: Signal, action: Disposition) -> Result<Disposition, SyscallError> {
    syscall(|_, p| signal::sigaction(p, sig, action))
}

/// Waits with `mask` blocked until a signal handler has run.
///
/// Returns `Interrupted`, or `Killed` if the process was killed instead.
pub fn sigsuspend(mask: SigSet) -> Result<(), SyscallError> {
    syscall(|_, p| signal::sigsuspend(p, mask))
}

/// Waits for a signal in `set` and takes it without running its handler.
pub fn sigwait(set: SigSet) -> Result<Signal, SyscallError> {
    syscall(|_, p| signal::sigwait(p, set))
}

/// Gives up the CPU.
pub fn yield_now() -> Result<(), SyscallError> {
    syscall(|_, p| {
        p.yield_now();
        Ok(())
    })
}
