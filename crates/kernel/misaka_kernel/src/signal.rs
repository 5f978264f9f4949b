//! Signal delivery.
//!
//! Senders record a signal as pending on the target and wake it if it can
//! act on it. The target delivers pending signals itself at check points:
//! after every system call and in [`Process::yield_now`].

use core::fmt;
use std::sync::Arc;

use misaka_types::{
    process::ProcId,
    signal::{DefaultAction, NSIG, SigHow, SigSet, Signal},
};

use crate::{
    error::KernelError,
    proc::{ProcTable, Process},
};

pub type SignalHandler = Arc<dyn Fn(Signal) + Send + Sync>;

/// What a process does when a signal is delivered.
#[derive(Clone, Default)]
pub enum Disposition {
    #[default]
    Default,
    Ignore,
    Handler(SignalHandler),
}

impl fmt::Debug for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => f.write_str("Default"),
            Self::Ignore => f.write_str("Ignore"),
            Self::Handler(_) => f.write_str("Handler(..)"),
        }
    }
}

impl Disposition {
    /// Whether a signal with this disposition is dropped when sent.
    fn discards(&self, sig: Signal) -> bool {
        match self {
            Self::Ignore => true,
            Self::Default => matches!(
                sig.default_action(),
                DefaultAction::Ignore | DefaultAction::Continue
            ),
            Self::Handler(_) => false,
        }
    }
}

const UNBLOCKABLE: SigSet = SigSet::EMPTY.with(Signal::Kill).with(Signal::Stop);

const STOP_SIGNALS: [Signal; 4] = [Signal::Stop, Signal::Tstp, Signal::Ttin, Signal::Ttou];

#[derive(Debug)]
pub struct SignalState {
    pending: SigSet,
    blocked: SigSet,
    actions: [Disposition; NSIG],
    /// Set passed to an ongoing `sigwait`.
    waiting: Option<SigSet>,
}

impl Default for SignalState {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalState {
    pub fn new() -> Self {
        Self {
            pending: SigSet::EMPTY,
            blocked: SigSet::EMPTY,
            actions: [const { Disposition::Default }; NSIG],
            waiting: None,
        }
    }

    /// State of a newly spawned child: mask and dispositions are inherited,
    /// pending signals are not.
    pub fn inherit(&self) -> Self {
        Self {
            pending: SigSet::EMPTY,
            blocked: self.blocked,
            actions: self.actions.clone(),
            waiting: None,
        }
    }

    pub fn pending(&self) -> SigSet {
        self.pending
    }

    pub fn blocked(&self) -> SigSet {
        self.blocked
    }

    fn deliverable(&self) -> SigSet {
        self.pending.difference(self.blocked)
    }

    pub fn has_deliverable(&self) -> bool {
        !self.deliverable().is_empty()
    }

    fn action(&self, sig: Signal) -> &Disposition {
        &self.actions[sig.number() as usize]
    }
}

/// Posts `sig` to `p`.
pub fn deliver(p: &Process, sig: Signal) {
    let mut signals = p.signals.lock();
    let waited = signals.waiting.is_some_and(|set| set.contains(sig));

    match sig {
        Signal::Kill => p.kill_with_status(Some(exit_status(sig))),
        Signal::Cont => {
            for stop in STOP_SIGNALS {
                signals.pending.remove(stop);
            }
            p.resume();
        }
        Signal::Stop | Signal::Tstp | Signal::Ttin | Signal::Ttou => {
            signals.pending.remove(Signal::Cont);
        }
        _ => {}
    }

    if signals.action(sig).discards(sig) && !waited {
        log::trace!("pid {}: {sig} discarded", p.pid());
        return;
    }

    signals.pending.insert(sig);
    log::debug!("pid {}: {sig} pending", p.pid());
    if waited || !signals.blocked.contains(sig) {
        p.wake_interruptible();
    }
}

fn exit_status(sig: Signal) -> i32 {
    128 + sig.number() as i32
}

fn check_permission(sender: Option<&Process>, target: &Process) -> Result<(), KernelError> {
    match sender {
        Some(sender) if sender.uid() != 0 && sender.uid() != target.uid() => {
            Err(KernelError::NotPermitted)
        }
        _ => Ok(()),
    }
}

/// Sends `sig` to process `pid`.
pub fn send_signal(
    procs: &ProcTable,
    sender: Option<&Process>,
    pid: ProcId,
    sig: Signal,
) -> Result<(), KernelError> {
    let target = procs.find(pid).ok_or(KernelError::ProcessNotFound)?;
    check_permission(sender, &target)?;
    deliver(&target, sig);
    Ok(())
}

/// Sends `sig` to every member of process group `pgid`.
///
/// Returns the number of processes signalled.
pub fn send_signal_group(
    procs: &ProcTable,
    sender: Option<&Process>,
    pgid: ProcId,
    sig: Signal,
) -> Result<usize, KernelError> {
    let members = procs.group(pgid);
    if members.is_empty() {
        return Err(KernelError::ProcessNotFound);
    }
    let mut sent = 0;
    for p in members {
        if check_permission(sender, &p).is_ok() {
            deliver(&p, sig);
            sent += 1;
        }
    }
    if sent == 0 {
        return Err(KernelError::NotPermitted);
    }
    Ok(sent)
}

/// `kill(2)`.
///
/// A positive `pid` names a process, zero the caller's process group, `-1`
/// every process except the caller, and other negative values the process
/// group `-pid`. Signal number 0 only checks that the target exists.
pub fn kill(procs: &ProcTable, caller: &Process, pid: i32, signo: u32) -> Result<(), KernelError> {
    let sig = match signo {
        0 => None,
        n => Some(Signal::from_repr(n).ok_or(KernelError::InvalidInput)?),
    };

    let targets = match pid {
        0 => procs.group(caller.pgid()),
        -1 => procs
            .processes()
            .into_iter()
            .filter(|p| p.pid() != caller.pid())
            .collect(),
        pid => {
            let id = ProcId::from_raw(pid.unsigned_abs()).ok_or(KernelError::InvalidInput)?;
            if pid > 0 {
                procs.find(id).into_iter().collect()
            } else {
                procs.group(id)
            }
        }
    };
    if targets.is_empty() {
        return Err(KernelError::ProcessNotFound);
    }

    let permitted = targets
        .iter()
        .filter(|p| check_permission(Some(caller), p).is_ok())
        .collect::<Vec<_>>();
    if permitted.is_empty() {
        return Err(KernelError::NotPermitted);
    }
    if let Some(sig) = sig {
        for p in permitted {
            deliver(p, sig);
        }
    }
    Ok(())
}

/// Delivers every deliverable pending signal of the current process `p`.
///
/// Returns `true` if a handler ran.
pub fn handle_pending(p: &Process) -> bool {
    let mut handled = false;
    loop {
        if p.killed() {
            return handled;
        }
        let mut signals = p.signals.lock();
        let Some(sig) = signals.deliverable().first() else {
            return handled;
        };
        signals.pending.remove(sig);

        match signals.action(sig).clone() {
            Disposition::Handler(handler) => {
                let saved = signals.blocked;
                signals.blocked.insert(sig);
                drop(signals);

                log::debug!("pid {}: running handler for {sig}", p.pid());
                handler(sig);
                handled = true;

                p.signals.lock().blocked = saved;
            }
            Disposition::Ignore => {}
            Disposition::Default => match sig.default_action() {
                DefaultAction::Terminate | DefaultAction::CoreDump => {
                    drop(signals);
                    log::debug!("pid {}: terminated by {sig}", p.pid());
                    p.kill_with_status(Some(exit_status(sig)));
                    return handled;
                }
                DefaultAction::Stop => {
                    log::debug!("pid {}: stopped by {sig}", p.pid());
                    p.stop_locked(signals);
                }
                DefaultAction::Ignore | DefaultAction::Continue => {}
            },
        }
    }
}

/// `sigprocmask(2)`. Returns the previous mask.
pub fn sigprocmask(p: &Process, how: SigHow, set: SigSet) -> SigSet {
    let mut signals = p.signals.lock();
    let old = signals.blocked;
    let new = match how {
        SigHow::Block => old.union(set),
        SigHow::Unblock => old.difference(set),
        SigHow::SetMask => set,
    };
    signals.blocked = new.difference(UNBLOCKABLE);
    old
}

pub fn sigpending(p: &Process) -> SigSet {
    p.signals.lock().pending
}

/// `sigaction(2)`. Returns the previous disposition.
pub fn sigaction(
    p: &Process,
    sig: Signal,
    action: Disposition,
) -> Result<Disposition, KernelError> {
    if sig.is_unblockable() {
        return Err(KernelError::InvalidInput);
    }
    let mut signals = p.signals.lock();
    if action.discards(sig) {
        signals.pending.remove(sig);
    }
    Ok(core::mem::replace(
        &mut signals.actions[sig.number() as usize],
        action,
    ))
}

/// `sigsuspend(2)`.
///
/// Replaces the mask with `mask` and sleeps until a handler has run or the
/// process is killed, then restores the mask. Always returns `Interrupted`.
pub fn sigsuspend(p: &Process, mask: SigSet) -> Result<(), KernelError> {
    let old = {
        let mut signals = p.signals.lock();
        core::mem::replace(&mut signals.blocked, mask.difference(UNBLOCKABLE))
    };

    loop {
        {
            let signals = p.signals.lock();
            if !signals.has_deliverable() && !p.killed() {
                // senders take the signal lock, so they see the sleeping
                // state or we see their signal
                p.prepare_sleep(true);
                drop(signals);
                p.block();
            }
        }
        if handle_pending(p) || p.killed() {
            break;
        }
    }

    p.signals.lock().blocked = old;
    Err(KernelError::Interrupted)
}

/// `sigwait(3)`.
///
/// Waits until a signal in `set` is pending and consumes it without running
/// its handler.
pub fn sigwait(p: &Process, set: SigSet) -> Result<Signal, KernelError> {
    let mut signals = p.signals.lock();
    let res = loop {
        if let Some(sig) = signals.pending.intersection(set).first() {
            signals.pending.remove(sig);
            break Ok(sig);
        }
        if p.killed() {
            break Err(KernelError::CallerProcessAlreadyKilled);
        }
        if !signals.deliverable().difference(set).is_empty() {
            break Err(KernelError::Interrupted);
        }
        signals.waiting = Some(set);
        p.prepare_sleep(true);
        drop(signals);
        p.block();
        signals = p.signals.lock();
    };
    signals.waiting = None;
    res
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::proc::tests::with_process;

    #[test]
    fn ignored_signals_are_discarded() {
        let procs = ProcTable::new(1);
        with_process(&procs, |p| {
            deliver(p, Signal::Winch);
            assert!(sigpending(p).is_empty());

            sigaction(p, Signal::Usr1, Disposition::Ignore).unwrap();
            deliver(p, Signal::Usr1);
            assert!(sigpending(p).is_empty());

            deliver(p, Signal::Cont);
            assert!(sigpending(p).is_empty());
        });
    }

    #[test]
    fn blocked_signal_stays_pending() {
        let procs = ProcTable::new(1);
        with_process(&procs, |p| {
            sigprocmask(p, SigHow::Block, SigSet::EMPTY.with(Signal::Term));
            deliver(p, Signal::Term);
            assert!(sigpending(p).contains(Signal::Term));
            assert!(!p.has_wake_reason());
            assert!(!handle_pending(p));
            assert!(!p.killed());

            sigprocmask(p, SigHow::Unblock, SigSet::EMPTY.with(Signal::Term));
            assert!(p.has_wake_reason());
            handle_pending(p);
            assert!(p.killed());
            assert_eq!(p.exit_status(), Some(128 + 15));
        });
    }

    #[test]
    fn kill_and_stop_cannot_be_blocked_or_caught() {
        let procs = ProcTable::new(1);
        with_process(&procs, |p| {
            sigprocmask(p, SigHow::SetMask, SigSet::all());
            assert!(!sigprocmask(p, SigHow::SetMask, SigSet::EMPTY).contains(Signal::Kill));
            assert_eq!(
                sigaction(p, Signal::Kill, Disposition::Ignore).err(),
                Some(KernelError::InvalidInput)
            );
            assert_eq!(
                sigaction(p, Signal::Stop, Disposition::Default).err(),
                Some(KernelError::InvalidInput)
            );
        });
    }

    #[test]
    fn handler_runs_with_signal_masked() {
        let procs = ProcTable::new(1);
        let calls = Arc::new(AtomicUsize::new(0));
        with_process(&procs, |p| {
            let handler = {
                let calls = Arc::clone(&calls);
                let p = Arc::clone(p);
                move |sig| {
                    assert_eq!(sig, Signal::Usr1);
                    assert!(p.signals.lock().blocked().contains(Signal::Usr1));
                    calls.fetch_add(1, Ordering::Relaxed);
                }
            };
            sigaction(p, Signal::Usr1, Disposition::Handler(Arc::new(handler))).unwrap();
            deliver(p, Signal::Usr1);
            assert!(handle_pending(p));
            assert!(!p.signals.lock().blocked().contains(Signal::Usr1));
            assert!(!p.killed());
        });
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn sigwait_consumes_pending_signal() {
        let procs = ProcTable::new(1);
        with_process(&procs, |p| {
            let set = SigSet::EMPTY.with(Signal::Usr2);
            sigprocmask(p, SigHow::Block, set);
            deliver(p, Signal::Usr2);
            assert_eq!(sigwait(p, set), Ok(Signal::Usr2));
            assert!(sigpending(p).is_empty());
        });
    }

    #[test]
    fn kill_checks_targets() {
        let procs = ProcTable::new(1);
        with_process(&procs, |p| {
            let pid = i32::try_from(p.pid().get()).unwrap();
            assert_eq!(kill(&procs, p, pid, 0), Ok(()));
            assert_eq!(kill(&procs, p, pid, 99), Err(KernelError::InvalidInput));
            assert_eq!(kill(&procs, p, pid + 1, 0), Err(KernelError::ProcessNotFound));
            assert_eq!(kill(&procs, p, -1, 0), Err(KernelError::ProcessNotFound));
            kill(&procs, p, 0, Signal::Kill.number()).unwrap();
            assert!(p.killed());
        });
    }
}
