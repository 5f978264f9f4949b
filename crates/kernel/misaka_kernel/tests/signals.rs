#![cfg(test)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc,
    },
    time::{Duration, Instant},
};

use misaka_kernel::{Kernel, config::KernelConfig, signal::Disposition, syscall};
use misaka_types::{
    error::SyscallError,
    signal::{SigHow, SigSet, Signal},
};

#[test]
fn sigsuspend_never_loses_a_wakeup() -> Result<(), anyhow::Error> {
    const ROUNDS: usize = 500;

    let kernel = Kernel::new(KernelConfig::default())?;
    let _init = kernel.attach("init")?;
    let handled = Arc::new(AtomicUsize::new(0));
    let (ready_tx, ready_rx) = mpsc::channel();

    let receiver = {
        let handled = Arc::clone(&handled);
        kernel.spawn("receiver", move || {
            let counter = Arc::clone(&handled);
            let handler = move |_: Signal| {
                counter.fetch_add(1, Ordering::SeqCst);
            };
            syscall::sigaction(Signal::Usr1, Disposition::Handler(Arc::new(handler))).unwrap();
            syscall::sigprocmask(SigHow::Block, SigSet::EMPTY.with(Signal::Usr1)).unwrap();
            ready_tx.send(()).unwrap();

            while handled.load(Ordering::SeqCst) < ROUNDS {
                assert_eq!(
                    syscall::sigsuspend(SigSet::EMPTY),
                    Err(SyscallError::Interrupted)
                );
                // the mask in force before the call is back
                let mask = syscall::sigprocmask(SigHow::Block, SigSet::EMPTY).unwrap();
                assert!(mask.contains(Signal::Usr1));
            }
            0
        })?
    };

    ready_rx.recv()?;
    let pid = i32::try_from(u32::from(receiver.pid()))?;
    for round in 0..ROUNDS {
        syscall::kill(pid, Signal::Usr1.number())?;
        while handled.load(Ordering::SeqCst) <= round {
            syscall::yield_now()?;
        }
    }

    assert_eq!(receiver.join(), 0);
    assert_eq!(handled.load(Ordering::SeqCst), ROUNDS);
    Ok(())
}

#[test]
fn sigsuspend_returns_under_a_signal_flood() -> Result<(), anyhow::Error> {
    const ROUNDS: usize = 2000;
    const DEADLINE: Duration = Duration::from_secs(30);

    let kernel = Kernel::new(KernelConfig::default())?;
    let _init = kernel.attach("init")?;
    let handled = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicBool::new(false));
    let (ready_tx, ready_rx) = mpsc::channel();

    let receiver = {
        let handled = Arc::clone(&handled);
        let done = Arc::clone(&done);
        kernel.spawn("receiver", move || {
            let counter = Arc::clone(&handled);
            let handler = move |_: Signal| {
                counter.fetch_add(1, Ordering::SeqCst);
            };
            syscall::sigaction(Signal::Usr1, Disposition::Handler(Arc::new(handler))).unwrap();
            syscall::sigprocmask(SigHow::Block, SigSet::EMPTY.with(Signal::Usr1)).unwrap();
            ready_tx.send(()).unwrap();

            for round in 0..ROUNDS {
                assert_eq!(
                    syscall::sigsuspend(SigSet::EMPTY),
                    Err(SyscallError::Interrupted)
                );
                assert!(handled.load(Ordering::SeqCst) > round);
            }
            done.store(true, Ordering::SeqCst);
            0
        })?
    };

    ready_rx.recv()?;
    let pid = i32::try_from(u32::from(receiver.pid()))?;
    let start = Instant::now();
    let mut sent = 0_usize;
    while !done.load(Ordering::SeqCst) {
        if start.elapsed() > DEADLINE {
            syscall::kill(pid, Signal::Kill.number())?;
            break;
        }
        if syscall::kill(pid, Signal::Usr1.number()).is_err() {
            // the receiver may exit between the check and the kill
            assert!(done.load(Ordering::SeqCst));
            break;
        }
        sent += 1;
    }

    assert_eq!(receiver.join(), 0, "receiver stuck after {sent} signals");
    assert!(handled.load(Ordering::SeqCst) >= ROUNDS);
    Ok(())
}

#[test]
fn sigkill_ends_a_blocked_reader() -> Result<(), anyhow::Error> {
    let kernel = Kernel::new(KernelConfig::default())?;
    let _init = kernel.attach("init")?;

    let (r, _w) = syscall::pipe()?;
    let reader = kernel.spawn("reader", move || {
        let res = syscall::read(r, &mut [0; 4]);
        assert_eq!(res, Err(SyscallError::Killed));
        0
    })?;

    let pid = i32::try_from(u32::from(reader.pid()))?;
    syscall::kill(pid, Signal::Kill.number())?;
    assert_eq!(reader.join(), 128 + Signal::Kill as i32);
    Ok(())
}

#[test]
fn blocked_signal_stays_pending_until_sigwait() -> Result<(), anyhow::Error> {
    let kernel = Kernel::new(KernelConfig::default())?;
    let _init = kernel.attach("init")?;

    let set = SigSet::EMPTY.with(Signal::Usr2);
    syscall::sigprocmask(SigHow::Block, set)?;
    let me = i32::try_from(u32::from(syscall::getpid()?))?;
    syscall::kill(me, Signal::Usr2.number())?;
    assert!(syscall::sigpending()?.contains(Signal::Usr2));

    assert_eq!(syscall::sigwait(set)?, Signal::Usr2);
    assert!(syscall::sigpending()?.is_empty());
    Ok(())
}

#[test]
fn kill_reaches_a_process_group() -> Result<(), anyhow::Error> {
    let kernel = Kernel::new(KernelConfig::default())?;
    let _init = kernel.attach("init")?;

    let hits = Arc::new(AtomicUsize::new(0));
    let (ready_tx, ready_rx) = mpsc::channel();
    let mut members = vec![];
    for i in 0..3 {
        let hits = Arc::clone(&hits);
        let ready_tx = ready_tx.clone();
        members.push(kernel.spawn(&format!("member{i}"), move || {
            let (r, _w) = syscall::pipe().unwrap();
            let counter = Arc::clone(&hits);
            let handler = move |_: Signal| {
                counter.fetch_add(1, Ordering::SeqCst);
            };
            syscall::sigaction(Signal::Term, Disposition::Handler(Arc::new(handler))).unwrap();
            ready_tx.send(()).unwrap();
            // sleeps until the handler interrupts it
            assert_eq!(syscall::read(r, &mut [0; 1]), Err(SyscallError::Interrupted));
            0
        })?);
    }
    for _ in 0..3 {
        ready_rx.recv()?;
    }

    syscall::sigaction(Signal::Term, Disposition::Ignore)?;
    let pgid = i32::try_from(u32::from(syscall::getpgid(0)?))?;
    syscall::kill(-pgid, Signal::Term.number())?;
    for member in members {
        assert_eq!(member.join(), 0);
    }
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    Ok(())
}
