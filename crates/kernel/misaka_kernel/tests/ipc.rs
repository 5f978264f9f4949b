#![cfg(test)]

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
    mpsc,
};

use dataview::PodMethods as _;
use misaka_kernel::{Kernel, config::KernelConfig, signal::Disposition, syscall};
use misaka_types::{
    error::SyscallError,
    ioctl::IoctlRequest,
    signal::{SigHow, SigSet, Signal},
    termios::Winsize,
};

fn read_all(fd: usize) -> Result<Vec<u8>, SyscallError> {
    let mut out = vec![];
    let mut buf = [0; 64];
    loop {
        let n = syscall::read(fd, &mut buf)?;
        if n == 0 {
            return Ok(out);
        }
        out.extend_from_slice(&buf[..n]);
    }
}

#[test]
fn pipe_reports_eof_after_last_writer() -> Result<(), anyhow::Error> {
    let kernel = Kernel::new(KernelConfig::default())?;
    let _init = kernel.attach("init")?;

    let (r, w) = syscall::pipe()?;
    let child = kernel.spawn("writer", move || {
        syscall::close(r).unwrap();
        assert_eq!(syscall::write(w, b"hello, ").unwrap(), 7);
        assert_eq!(syscall::write(w, b"pipe").unwrap(), 4);
        0
    })?;
    syscall::close(w)?;

    assert_eq!(read_all(r)?, b"hello, pipe");
    assert_eq!(child.join(), 0);
    // end of file is sticky
    assert_eq!(syscall::read(r, &mut [0; 8])?, 0);
    Ok(())
}

#[test]
fn broken_pipe_raises_sigpipe() -> Result<(), anyhow::Error> {
    let kernel = Kernel::new(KernelConfig::default())?;
    let _init = kernel.attach("init")?;

    let (r, w) = syscall::pipe()?;
    syscall::close(r)?;
    let old = syscall::sigaction(Signal::Pipe, Disposition::Ignore)?;
    assert!(matches!(old, Disposition::Default));
    assert_eq!(syscall::write(w, b"x"), Err(SyscallError::BrokenPipe));
    syscall::sigaction(Signal::Pipe, Disposition::Default)?;

    let child = kernel.spawn("victim", || {
        let (r, w) = syscall::pipe().unwrap();
        syscall::close(r).unwrap();
        assert_eq!(syscall::write(w, b"x"), Err(SyscallError::Killed));
        0
    })?;
    assert_eq!(child.join(), 128 + Signal::Pipe as i32);
    Ok(())
}

#[test]
fn pty_canonical_line_is_edited_and_delivered_once() -> Result<(), anyhow::Error> {
    let kernel = Kernel::new(KernelConfig::default())?;
    let _init = kernel.attach("init")?;

    let (master, slave) = syscall::openpty(None, None)?;
    assert_eq!(syscall::write(master, b"abc\x7fd\r")?, 6);

    let mut buf = [0; 32];
    let n = syscall::read(slave, &mut buf)?;
    assert_eq!(&buf[..n], b"abd\n");

    let n = syscall::read(master, &mut buf)?;
    assert!(buf[..n].starts_with(b"abc"));

    syscall::write(master, b"x\r")?;
    let n = syscall::read(slave, &mut buf)?;
    assert_eq!(&buf[..n], b"x\n");

    syscall::write(slave, b"out\n")?;
    let echo_and_output = {
        let mut out = vec![];
        while !out.ends_with(b"out\r\n") {
            let n = syscall::read(master, &mut buf)?;
            out.extend_from_slice(&buf[..n]);
        }
        out
    };
    assert!(echo_and_output.ends_with(b"out\r\n"));
    Ok(())
}

#[test]
fn window_resize_signals_the_foreground_group() -> Result<(), anyhow::Error> {
    let kernel = Kernel::new(KernelConfig::default())?;
    let _init = kernel.attach("init")?;

    let (master, slave) = syscall::openpty(None, None)?;
    syscall::ioctl(slave, IoctlRequest::TiocSctty.code(), &mut [])?;

    let resized = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&resized);
    let handler = move |_: Signal| {
        counter.fetch_add(1, Ordering::SeqCst);
    };
    syscall::sigaction(Signal::Winch, Disposition::Handler(Arc::new(handler)))?;

    let (ready_tx, ready_rx) = mpsc::channel();
    let member = kernel.spawn("member", move || {
        let winch = SigSet::EMPTY.with(Signal::Winch);
        syscall::sigprocmask(SigHow::Block, winch).unwrap();
        ready_tx.send(()).unwrap();
        assert_eq!(syscall::sigwait(winch), Ok(Signal::Winch));
        0
    })?;
    ready_rx.recv()?;

    let mut ws = Winsize {
        ws_row: 50,
        ws_col: 132,
        ..Winsize::default()
    };
    syscall::ioctl(master, IoctlRequest::TiocSwinsz.code(), ws.as_bytes_mut())?;
    assert_eq!(resized.load(Ordering::SeqCst), 1);
    assert_eq!(member.join(), 0);

    let mut seen = Winsize::default();
    syscall::ioctl(slave, IoctlRequest::TiocGwinsz.code(), seen.as_bytes_mut())?;
    assert_eq!((seen.ws_row, seen.ws_col), (50, 132));
    Ok(())
}

#[test]
fn pty_slave_is_listed_under_dev_pts() -> Result<(), anyhow::Error> {
    let kernel = Kernel::new(KernelConfig::default())?;
    let _init = kernel.attach("init")?;

    let (_master, _slave) = syscall::openpty(None, None)?;
    let dir = syscall::open("/dev/pts", misaka_types::fs::OpenFlags::READ_ONLY, 0)?;
    let mut names = vec![];
    let mut index = 0;
    while let Some(entry) = syscall::readdir(dir, index)? {
        names.push(entry.name);
        index += 1;
    }
    assert!(names.iter().any(|name| name == "0"));
    Ok(())
}

#[test]
fn pex_round_trip() -> Result<(), anyhow::Error> {
    let kernel = Kernel::new(KernelConfig::default())?;
    let _init = kernel.attach("init")?;

    let server = syscall::bind("echo")?;
    assert_eq!(syscall::bind("echo"), Err(SyscallError::AlreadyExists));

    let client = kernel.spawn("client", || {
        let fd = syscall::connect("echo").unwrap();
        syscall::reply(fd, b"ping").unwrap();
        let mut buf = [0; 16];
        let n = syscall::recv(fd, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"pong");
        0
    })?;

    let request = syscall::listen(server)?.unwrap();
    assert_eq!(request.data, b"ping");
    syscall::send(server, request.source, b"pong")?;

    // the client closing its end shows up as an empty packet
    let bye = syscall::listen(server)?.unwrap();
    assert_eq!(bye.source, request.source);
    assert!(bye.data.is_empty());
    assert_eq!(client.join(), 0);

    assert_eq!(syscall::connect("missing"), Err(SyscallError::FsEntryNotFound));
    Ok(())
}

#[test]
fn fswait_returns_ready_descriptor() -> Result<(), anyhow::Error> {
    let kernel = Kernel::new(KernelConfig::default())?;
    let _init = kernel.attach("init")?;

    let (r1, _w1) = syscall::pipe()?;
    let (r2, w2) = syscall::pipe()?;
    let child = kernel.spawn("late-writer", move || {
        for _ in 0..10 {
            syscall::yield_now().unwrap();
        }
        syscall::write(w2, b"!").unwrap();
        0
    })?;

    assert_eq!(syscall::fswait(&[r1, r2])?, 1);
    assert_eq!(child.join(), 0);
    Ok(())
}
