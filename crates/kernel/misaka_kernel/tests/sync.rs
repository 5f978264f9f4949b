#![cfg(test)]

use std::sync::Arc;

use misaka_kernel::{Kernel, config::KernelConfig, ring_buffer::RingBuffer, sync::SleepLock, syscall};

#[test]
fn sleep_lock_excludes_under_contention() -> Result<(), anyhow::Error> {
    const WORKERS: usize = 8;
    const ROUNDS: u64 = 200;

    let kernel = Kernel::new(KernelConfig::default())?;
    let _init = kernel.attach("init")?;
    let counter = Arc::new(SleepLock::new(kernel.procs(), 0_u64));

    let mut workers = vec![];
    for i in 0..WORKERS {
        let counter = Arc::clone(&counter);
        workers.push(kernel.spawn(&format!("worker{i}"), move || {
            for _ in 0..ROUNDS {
                let mut count = counter.lock();
                let seen = *count;
                syscall::yield_now().unwrap();
                *count = seen + 1;
            }
            0
        })?);
    }
    for worker in workers {
        assert_eq!(worker.join(), 0);
    }

    assert_eq!(*counter.lock(), WORKERS as u64 * ROUNDS);
    Ok(())
}

#[test]
fn ring_buffer_delivers_in_order() -> Result<(), anyhow::Error> {
    const TOTAL: usize = 16 * 1024;
    const CAPACITY: usize = 61;

    let kernel = Kernel::new(KernelConfig::default())?;
    let _init = kernel.attach("init")?;
    let ring = Arc::new(RingBuffer::new(kernel.procs(), CAPACITY));

    let writer = {
        let ring = Arc::clone(&ring);
        kernel.spawn("writer", move || {
            let data = (0..TOTAL).map(|i| (i % 251) as u8).collect::<Vec<_>>();
            let mut sent = 0;
            let mut chunk = 1;
            while sent < TOTAL {
                let end = usize::min(sent + chunk, TOTAL);
                sent += ring.write(&data[sent..end]).unwrap();
                chunk = chunk % 97 + 13;
            }
            0
        })?
    };

    let mut received = 0;
    let mut buf = [0; 40];
    while received < TOTAL {
        assert!(ring.unread() <= CAPACITY);
        let n = ring.read(&mut buf)?;
        assert!(n > 0);
        for (i, b) in buf[..n].iter().enumerate() {
            assert_eq!(usize::from(*b), (received + i) % 251);
        }
        received += n;
    }
    assert_eq!(writer.join(), 0);
    assert_eq!(ring.unread(), 0);
    Ok(())
}

#[test]
fn interrupt_is_idempotent() -> Result<(), anyhow::Error> {
    let kernel = Kernel::new(KernelConfig::default())?;
    let _init = kernel.attach("init")?;
    let ring = Arc::new(RingBuffer::new(kernel.procs(), 16));
    assert_eq!(ring.try_write(b"left"), 4);

    let reader = {
        let ring = Arc::clone(&ring);
        kernel.spawn("reader", move || {
            let mut buf = [0; 16];
            assert_eq!(ring.read(&mut buf).unwrap(), 4);
            // blocks until interrupted
            assert_eq!(ring.read(&mut buf).unwrap(), 0);
            assert_eq!(ring.read(&mut buf).unwrap(), 0);
            0
        })?
    };

    while ring.unread() > 0 {
        syscall::yield_now()?;
    }
    ring.interrupt();
    ring.interrupt();
    assert_eq!(reader.join(), 0);

    assert_eq!(ring.try_write(b"late"), 0);
    assert_eq!(ring.write(b"late")?, 0);
    ring.resume();
    assert_eq!(ring.try_write(b"back"), 4);
    Ok(())
}
