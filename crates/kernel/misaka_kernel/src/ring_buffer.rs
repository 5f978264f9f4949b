//! Bounded byte queue with blocking readers and writers.
//!
//! Shared by pipes, PTYs and the packet exchange. Bytes are copied while the
//! buffer lock is held, so a read or write is atomic with respect to other
//! readers and writers of the same buffer.

use std::sync::Arc;

use crate::{
    error::KernelError,
    proc::{ProcTable, Process},
    sync::{SpinLock, SpinLockGuard, WaitQueue},
};

struct Inner {
    /// One slot larger than the capacity so that full and empty differ.
    buf: Box<[u8]>,
    read_ptr: usize,
    write_ptr: usize,
    /// Interrupted: blocked and future calls return instead of waiting.
    internal_stop: bool,
    /// One-shot end of file for the next read on an empty buffer.
    soft_stop: bool,
    /// Writers drop what does not fit instead of waiting.
    discard: bool,
}

impl Inner {
    fn unread(&self) -> usize {
        (self.write_ptr + self.buf.len() - self.read_ptr) % self.buf.len()
    }

    fn available(&self) -> usize {
        self.buf.len() - 1 - self.unread()
    }

    fn push(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.available());
        for &b in &data[..n] {
            self.buf[self.write_ptr] = b;
            self.write_ptr = (self.write_ptr + 1) % self.buf.len();
        }
        n
    }

    fn peek(&self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.unread());
        let mut ptr = self.read_ptr;
        for b in &mut out[..n] {
            *b = self.buf[ptr];
            ptr = (ptr + 1) % self.buf.len();
        }
        n
    }

    fn pop(&mut self, out: &mut [u8]) -> usize {
        let n = self.peek(out);
        self.read_ptr = (self.read_ptr + n) % self.buf.len();
        n
    }
}

type Guard<'a> = SpinLockGuard<'a, Inner>;

pub struct RingBuffer {
    inner: SpinLock<Inner>,
    readers: WaitQueue,
    writers: WaitQueue,
    /// Processes waiting in `fswait` for this buffer to become readable.
    alert: WaitQueue,
}

impl RingBuffer {
    pub fn new(procs: &Arc<ProcTable>, capacity: usize) -> Self {
        Self {
            inner: SpinLock::new(Inner {
                buf: vec![0; capacity + 1].into_boxed_slice(),
                read_ptr: 0,
                write_ptr: 0,
                internal_stop: false,
                soft_stop: false,
                discard: false,
            }),
            readers: WaitQueue::new(procs),
            writers: WaitQueue::new(procs),
            alert: WaitQueue::new(procs),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().buf.len() - 1
    }

    /// Number of bytes waiting to be read.
    pub fn unread(&self) -> usize {
        self.inner.lock().unread()
    }

    /// Number of bytes that can be written without blocking.
    pub fn available(&self) -> usize {
        self.inner.lock().available()
    }

    /// Whether a read would return without blocking.
    pub fn readable(&self) -> bool {
        let inner = self.inner.lock();
        inner.unread() > 0 || inner.internal_stop || inner.soft_stop
    }

    fn after_read(&self, inner: &Inner) {
        self.writers.wake_one();
        if inner.unread() > 0 {
            self.readers.wake_one();
        }
    }

    fn after_write(&self) {
        self.readers.wake_one();
        self.alert.wake_all();
    }

    fn wait_readable<'a>(&self, mut inner: Guard<'a>) -> Result<Option<Guard<'a>>, KernelError> {
        while inner.unread() == 0 {
            if inner.internal_stop {
                return Ok(None);
            }
            if inner.soft_stop {
                inner.soft_stop = false;
                return Ok(None);
            }
            inner = self
                .readers
                .sleep_on_unlocking(inner)
                .map_err(|(_, e)| e)?;
        }
        Ok(Some(inner))
    }

    /// Reads up to `buf.len()` bytes, waiting while the buffer is empty.
    ///
    /// Returns 0 once the buffer is interrupted and drained, or for the read
    /// consuming an end of file set by `eof()`.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, KernelError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let Some(mut inner) = self.wait_readable(self.inner.lock())? else {
            return Ok(0);
        };
        let n = inner.pop(buf);
        self.after_read(&inner);
        Ok(n)
    }

    /// Reads what is buffered without waiting.
    ///
    /// Returns `WouldBlock` when a `read()` would have slept.
    pub fn try_read(&self, buf: &mut [u8]) -> Result<usize, KernelError> {
        let mut inner = self.inner.lock();
        if inner.unread() == 0 {
            if inner.internal_stop {
                return Ok(0);
            }
            if inner.soft_stop {
                inner.soft_stop = false;
                return Ok(0);
            }
            return Err(KernelError::WouldBlock);
        }
        let n = inner.pop(buf);
        self.after_read(&inner);
        Ok(n)
    }

    /// Writes all of `buf`, waiting for space as needed.
    ///
    /// Returns a short count if the buffer is interrupted, if it is in
    /// discard mode, or if a signal arrives after some bytes were written.
    pub fn write(&self, buf: &[u8]) -> Result<usize, KernelError> {
        let mut written = 0;
        let mut inner = self.inner.lock();
        while written < buf.len() && !inner.internal_stop {
            let n = inner.push(&buf[written..]);
            written += n;
            if n > 0 {
                self.after_write();
            }
            if written == buf.len() || inner.discard {
                break;
            }
            inner = match self.writers.sleep_on_unlocking(inner) {
                Ok(inner) => inner,
                Err((_, e)) if written == 0 => return Err(e),
                Err(_) => return Ok(written),
            };
        }
        if inner.available() > 0 {
            self.writers.wake_one();
        }
        Ok(written)
    }

    /// Writes as much of `buf` as fits without waiting.
    pub fn try_write(&self, buf: &[u8]) -> usize {
        let mut inner = self.inner.lock();
        if inner.internal_stop {
            return 0;
        }
        let n = inner.push(buf);
        if n > 0 {
            self.after_write();
        }
        n
    }

    /// Writes `header` followed by `payload` as one unit.
    ///
    /// Either both are written or neither is. Returns the number of bytes
    /// written, which is 0 if the buffer was interrupted or the packet was
    /// dropped in discard mode.
    pub fn write_packet(
        &self,
        header: &[u8],
        payload: &[u8],
        nonblocking: bool,
    ) -> Result<usize, KernelError> {
        let total = header.len() + payload.len();
        if total > self.capacity() {
            return Err(KernelError::MessageTooLong);
        }

        let mut inner = self.inner.lock();
        loop {
            if inner.internal_stop {
                return Ok(0);
            }
            if inner.available() >= total {
                inner.push(header);
                inner.push(payload);
                self.after_write();
                return Ok(total);
            }
            if inner.discard {
                return Ok(0);
            }
            if nonblocking {
                return Err(KernelError::WouldBlock);
            }
            inner = self
                .writers
                .sleep_on_unlocking(inner)
                .map_err(|(_, e)| e)?;
        }
    }

    /// Reads one unit written by `write_packet()`.
    ///
    /// `header` receives the fixed-size header; `payload_len` computes the
    /// payload size from it. Returns the payload size, or 0 at end of file.
    /// If the payload does not fit in `payload`, fails with `InvalidInput`
    /// and leaves the packet queued.
    pub fn read_packet<F>(
        &self,
        header: &mut [u8],
        payload: &mut [u8],
        payload_len: F,
        nonblocking: bool,
    ) -> Result<usize, KernelError>
    where
        F: Fn(&[u8]) -> usize,
    {
        let mut inner = self.inner.lock();
        loop {
            if inner.unread() >= header.len() {
                inner.peek(header);
                let len = payload_len(header);
                if len > payload.len() {
                    return Err(KernelError::InvalidInput);
                }
                if inner.unread() >= header.len() + len {
                    inner.pop(header);
                    inner.pop(&mut payload[..len]);
                    self.after_read(&inner);
                    return Ok(len);
                }
            }
            if nonblocking {
                if inner.internal_stop {
                    return Ok(0);
                }
                return Err(KernelError::WouldBlock);
            }
            match self.wait_more(inner)? {
                Some(next) => inner = next,
                None => return Ok(0),
            }
        }
    }

    fn wait_more<'a>(&self, mut inner: Guard<'a>) -> Result<Option<Guard<'a>>, KernelError> {
        if inner.internal_stop {
            return Ok(None);
        }
        if inner.soft_stop {
            inner.soft_stop = false;
            return Ok(None);
        }
        let inner = self
            .readers
            .sleep_on_unlocking(inner)
            .map_err(|(_, e)| e)?;
        Ok(Some(inner))
    }

    /// Discards every unread byte.
    pub fn flush(&self) {
        let mut inner = self.inner.lock();
        inner.read_ptr = inner.write_ptr;
        self.writers.wake_all();
    }

    /// Stops the buffer: blocked readers and writers return, and future
    /// reads return 0 once drained.
    ///
    /// Returns the number of processes woken. Calling it again is harmless.
    pub fn interrupt(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.internal_stop = true;
        self.readers.wake_all() + self.writers.wake_all() + self.alert.wake_all()
    }

    /// Makes the next read on an empty buffer return 0 once.
    pub fn eof(&self) {
        let mut inner = self.inner.lock();
        inner.soft_stop = true;
        self.readers.wake_all();
        self.alert.wake_all();
    }

    /// Clears a previous `interrupt()` or `eof()`.
    pub fn resume(&self) {
        let mut inner = self.inner.lock();
        inner.internal_stop = false;
        inner.soft_stop = false;
    }

    pub fn set_discard(&self, discard: bool) {
        self.inner.lock().discard = discard;
    }

    /// Subscribes `p` to be woken when data arrives.
    pub fn select_wait(&self, p: &Process) {
        self.alert.subscribe(p);
    }

    pub fn alert_waiters(&self) -> usize {
        self.alert.wake_all()
    }
}
