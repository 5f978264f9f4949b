//! Pipes and FIFOs.
//!
//! A pipe is a ring buffer plus counts of the ends open for reading and
//! writing. Anonymous pipes come as a pre-opened pair of nodes; FIFOs live
//! in a directory and every lookup yields a fresh end whose role is fixed
//! by the flags it is opened with.

use std::sync::Arc;

use misaka_types::{
    fs::{NodeFlags, OpenFlags},
    signal::Signal,
};

use crate::{
    error::KernelError,
    proc::{ProcTable, Process},
    ring_buffer::RingBuffer,
    signal,
    sync::SpinLock,
    vfs::{Capabilities, FileOps, Node, NodeRef},
};

#[derive(Default)]
struct Ends {
    readers: usize,
    writers: usize,
    /// Every reader has gone.
    read_closed: bool,
    /// Every writer has gone.
    write_closed: bool,
}

pub struct Pipe {
    buffer: RingBuffer,
    ends: SpinLock<Ends>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Read,
    Write,
    ReadWrite,
}

impl Role {
    fn from_flags(flags: OpenFlags) -> Self {
        match (flags.readable(), flags.writable()) {
            (true, true) => Self::ReadWrite,
            (false, true) => Self::Write,
            _ => Self::Read,
        }
    }

    fn reads(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    fn writes(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

impl Pipe {
    pub fn new(procs: &Arc<ProcTable>, size: usize) -> Arc<Self> {
        Arc::new(Self {
            buffer: RingBuffer::new(procs, size),
            ends: SpinLock::new(Ends::default()),
        })
    }

    fn attach(&self, role: Role) {
        let mut ends = self.ends.lock();
        if role.reads() {
            ends.readers += 1;
            ends.read_closed = false;
        }
        if role.writes() {
            ends.writers += 1;
            ends.write_closed = false;
        }
        if !ends.read_closed && !ends.write_closed {
            self.buffer.resume();
        }
    }

    fn detach(&self, role: Role) {
        let mut ends = self.ends.lock();
        if role.reads() {
            ends.readers -= 1;
            ends.read_closed = ends.readers == 0;
        }
        if role.writes() {
            ends.writers -= 1;
            ends.write_closed = ends.writers == 0;
        }
        if ends.read_closed || ends.write_closed {
            // blocked readers drain and see EOF; blocked writers give up
            self.buffer.interrupt();
        }
    }

    fn read_closed(&self) -> bool {
        self.ends.lock().read_closed
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize, KernelError> {
        self.buffer.read(buf)
    }

    /// Writes `buf`, failing with `BrokenPipe` (and raising `SIGPIPE` on
    /// the caller) once no reader is left.
    pub fn write(&self, buf: &[u8]) -> Result<usize, KernelError> {
        if self.read_closed() {
            return Err(broken_pipe());
        }
        let n = self.buffer.write(buf)?;
        if n < buf.len() && self.read_closed() {
            if n == 0 {
                return Err(broken_pipe());
            }
            raise_sigpipe();
        }
        Ok(n)
    }
}

fn raise_sigpipe() {
    if let Some(p) = Process::try_current() {
        signal::deliver(&p, Signal::Pipe);
    }
}

fn broken_pipe() -> KernelError {
    raise_sigpipe();
    KernelError::BrokenPipe
}

/// One end of a pipe.
struct PipeEnd {
    pipe: Arc<Pipe>,
    /// Fixed by the first open; `None` for a FIFO end not yet opened.
    role: SpinLock<Option<Role>>,
}

impl PipeEnd {
    fn role(&self) -> Option<Role> {
        *self.role.lock()
    }
}

impl FileOps for PipeEnd {
    fn capabilities(&self) -> Capabilities {
        Capabilities::READ
            | Capabilities::WRITE
            | Capabilities::OPEN
            | Capabilities::CLOSE
            | Capabilities::SELECT
    }

    fn read(&self, _node: &Node, _offset: u64, buf: &mut [u8]) -> Result<usize, KernelError> {
        match self.role() {
            Some(role) if role.reads() => self.pipe.read(buf),
            _ => Err(KernelError::BadFileDescriptor),
        }
    }

    fn write(&self, _node: &Node, _offset: u64, buf: &[u8]) -> Result<usize, KernelError> {
        match self.role() {
            Some(role) if role.writes() => self.pipe.write(buf),
            _ => Err(KernelError::BadFileDescriptor),
        }
    }

    fn open(&self, _node: &Node, flags: OpenFlags) -> Result<(), KernelError> {
        let mut role = self.role.lock();
        if role.is_none() {
            let new = Role::from_flags(flags);
            *role = Some(new);
            self.pipe.attach(new);
        }
        Ok(())
    }

    fn close(&self, _node: &Node) {
        if let Some(role) = self.role.lock().take() {
            self.pipe.detach(role);
        }
    }

    fn selectcheck(&self, _node: &Node) -> Result<bool, KernelError> {
        match self.role() {
            Some(role) if role.reads() => Ok(self.pipe.buffer.readable()),
            Some(_) => Ok(self.pipe.buffer.available() > 0 || self.pipe.read_closed()),
            None => Err(KernelError::InvalidInput),
        }
    }

    fn selectwait(&self, _node: &Node, p: &Process) -> Result<(), KernelError> {
        match self.role() {
            Some(role) if role.reads() => {
                self.pipe.buffer.select_wait(p);
                Ok(())
            }
            _ => Err(KernelError::InvalidInput),
        }
    }
}

fn end_node(name: &str, pipe: Arc<Pipe>, role: Option<Role>) -> Node {
    Node::new(
        name,
        NodeFlags::PIPE,
        PipeEnd {
            pipe,
            role: SpinLock::new(role),
        },
    )
    .with_mask(0o600)
}

/// Creates an anonymous pipe.
///
/// Returns the read end and the write end. Both ends are already counted;
/// opening them with `open_fs()` does not change their role.
pub fn make_unix_pipe(procs: &Arc<ProcTable>, size: usize) -> (NodeRef, NodeRef) {
    let pipe = Pipe::new(procs, size);
    pipe.attach(Role::ReadWrite);
    let read = end_node("[pipe:read]", Arc::clone(&pipe), Some(Role::Read));
    let write = end_node("[pipe:write]", pipe, Some(Role::Write));
    (Arc::new(read), Arc::new(write))
}

/// Returns a fresh, not yet opened end of FIFO `pipe`.
pub fn fifo_node(name: &str, pipe: &Arc<Pipe>) -> Node {
    end_node(name, Arc::clone(pipe), None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        proc::tests::with_process,
        vfs::{close_fs, open_fs, read_fs, selectcheck_fs, write_fs},
    };

    #[test]
    fn eof_after_last_writer_closes() {
        let procs = ProcTable::new(1);
        let (r, w) = make_unix_pipe(&procs, 16);
        open_fs(&r, OpenFlags::READ_ONLY).unwrap();
        open_fs(&w, OpenFlags::WRITE_ONLY).unwrap();
        with_process(&procs, |_| {
            assert_eq!(write_fs(&w, 0, b"bye"), Ok(3));
            close_fs(&w);
            let mut buf = [0; 8];
            assert_eq!(read_fs(&r, 0, &mut buf), Ok(3));
            assert_eq!(&buf[..3], b"bye");
            assert_eq!(read_fs(&r, 0, &mut buf), Ok(0));
        });
    }

    #[test]
    fn write_without_readers_fails() {
        let procs = ProcTable::new(1);
        let (r, w) = make_unix_pipe(&procs, 16);
        open_fs(&r, OpenFlags::READ_ONLY).unwrap();
        open_fs(&w, OpenFlags::WRITE_ONLY).unwrap();
        close_fs(&r);
        with_process(&procs, |p| {
            assert_eq!(write_fs(&w, 0, b"x"), Err(KernelError::BrokenPipe));
            assert!(p.signals.lock().pending().contains(Signal::Pipe));
        });
    }

    #[test]
    fn wrong_end_is_rejected() {
        let procs = ProcTable::new(1);
        let (r, w) = make_unix_pipe(&procs, 16);
        let mut buf = [0; 1];
        assert_eq!(write_fs(&r, 0, b"x"), Err(KernelError::BadFileDescriptor));
        assert_eq!(read_fs(&w, 0, &mut buf), Err(KernelError::BadFileDescriptor));
    }

    #[test]
    fn fifo_ends_take_role_from_open() {
        let procs = ProcTable::new(1);
        let pipe = Pipe::new(&procs, 16);
        let r = Arc::new(fifo_node("f", &pipe));
        let w = Arc::new(fifo_node("f", &pipe));
        open_fs(&r, OpenFlags::READ_ONLY).unwrap();
        open_fs(&w, OpenFlags::WRITE_ONLY).unwrap();
        with_process(&procs, |_| {
            assert_eq!(write_fs(&w, 0, b"hey"), Ok(3));
            assert_eq!(selectcheck_fs(&r), Ok(true));
            let mut buf = [0; 3];
            assert_eq!(read_fs(&r, 0, &mut buf), Ok(3));
            assert_eq!(selectcheck_fs(&r), Ok(false));
        });
    }
}
