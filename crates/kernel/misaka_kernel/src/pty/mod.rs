//! Pseudo-terminals.
//!
//! A PTY pairs a master node, driven by a terminal emulator, with a slave
//! node used by the programs running in the terminal. Bytes written to the
//! master pass through the line discipline into the input buffer; bytes
//! written to the slave pass through output processing into the output
//! buffer.

use core::sync::atomic::{AtomicUsize, Ordering};
use std::{
    collections::BTreeMap,
    string::{String, ToString as _},
    sync::{Arc, Weak},
};

use dataview::{Pod, PodMethods as _};
use misaka_types::{
    fs::{Dirent, NodeFlags, OpenFlags},
    ioctl::{DTYPE_TTY, IoctlRequest, TCIFLUSH, TCIOFLUSH, TCOFLUSH},
    process::ProcId,
    signal::Signal,
    termios::{LocalFlags, Termios, VMIN, Winsize},
};

use self::line_discipline::{InputEffects, LineDiscipline};
use crate::{
    error::KernelError,
    proc::{ProcTable, Process},
    ring_buffer::RingBuffer,
    signal,
    sync::SpinLock,
    vfs::{Capabilities, FileOps, Node, NodeRef},
};

pub mod line_discipline;

struct PtyState {
    termios: Termios,
    winsize: Winsize,
    ldisc: LineDiscipline,
    /// Session the terminal controls.
    session: Option<ProcId>,
    /// Foreground process group, target of terminal-generated signals.
    foreground: Option<ProcId>,
    /// The master side has been closed.
    hung_up: bool,
}

pub struct Pty {
    index: usize,
    name: String,
    procs: Arc<ProcTable>,
    state: SpinLock<PtyState>,
    /// Master to slave.
    input: RingBuffer,
    /// Slave to master.
    output: RingBuffer,
    slave: SpinLock<Weak<Node>>,
}

/// Copies a `T` out of an ioctl argument buffer.
fn read_arg<T: Pod>(arg: &[u8]) -> Result<T, KernelError> {
    let mut value = T::zeroed();
    let bytes = value.as_bytes_mut();
    let src = arg.get(..bytes.len()).ok_or(KernelError::InvalidInput)?;
    bytes.copy_from_slice(src);
    Ok(value)
}

/// Copies `value` into an ioctl argument buffer.
fn write_arg<T: Pod>(arg: &mut [u8], value: &T) -> Result<usize, KernelError> {
    let bytes = value.as_bytes();
    arg.get_mut(..bytes.len())
        .ok_or(KernelError::InvalidInput)?
        .copy_from_slice(bytes);
    Ok(0)
}

impl Pty {
    fn new(
        procs: &Arc<ProcTable>,
        index: usize,
        buffer_size: usize,
        termios: Termios,
        winsize: Winsize,
    ) -> Self {
        Self {
            index,
            name: format!("/dev/pts/{index}"),
            procs: Arc::clone(procs),
            state: SpinLock::new(PtyState {
                termios,
                winsize,
                ldisc: LineDiscipline::new(),
                session: None,
                foreground: None,
                hung_up: false,
            }),
            input: RingBuffer::new(procs, buffer_size),
            output: RingBuffer::new(procs, buffer_size),
            slave: SpinLock::new(Weak::new()),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn termios(&self) -> Termios {
        self.state.lock().termios
    }

    pub fn winsize(&self) -> Winsize {
        self.state.lock().winsize
    }

    pub fn foreground(&self) -> Option<ProcId> {
        self.state.lock().foreground
    }

    /// Returns the slave node, creating a new one if every previous one is
    /// gone.
    fn slave_node(self: &Arc<Self>) -> NodeRef {
        let mut slave = self.slave.lock();
        if let Some(node) = slave.upgrade() {
            return node;
        }
        let (uid, gid) = Process::try_current().map_or((0, 0), |p| (p.uid(), p.gid()));
        let node = Arc::new(
            Node::new(
                self.index.to_string(),
                NodeFlags::CHAR_DEVICE,
                SlaveOps {
                    pty: Arc::clone(self),
                },
            )
            .with_mask(0o620)
            .with_owner(uid, gid)
            .with_inode(self.index as u64),
        );
        *slave = Arc::downgrade(&node);
        node
    }

    fn signal_foreground(&self, sig: Signal) {
        let Some(pgid) = self.foreground() else {
            return;
        };
        if let Err(e) = signal::send_signal_group(&self.procs, None, pgid, sig) {
            log::debug!("{}: {sig} to group {pgid}: {e}", self.name);
        }
    }

    /// Runs one byte typed on the master through the line discipline.
    fn input_byte(&self, c: u8) -> Result<(), KernelError> {
        let mut fx = InputEffects::default();
        let termios = {
            let mut state = self.state.lock();
            let state = &mut *state;
            state.ldisc.input(&state.termios, c, &mut fx);
            state.termios
        };

        if !fx.echo.is_empty() {
            let mut out = Vec::with_capacity(fx.echo.len());
            for &b in &fx.echo {
                line_discipline::output(&termios, b, &mut out);
            }
            self.output.write(&out)?;
        }
        if let Some(sig) = fx.signal {
            self.signal_foreground(sig);
        }
        if !fx.to_reader.is_empty() {
            self.input.write(&fx.to_reader)?;
        }
        if fx.eof {
            self.input.eof();
        }
        Ok(())
    }

    /// Feeds `buf` to the terminal as if typed.
    pub fn master_write(&self, buf: &[u8]) -> Result<usize, KernelError> {
        for (i, &c) in buf.iter().enumerate() {
            if let Err(e) = self.input_byte(c) {
                if i == 0 {
                    return Err(e);
                }
                return Ok(i);
            }
        }
        Ok(buf.len())
    }

    pub fn master_read(&self, buf: &mut [u8]) -> Result<usize, KernelError> {
        self.output.read(buf)
    }

    pub fn slave_read(&self, buf: &mut [u8]) -> Result<usize, KernelError> {
        let (canonical, vmin) = {
            let state = self.state.lock();
            (
                state.termios.lflag().contains(LocalFlags::ICANON),
                state.termios.c_cc[VMIN],
            )
        };
        if !canonical && vmin == 0 {
            return match self.input.try_read(buf) {
                Err(KernelError::WouldBlock) => Ok(0),
                res => res,
            };
        }
        self.input.read(buf)
    }

    /// Writes `buf` with output processing applied.
    ///
    /// A short count is the number of bytes of `buf` whose translation was
    /// written in full.
    pub fn slave_write(&self, buf: &[u8]) -> Result<usize, KernelError> {
        let termios = self.termios();
        let mut out = Vec::with_capacity(buf.len());
        // ends[i] is the length of `out` once `buf[i]` is translated
        let mut ends = Vec::with_capacity(buf.len());
        for &c in buf {
            line_discipline::output(&termios, c, &mut out);
            ends.push(out.len());
        }
        let written = self.output.write(&out)?;
        Ok(ends.partition_point(|&end| end <= written))
    }

    fn hangup(&self) {
        self.state.lock().hung_up = true;
        self.input.interrupt();
        self.output.interrupt();
        self.signal_foreground(Signal::Hup);
    }

    fn flush_input(&self) {
        self.state.lock().ldisc.clear();
        self.input.flush();
    }

    fn set_termios(&self, termios: Termios) {
        let pending = {
            let mut state = self.state.lock();
            let leaving_canonical = state.termios.lflag().contains(LocalFlags::ICANON)
                && !termios.lflag().contains(LocalFlags::ICANON);
            state.termios = termios;
            if leaving_canonical {
                state.ldisc.take()
            } else {
                Vec::new()
            }
        };
        if !pending.is_empty() {
            self.input.try_write(&pending);
        }
    }

    /// Terminal ioctls, shared by both sides.
    pub fn ioctl(&self, request: u64, arg: &mut [u8]) -> Result<usize, KernelError> {
        let request = IoctlRequest::from_repr(request).ok_or(KernelError::InvalidInput)?;
        match request {
            IoctlRequest::DeviceType => Ok(DTYPE_TTY),
            IoctlRequest::TtyName => {
                let name = self.name.as_bytes();
                let dst = arg
                    .get_mut(..=name.len())
                    .ok_or(KernelError::InvalidInput)?;
                dst[..name.len()].copy_from_slice(name);
                dst[name.len()] = 0;
                Ok(0)
            }
            IoctlRequest::TcGets => write_arg(arg, &self.termios()),
            IoctlRequest::TcSets | IoctlRequest::TcSetsW => {
                self.set_termios(read_arg(arg)?);
                Ok(0)
            }
            IoctlRequest::TcSetsF => {
                let termios = read_arg(arg)?;
                self.flush_input();
                self.set_termios(termios);
                Ok(0)
            }
            IoctlRequest::TcFlsh => {
                match read_arg::<u32>(arg)? {
                    TCIFLUSH => self.flush_input(),
                    TCOFLUSH => self.output.flush(),
                    TCIOFLUSH => {
                        self.flush_input();
                        self.output.flush();
                    }
                    _ => return Err(KernelError::InvalidInput),
                }
                Ok(0)
            }
            IoctlRequest::TiocGwinsz => write_arg(arg, &self.winsize()),
            IoctlRequest::TiocSwinsz => {
                self.state.lock().winsize = read_arg(arg)?;
                self.signal_foreground(Signal::Winch);
                Ok(0)
            }
            IoctlRequest::TiocSctty => {
                let p = Process::try_current().ok_or(KernelError::InvalidInput)?;
                let mut state = self.state.lock();
                if state.session.is_some_and(|sid| sid != p.sid()) && p.uid() != 0 {
                    return Err(KernelError::NotPermitted);
                }
                state.session = Some(p.sid());
                state.foreground = Some(p.pgid());
                Ok(0)
            }
            IoctlRequest::TiocGpgrp => {
                let pgid = self.foreground().map_or(0, u32::from);
                write_arg(arg, &pgid)
            }
            IoctlRequest::TiocSpgrp => {
                let pgid = ProcId::from_raw(read_arg::<u32>(arg)?).ok_or(KernelError::InvalidInput)?;
                self.state.lock().foreground = Some(pgid);
                Ok(0)
            }
            IoctlRequest::PacketfsQueued => Err(KernelError::NoTty),
        }
    }
}

const TTY_CAPABILITIES: Capabilities = Capabilities::READ
    .union(Capabilities::WRITE)
    .union(Capabilities::IOCTL)
    .union(Capabilities::CLOSE)
    .union(Capabilities::SELECT);

struct MasterOps {
    pty: Arc<Pty>,
}

impl FileOps for MasterOps {
    fn capabilities(&self) -> Capabilities {
        TTY_CAPABILITIES
    }

    fn read(&self, _node: &Node, _offset: u64, buf: &mut [u8]) -> Result<usize, KernelError> {
        self.pty.master_read(buf)
    }

    fn write(&self, _node: &Node, _offset: u64, buf: &[u8]) -> Result<usize, KernelError> {
        self.pty.master_write(buf)
    }

    fn ioctl(&self, _node: &Node, request: u64, arg: &mut [u8]) -> Result<usize, KernelError> {
        self.pty.ioctl(request, arg)
    }

    fn close(&self, _node: &Node) {
        log::debug!("{}: master closed", self.pty.name);
        self.pty.hangup();
    }

    fn selectcheck(&self, _node: &Node) -> Result<bool, KernelError> {
        Ok(self.pty.output.readable())
    }

    fn selectwait(&self, _node: &Node, p: &Process) -> Result<(), KernelError> {
        self.pty.output.select_wait(p);
        Ok(())
    }
}

struct SlaveOps {
    pty: Arc<Pty>,
}

impl FileOps for SlaveOps {
    fn capabilities(&self) -> Capabilities {
        TTY_CAPABILITIES | Capabilities::OPEN
    }

    fn read(&self, _node: &Node, _offset: u64, buf: &mut [u8]) -> Result<usize, KernelError> {
        self.pty.slave_read(buf)
    }

    fn write(&self, _node: &Node, _offset: u64, buf: &[u8]) -> Result<usize, KernelError> {
        self.pty.slave_write(buf)
    }

    fn ioctl(&self, _node: &Node, request: u64, arg: &mut [u8]) -> Result<usize, KernelError> {
        self.pty.ioctl(request, arg)
    }

    fn open(&self, _node: &Node, _flags: OpenFlags) -> Result<(), KernelError> {
        if !self.pty.state.lock().hung_up {
            self.pty.output.resume();
        }
        Ok(())
    }

    fn close(&self, _node: &Node) {
        // the master drains what is left, then reads end of file
        self.pty.output.interrupt();
    }

    fn selectcheck(&self, _node: &Node) -> Result<bool, KernelError> {
        Ok(self.pty.input.readable())
    }

    fn selectwait(&self, _node: &Node, p: &Process) -> Result<(), KernelError> {
        self.pty.input.select_wait(p);
        Ok(())
    }
}

/// Every live PTY, and the `/dev/pts` directory listing them.
pub struct PtyTable {
    procs: Arc<ProcTable>,
    buffer_size: usize,
    next_index: AtomicUsize,
    ptys: SpinLock<BTreeMap<usize, Weak<Pty>>>,
}

impl PtyTable {
    pub fn new(procs: &Arc<ProcTable>, buffer_size: usize) -> Arc<Self> {
        Arc::new(Self {
            procs: Arc::clone(procs),
            buffer_size,
            next_index: AtomicUsize::new(0),
            ptys: SpinLock::new(BTreeMap::new()),
        })
    }

    /// Allocates a new PTY.
    ///
    /// Returns its master and slave nodes, not yet opened.
    pub fn openpty(
        &self,
        termios: Option<&Termios>,
        winsize: Option<&Winsize>,
    ) -> (NodeRef, NodeRef) {
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        let pty = Arc::new(Pty::new(
            &self.procs,
            index,
            self.buffer_size,
            termios.copied().unwrap_or_default(),
            winsize.copied().unwrap_or_default(),
        ));

        {
            let mut ptys = self.ptys.lock();
            ptys.retain(|_, pty| pty.strong_count() > 0);
            ptys.insert(index, Arc::downgrade(&pty));
        }

        let slave = pty.slave_node();
        let master = Arc::new(
            Node::new(
                format!("[ptm:{index}]"),
                NodeFlags::CHAR_DEVICE,
                MasterOps { pty },
            )
            .with_mask(0o600),
        );
        log::debug!("allocated /dev/pts/{index}");
        (master, slave)
    }

    pub fn get(&self, index: usize) -> Option<Arc<Pty>> {
        self.ptys.lock().get(&index)?.upgrade()
    }

    /// Directory node listing every live PTY by index.
    pub fn pts_root(self: &Arc<Self>) -> NodeRef {
        Arc::new(
            Node::new(
                "pts",
                NodeFlags::DIRECTORY,
                PtsDirOps {
                    table: Arc::clone(self),
                },
            )
            .with_mask(0o555),
        )
    }
}

struct PtsDirOps {
    table: Arc<PtyTable>,
}

impl FileOps for PtsDirOps {
    fn capabilities(&self) -> Capabilities {
        Capabilities::READDIR | Capabilities::FINDDIR
    }

    fn readdir(&self, _node: &Node, index: usize) -> Option<Dirent> {
        match index {
            0 => return Some(Dirent::new(0, ".")),
            1 => return Some(Dirent::new(0, "..")),
            _ => {}
        }
        let ptys = self.table.ptys.lock();
        ptys.iter()
            .filter(|(_, pty)| pty.strong_count() > 0)
            .nth(index - 2)
            .map(|(&i, _)| Dirent::new(i as u64, i.to_string()))
    }

    fn finddir(&self, _node: &Node, name: &str) -> Option<NodeRef> {
        let index = name.parse().ok()?;
        Some(self.table.get(index)?.slave_node())
    }
}
