//! Packet exchange.
//!
//! Named exchanges live in a directory (mounted at `/dev/pex`). The endpoint
//! opened with `CREATE | EXCL` on a new exchange is its server; every other
//! open is a client with a buffer of its own. Clients send to the server's
//! buffer, tagged with their id; the server addresses one client or all of
//! them.

use core::sync::atomic::{AtomicU64, Ordering};
use std::{
    collections::{BTreeMap, VecDeque},
    string::{String, ToString as _},
    sync::Arc,
};

use dataview::{DataView, PodMethods as _};
use misaka_kernel_params::MAX_PACKET_SIZE;
use misaka_types::{
    fs::{Dirent, NodeFlags, OpenFlags},
    ioctl::IoctlRequest,
    pex::{BROADCAST, PacketHeader, PexHeader},
};

use crate::{
    error::KernelError,
    proc::{ProcTable, Process},
    ring_buffer::RingBuffer,
    sync::SpinLock,
    vfs::{Capabilities, FileOps, Node, NodeRef},
};

struct ExchangeState {
    server_bound: bool,
    clients: BTreeMap<u64, Arc<RingBuffer>>,
    next_client: u64,
    /// Clients whose close notice did not fit in the server buffer.
    departed: VecDeque<u64>,
}

struct Exchange {
    name: String,
    inode: u64,
    /// Packets from clients, prefixed with `PacketHeader`.
    server_buffer: RingBuffer,
    state: SpinLock<ExchangeState>,
}

fn packet_header(source: u64, payload: &[u8]) -> PacketHeader {
    PacketHeader {
        source,
        size: payload.len() as u64,
    }
}

fn payload_len(header: &[u8]) -> usize {
    DataView::from(header)
        .try_read::<PacketHeader>(0)
        .map_or(0, |h| usize::try_from(h.size).unwrap_or(usize::MAX))
}

/// Queues `payload` in a client buffer. A full buffer drops the packet.
fn send_to_client(buffer: &RingBuffer, payload: &[u8]) -> Result<usize, KernelError> {
    let header = packet_header(BROADCAST, payload);
    buffer.write_packet(header.as_bytes(), payload, true)
}

impl Exchange {
    fn send(&self, target: u64, payload: &[u8]) -> Result<(), KernelError> {
        let targets = {
            let state = self.state.lock();
            if target == BROADCAST {
                state.clients.values().cloned().collect::<Vec<_>>()
            } else {
                let client = state.clients.get(&target).ok_or(KernelError::NoSuchClient)?;
                vec![Arc::clone(client)]
            }
        };
        for buffer in targets {
            if send_to_client(&buffer, payload)? == 0 {
                log::debug!("{}: packet to a full client dropped", self.name);
            }
        }
        Ok(())
    }
}

#[derive(Clone)]
enum Role {
    Server,
    Client { id: u64, buffer: Arc<RingBuffer> },
}

/// One open end of an exchange.
struct EndpointOps {
    bus: Arc<PexBus>,
    exchange: Arc<Exchange>,
    role: SpinLock<Option<Role>>,
}

impl EndpointOps {
    fn role(&self) -> Result<Role, KernelError> {
        self.role
            .lock()
            .clone()
            .ok_or(KernelError::BadFileDescriptor)
    }

    fn with_read_buffer<T>(&self, f: impl FnOnce(&RingBuffer) -> T) -> Result<T, KernelError> {
        match self.role()? {
            Role::Server => Ok(f(&self.exchange.server_buffer)),
            Role::Client { buffer, .. } => Ok(f(&buffer)),
        }
    }

    fn server_read(&self, buf: &mut [u8]) -> Result<usize, KernelError> {
        if buf.len() < PacketHeader::SIZE {
            return Err(KernelError::InvalidInput);
        }
        let (header, payload) = buf.split_at_mut(PacketHeader::SIZE);
        if let Some(id) = self.exchange.state.lock().departed.pop_front() {
            header.copy_from_slice(packet_header(id, &[]).as_bytes());
            return Ok(PacketHeader::SIZE);
        }
        header.fill(0);
        let n = self
            .exchange
            .server_buffer
            .read_packet(header, payload, payload_len, false)?;
        // client ids start at 1; a zero source means nothing was read
        let source = DataView::from(&*header)
            .try_read::<PacketHeader>(0)
            .map_or(0, |h| h.source);
        if n == 0 && source == 0 {
            return Ok(0);
        }
        Ok(PacketHeader::SIZE + n)
    }

    fn server_write(&self, buf: &[u8]) -> Result<usize, KernelError> {
        let header = DataView::from(buf)
            .try_read::<PexHeader>(0)
            .ok_or(KernelError::InvalidInput)?;
        let payload = &buf[PexHeader::SIZE..];
        if payload.len() > MAX_PACKET_SIZE {
            return Err(KernelError::MessageTooLong);
        }
        self.exchange.send(header.target, payload)?;
        Ok(buf.len())
    }

    fn client_read(&self, buffer: &RingBuffer, buf: &mut [u8]) -> Result<usize, KernelError> {
        let mut header = [0; PacketHeader::SIZE];
        buffer.read_packet(&mut header, buf, payload_len, false)
    }

    fn client_write(&self, id: u64, buf: &[u8]) -> Result<usize, KernelError> {
        if buf.len() > MAX_PACKET_SIZE {
            return Err(KernelError::MessageTooLong);
        }
        let header = packet_header(id, buf);
        match self
            .exchange
            .server_buffer
            .write_packet(header.as_bytes(), buf, false)?
        {
            0 => Err(KernelError::BrokenPipe),
            _ => Ok(buf.len()),
        }
    }

    fn bind(&self) -> Result<Role, KernelError> {
        let mut state = self.exchange.state.lock();
        if state.server_bound {
            return Err(KernelError::EndpointAlreadyBound);
        }
        state.server_bound = true;
        log::info!("pex {}: bound", self.exchange.name);
        Ok(Role::Server)
    }

    fn connect(&self) -> Result<Role, KernelError> {
        if !self.bus.contains(&self.exchange) {
            return Err(KernelError::FsEntryNotFound);
        }
        let mut state = self.exchange.state.lock();
        state.next_client += 1;
        let id = state.next_client;
        let buffer = Arc::new(RingBuffer::new(&self.bus.procs, self.bus.buffer_size));
        buffer.set_discard(true);
        state.clients.insert(id, Arc::clone(&buffer));
        log::debug!("pex {}: client {id} connected", self.exchange.name);
        Ok(Role::Client { id, buffer })
    }
}

impl FileOps for EndpointOps {
    fn capabilities(&self) -> Capabilities {
        Capabilities::READ
            | Capabilities::WRITE
            | Capabilities::OPEN
            | Capabilities::CLOSE
            | Capabilities::IOCTL
            | Capabilities::SELECT
    }

    fn read(&self, _node: &Node, _offset: u64, buf: &mut [u8]) -> Result<usize, KernelError> {
        match self.role()? {
            Role::Server => self.server_read(buf),
            Role::Client { buffer, .. } => self.client_read(&buffer, buf),
        }
    }

    fn write(&self, _node: &Node, _offset: u64, buf: &[u8]) -> Result<usize, KernelError> {
        match self.role()? {
            Role::Server => self.server_write(buf),
            Role::Client { id, .. } => self.client_write(id, buf),
        }
    }

    fn open(&self, _node: &Node, flags: OpenFlags) -> Result<(), KernelError> {
        let mut role = self.role.lock();
        if role.is_some() {
            return Ok(());
        }
        let new = if flags.contains(OpenFlags::CREATE | OpenFlags::EXCL) {
            self.bind()?
        } else {
            self.connect()?
        };
        *role = Some(new);
        Ok(())
    }

    fn close(&self, _node: &Node) {
        let Some(role) = self.role.lock().take() else {
            return;
        };
        let exchange = &self.exchange;
        match role {
            Role::Server => {
                self.bus.remove(exchange);
                let clients = {
                    let mut state = exchange.state.lock();
                    state.server_bound = false;
                    core::mem::take(&mut state.clients)
                };
                for buffer in clients.values() {
                    let _ = send_to_client(buffer, &[]);
                    buffer.interrupt();
                }
                exchange.server_buffer.interrupt();
                log::info!("pex {}: server closed", exchange.name);
            }
            Role::Client { id, .. } => {
                let mut state = exchange.state.lock();
                state.clients.remove(&id);
                let header = packet_header(id, &[]);
                match exchange
                    .server_buffer
                    .write_packet(header.as_bytes(), &[], true)
                {
                    Err(KernelError::WouldBlock) => {
                        log::debug!(
                            "pex {}: server buffer full, client {id} close deferred",
                            exchange.name
                        );
                        state.departed.push_back(id);
                    }
                    Err(e) => {
                        log::warn!("pex {}: client {id} close not delivered: {e}", exchange.name);
                    }
                    Ok(_) => {}
                }
                log::debug!("pex {}: client {id} closed", exchange.name);
            }
        }
    }

    fn ioctl(&self, _node: &Node, request: u64, _arg: &mut [u8]) -> Result<usize, KernelError> {
        match IoctlRequest::from_repr(request) {
            Some(IoctlRequest::PacketfsQueued) => self.with_read_buffer(RingBuffer::unread),
            _ => Err(KernelError::InvalidInput),
        }
    }

    fn selectcheck(&self, _node: &Node) -> Result<bool, KernelError> {
        if matches!(self.role()?, Role::Server)
            && !self.exchange.state.lock().departed.is_empty()
        {
            return Ok(true);
        }
        self.with_read_buffer(RingBuffer::readable)
    }

    fn selectwait(&self, _node: &Node, p: &Process) -> Result<(), KernelError> {
        self.with_read_buffer(|buffer| buffer.select_wait(p))
    }
}

/// The directory of exchanges.
pub struct PexBus {
    procs: Arc<ProcTable>,
    buffer_size: usize,
    next_inode: AtomicU64,
    exchanges: SpinLock<BTreeMap<String, Arc<Exchange>>>,
}

impl PexBus {
    pub fn new(procs: &Arc<ProcTable>, buffer_size: usize) -> Arc<Self> {
        Arc::new(Self {
            procs: Arc::clone(procs),
            buffer_size,
            next_inode: AtomicU64::new(1),
            exchanges: SpinLock::new(BTreeMap::new()),
        })
    }

    pub fn root(self: &Arc<Self>) -> NodeRef {
        Arc::new(
            Node::new(
                "pex",
                NodeFlags::DIRECTORY,
                BusOps {
                    bus: Arc::clone(self),
                },
            )
            .with_mask(0o777),
        )
    }

    /// Names of the existing exchanges.
    pub fn names(&self) -> Vec<String> {
        self.exchanges.lock().keys().cloned().collect()
    }

    fn contains(&self, exchange: &Arc<Exchange>) -> bool {
        self.exchanges
            .lock()
            .get(&exchange.name)
            .is_some_and(|e| Arc::ptr_eq(e, exchange))
    }

    fn remove(&self, exchange: &Arc<Exchange>) {
        let mut exchanges = self.exchanges.lock();
        if exchanges
            .get(&exchange.name)
            .is_some_and(|e| Arc::ptr_eq(e, exchange))
        {
            exchanges.remove(&exchange.name);
        }
    }
}

struct BusOps {
    bus: Arc<PexBus>,
}

impl FileOps for BusOps {
    fn capabilities(&self) -> Capabilities {
        Capabilities::READDIR | Capabilities::FINDDIR | Capabilities::CREATE | Capabilities::UNLINK
    }

    fn readdir(&self, _node: &Node, index: usize) -> Option<Dirent> {
        match index {
            0 => Some(Dirent::new(0, ".")),
            1 => Some(Dirent::new(0, "..")),
            _ => self
                .bus
                .exchanges
                .lock()
                .values()
                .nth(index - 2)
                .map(|e| Dirent::new(e.inode, e.name.as_str())),
        }
    }

    fn finddir(&self, _node: &Node, name: &str) -> Option<NodeRef> {
        let exchange = Arc::clone(self.bus.exchanges.lock().get(name)?);
        let node = Node::new(
            name,
            NodeFlags::CHAR_DEVICE,
            EndpointOps {
                bus: Arc::clone(&self.bus),
                exchange: Arc::clone(&exchange),
                role: SpinLock::new(None),
            },
        )
        .with_mask(0o666)
        .with_inode(exchange.inode);
        Some(Arc::new(node))
    }

    fn create(&self, _node: &Node, name: &str, _mask: u32) -> Result<(), KernelError> {
        if name.is_empty() || name.contains('/') {
            return Err(KernelError::InvalidInput);
        }
        let mut exchanges = self.bus.exchanges.lock();
        if exchanges.contains_key(name) {
            return Err(KernelError::AlreadyExists);
        }
        let exchange = Exchange {
            name: name.to_string(),
            inode: self.bus.next_inode.fetch_add(1, Ordering::Relaxed),
            server_buffer: RingBuffer::new(&self.bus.procs, self.bus.buffer_size),
            state: SpinLock::new(ExchangeState {
                server_bound: false,
                clients: BTreeMap::new(),
                next_client: 0,
                departed: VecDeque::new(),
            }),
        };
        exchanges.insert(name.to_string(), Arc::new(exchange));
        Ok(())
    }

    fn unlink(&self, _node: &Node, name: &str) -> Result<(), KernelError> {
        self.bus
            .exchanges
            .lock()
            .remove(name)
            .map(|_| ())
            .ok_or(KernelError::FsEntryNotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        proc::tests::with_process,
        vfs::{close_fs, create_fs, finddir_fs, ioctl_fs, open_fs, read_fs, readdir_fs, write_fs},
    };

    const BIND: OpenFlags = OpenFlags::READ_WRITE
        .union(OpenFlags::CREATE)
        .union(OpenFlags::EXCL);

    fn server_packet(target: u64, payload: &[u8]) -> Vec<u8> {
        let mut buf = PexHeader { target }.as_bytes().to_vec();
        buf.extend_from_slice(payload);
        buf
    }

    fn setup() -> (Arc<ProcTable>, NodeRef, NodeRef) {
        let procs = ProcTable::new(1);
        let root = PexBus::new(&procs, 256).root();
        create_fs(&root, "svc", 0o666).unwrap();
        let server = finddir_fs(&root, "svc").unwrap();
        open_fs(&server, BIND).unwrap();
        (procs, root, server)
    }

    fn connect(root: &NodeRef) -> NodeRef {
        let client = finddir_fs(root, "svc").unwrap();
        open_fs(&client, OpenFlags::READ_WRITE).unwrap();
        client
    }

    #[test]
    fn client_to_server_and_back() {
        let (procs, root, server) = setup();
        let client = connect(&root);
        with_process(&procs, |_| {
            assert_eq!(write_fs(&client, 0, b"ping"), Ok(4));
            assert_eq!(
                ioctl_fs(&server, IoctlRequest::PacketfsQueued.code(), &mut []),
                Ok(PacketHeader::SIZE + 4)
            );

            let mut buf = [0; 64];
            let n = read_fs(&server, 0, &mut buf).unwrap();
            assert_eq!(n, PacketHeader::SIZE + 4);
            let header = DataView::from(&buf[..]).try_read::<PacketHeader>(0).unwrap();
            assert_eq!(header.size, 4);
            assert_eq!(&buf[PacketHeader::SIZE..n], b"ping");

            let reply = server_packet(header.source, b"pong");
            assert_eq!(write_fs(&server, 0, &reply), Ok(reply.len()));
            assert_eq!(read_fs(&client, 0, &mut buf), Ok(4));
            assert_eq!(&buf[..4], b"pong");
        });
    }

    #[test]
    fn broadcast_reaches_every_client() {
        let (procs, root, server) = setup();
        let a = connect(&root);
        let b = connect(&root);
        with_process(&procs, |_| {
            write_fs(&server, 0, &server_packet(BROADCAST, b"all")).unwrap();
            let mut buf = [0; 8];
            assert_eq!(read_fs(&a, 0, &mut buf), Ok(3));
            assert_eq!(read_fs(&b, 0, &mut buf), Ok(3));
            assert_eq!(
                write_fs(&server, 0, &server_packet(99, b"x")),
                Err(KernelError::NoSuchClient)
            );
        });
    }

    #[test]
    fn second_bind_fails() {
        let (_procs, root, _server) = setup();
        let other = finddir_fs(&root, "svc").unwrap();
        assert_eq!(open_fs(&other, BIND), Err(KernelError::EndpointAlreadyBound));
        assert_eq!(create_fs(&root, "svc", 0o666), Err(KernelError::AlreadyExists));
    }

    #[test]
    fn oversized_packets_are_rejected() {
        let (procs, root, server) = setup();
        let client = connect(&root);
        let big = vec![0; MAX_PACKET_SIZE + 1];
        with_process(&procs, |_| {
            assert_eq!(write_fs(&client, 0, &big), Err(KernelError::MessageTooLong));
            assert_eq!(
                write_fs(&server, 0, &server_packet(BROADCAST, &big)),
                Err(KernelError::MessageTooLong)
            );
        });
    }

    #[test]
    fn closes_notify_the_other_side() {
        let (procs, root, server) = setup();
        let client = connect(&root);
        with_process(&procs, |_| {
            close_fs(&client);
            let mut buf = [0; 64];
            assert_eq!(read_fs(&server, 0, &mut buf), Ok(PacketHeader::SIZE));

            let client = connect(&root);
            close_fs(&server);
            assert_eq!(read_fs(&client, 0, &mut buf), Ok(0));
            assert!(finddir_fs(&root, "svc").is_none());
            assert!(readdir_fs(&root, 2).is_none());
        });
    }

    #[test]
    fn close_notice_survives_a_full_server_buffer() {
        let (procs, root, server) = setup();
        let chatty = connect(&root);
        let quiet = connect(&root);
        let payload = [7; 256 / 4 - PacketHeader::SIZE];
        with_process(&procs, |_| {
            for _ in 0..4 {
                assert_eq!(write_fs(&chatty, 0, &payload), Ok(payload.len()));
            }
            assert_eq!(
                ioctl_fs(&server, IoctlRequest::PacketfsQueued.code(), &mut []),
                Ok(256)
            );
            close_fs(&quiet);

            let mut buf = [0; 64];
            assert_eq!(read_fs(&server, 0, &mut buf), Ok(PacketHeader::SIZE));
            let header = DataView::from(&buf[..]).try_read::<PacketHeader>(0).unwrap();
            assert_eq!((header.source, header.size), (2, 0));
            for _ in 0..4 {
                assert_eq!(read_fs(&server, 0, &mut buf), Ok(64));
                let header = DataView::from(&buf[..]).try_read::<PacketHeader>(0).unwrap();
                assert_eq!(header.source, 1);
            }
        });
    }

    #[test]
    fn stale_endpoint_cannot_connect() {
        let (_procs, root, server) = setup();
        let stale = finddir_fs(&root, "svc").unwrap();
        close_fs(&server);
        assert_eq!(
            open_fs(&stale, OpenFlags::READ_WRITE),
            Err(KernelError::FsEntryNotFound)
        );
    }
}
