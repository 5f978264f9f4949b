//! Packet exchange helpers.
//!
//! Servers `bind` a name and then `listen`, `send` and `broadcast`;
//! clients `connect` and then `reply` and `recv`. Exchanges live under
//! `/dev/pex`.

use dataview::{DataView, PodMethods as _};
use misaka_kernel_params::MAX_PACKET_SIZE;
use misaka_types::{
    error::SyscallError,
    fs::OpenFlags,
    ioctl::IoctlRequest,
    pex::{BROADCAST, PacketHeader, PexHeader},
};

use super::file::{ioctl, open, read, write};

const PEX_DIR: &str = "/dev/pex";

/// A packet received by a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Id of the sending client.
    pub source: u64,
    /// Payload; empty when the client disconnected.
    pub data: Vec<u8>,
}

fn exchange_path(name: &str) -> Result<String, SyscallError> {
    if name.is_empty() || name.contains('/') {
        return Err(SyscallError::InvalidInput);
    }
    Ok(format!("{PEX_DIR}/{name}"))
}

/// Creates exchange `name` and opens its server end.
///
/// Fails with `AlreadyExists` if the name is taken.
pub fn bind(name: &str) -> Result<usize, SyscallError> {
    let flags = OpenFlags::READ_WRITE | OpenFlags::CREATE | OpenFlags::EXCL;
    open(&exchange_path(name)?, flags, 0o666)
}

/// Opens a client end of exchange `name`.
pub fn connect(name: &str) -> Result<usize, SyscallError> {
    open(&exchange_path(name)?, OpenFlags::READ_WRITE, 0)
}

/// Sends `data` from the server `fd` to client `target`.
pub fn send(fd: usize, target: u64, data: &[u8]) -> Result<(), SyscallError> {
    if data.len() > MAX_PACKET_SIZE {
        return Err(SyscallError::MessageTooLong);
    }
    let mut packet = Vec::with_capacity(PexHeader::SIZE + data.len());
    packet.extend_from_slice(PexHeader { target }.as_bytes());
    packet.extend_from_slice(data);
    write(fd, &packet)?;
    Ok(())
}

/// Sends `data` from the server `fd` to every client.
pub fn broadcast(fd: usize, data: &[u8]) -> Result<(), SyscallError> {
    send(fd, BROADCAST, data)
}

/// Waits for the next packet on the server `fd`.
///
/// Returns `None` once the exchange is shut down.
pub fn listen(fd: usize) -> Result<Option<Packet>, SyscallError> {
    let mut buf = vec![0; PacketHeader::SIZE + MAX_PACKET_SIZE];
    let n = read(fd, &mut buf)?;
    if n < PacketHeader::SIZE {
        return Ok(None);
    }
    let header = DataView::from(&buf[..])
        .try_read::<PacketHeader>(0)
        .ok_or(SyscallError::Io)?;
    Ok(Some(Packet {
        source: header.source,
        data: buf[PacketHeader::SIZE..n].to_vec(),
    }))
}

/// Sends `data` from the client `fd` to the server.
pub fn reply(fd: usize, data: &[u8]) -> Result<(), SyscallError> {
    if data.len() > MAX_PACKET_SIZE {
        return Err(SyscallError::MessageTooLong);
    }
    write(fd, data)?;
    Ok(())
}

/// Waits for the next packet on the client `fd`.
///
/// Returns 0 once the server is gone.
pub fn recv(fd: usize, buf: &mut [u8]) -> Result<usize, SyscallError> {
    read(fd, buf)
}

/// Returns the number of bytes queued for `fd`.
pub fn query(fd: usize) -> Result<usize, SyscallError> {
    ioctl(fd, IoctlRequest::PacketfsQueued.code(), &mut [])
}
