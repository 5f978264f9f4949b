//! Wire headers of the packet exchange.
//!
//! A server reads `PacketHeader` followed by `size` bytes of payload and
//! writes `PexHeader` followed by the payload. Clients read and write bare
//! payloads.

use dataview::Pod;
pub use misaka_kernel_params::MAX_PACKET_SIZE;

/// Client id used by servers to address every connected client.
pub const BROADCAST: u64 = 0;

/// Prefix of every packet stored in a pex buffer and of every packet a
/// server reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod)]
#[repr(C)]
pub struct PacketHeader {
    /// Id of the sending client, or 0 when the server sent it.
    pub source: u64,
    pub size: u64,
}

/// Prefix of every packet a server writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod)]
#[repr(C)]
pub struct PexHeader {
    /// Id of the receiving client, or [`BROADCAST`].
    pub target: u64,
}

impl PacketHeader {
    pub const SIZE: usize = size_of::<Self>();
}

impl PexHeader {
    pub const SIZE: usize = size_of::<Self>();
}
