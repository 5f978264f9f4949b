//! `ioctl` request codes understood by the kernel core.

use strum::FromRepr;

/// `DeviceType` result for plain files.
pub const DTYPE_FILE: usize = 1;
/// `DeviceType` result for terminals.
pub const DTYPE_TTY: usize = 2;

/// `TcFlsh` argument values.
pub const TCIFLUSH: u32 = 0;
pub const TCOFLUSH: u32 = 1;
pub const TCIOFLUSH: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u64)]
pub enum IoctlRequest {
    /// Returns one of the `DTYPE_*` values.
    DeviceType = 0x4F00,
    /// Writes the terminal name into the argument buffer.
    TtyName = 0x4F01,
    TcGets = 0x4000,
    TcSets = 0x4001,
    /// Like `TcSets`, after pending output drains.
    TcSetsW = 0x4002,
    /// Like `TcSets`, discarding pending input.
    TcSetsF = 0x4003,
    /// Discards queued data; the argument selects input, output or both.
    TcFlsh = 0x540B,
    TiocSctty = 0x540E,
    TiocGpgrp = 0x540F,
    TiocSpgrp = 0x5410,
    TiocGwinsz = 0x5413,
    TiocSwinsz = 0x5414,
    /// Number of bytes waiting to be read from a pex endpoint.
    PacketfsQueued = 0x5050,
}

impl IoctlRequest {
    #[must_use]
    pub const fn code(self) -> u64 {
        self as u64
    }
}
