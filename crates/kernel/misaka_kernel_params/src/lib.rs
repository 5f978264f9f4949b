#![no_std]

/// Maximum number of processes.
pub const NPROC: usize = 64;

/// Open files per process.
pub const NOFILE: usize = 32;

/// Maximum file path name.
pub const MAX_PATH: usize = 256;

/// Maximum length of a process name.
pub const MAX_PROC_NAME: usize = 16;

/// Capacity of an anonymous pipe or FIFO in bytes.
pub const PIPE_SIZE: usize = 4096;

/// Capacity of each direction of a pseudo-terminal in bytes.
pub const PTY_BUFFER_SIZE: usize = 4096;

/// Longest line the PTY line discipline accumulates in canonical mode.
pub const MAX_CANON: usize = 4096;

/// Capacity of a pex server or client buffer in bytes.
pub const PEX_BUFFER_SIZE: usize = 4096;

/// Largest payload of a single pex packet.
pub const MAX_PACKET_SIZE: usize = 1024;

/// Limit on chained mount redirections followed by the VFS.
pub const MAX_MOUNT_DEPTH: usize = 8;

/// Spin iterations before a contended spinlock starts yielding the CPU.
pub const SPIN_BACKOFF_LIMIT: u32 = 1 << 10;
