//! The Misaka kernel core.
//!
//! Logical processes run on host threads; everything above the
//! park/unpark seam (locks, wait queues, the VFS, ring buffers, pipes,
//! pseudo-terminals, the packet exchange and signal delivery) lives here.
//!
//! A [`Kernel`] owns one instance of every subsystem. Code runs "as a
//! process" after [`Kernel::spawn`] or [`Kernel::attach`], and talks to the
//! kernel through the functions in [`syscall`].

pub mod config;
pub mod cpu;
pub mod error;
pub mod file;
mod kernel;
pub mod logger;
pub mod pex;
pub mod pipe;
pub mod proc;
pub mod pty;
pub mod ring_buffer;
pub mod signal;
pub mod sync;
pub mod syscall;
pub mod vfs;

pub use self::kernel::{Kernel, ProcGuard, ProcJoin};
