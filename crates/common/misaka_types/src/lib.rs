//! Types shared between the Misaka kernel core and its callers.
//!
//! Everything in this crate is part of the kernel ABI: open flags, node
//! types, terminal settings, signals, ioctl request codes and the pex wire
//! headers.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod error;
pub mod fs;
pub mod ioctl;
pub mod pex;
pub mod process;
pub mod signal;
pub mod termios;
