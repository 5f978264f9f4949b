use alloc::string::String;

use bitflags::bitflags;

bitflags! {
    /// Type flags of a VFS node.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[repr(transparent)]
    pub struct NodeFlags: u32 {
        const FILE = 0x01;
        const DIRECTORY = 0x02;
        const CHAR_DEVICE = 0x04;
        const BLOCK_DEVICE = 0x08;
        const PIPE = 0x10;
        const SYMLINK = 0x20;
        const MOUNTPOINT = 0x40;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[repr(transparent)]
    pub struct OpenFlags: u32 {
        const READ_ONLY = 0x0000;
        const WRITE_ONLY = 0x0001;
        const READ_WRITE = 0x0002;
        const APPEND = 0x0008;
        const CREATE = 0x0200;
        const TRUNC = 0x0400;
        const EXCL = 0x0800;
        const NOFOLLOW = 0x1000;
        const PATH = 0x2000;
        const NONBLOCK = 0x4000;
        const DIRECTORY = 0x8000;
    }
}

impl OpenFlags {
    const ACCESS_MASK: u32 = 0x3;

    #[must_use]
    pub fn readable(self) -> bool {
        self.bits() & Self::ACCESS_MASK != Self::WRITE_ONLY.bits()
    }

    #[must_use]
    pub fn writable(self) -> bool {
        let access = self.bits() & Self::ACCESS_MASK;
        access == Self::WRITE_ONLY.bits() || access == Self::READ_WRITE.bits()
    }
}

/// Permission bits checked by `has_permission`.
pub mod perm {
    pub const EXEC: u32 = 0o1;
    pub const WRITE: u32 = 0o2;
    pub const READ: u32 = 0o4;
}

/// A directory entry returned by `readdir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dirent {
    pub ino: u64,
    pub name: String,
}

impl Dirent {
    pub fn new(ino: u64, name: impl Into<String>) -> Self {
        Self {
            ino,
            name: name.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_modes() {
        assert!(OpenFlags::READ_ONLY.readable());
        assert!(!OpenFlags::READ_ONLY.writable());
        assert!(!OpenFlags::WRITE_ONLY.readable());
        assert!(OpenFlags::WRITE_ONLY.writable());
        let rw = OpenFlags::READ_WRITE | OpenFlags::CREATE;
        assert!(rw.readable() && rw.writable());
    }
}
