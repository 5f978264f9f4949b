//! Open file descriptions.

use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use misaka_types::fs::{Dirent, OpenFlags};

use crate::{
    error::KernelError,
    vfs::{self, NodeRef},
};

struct FileData {
    node: NodeRef,
    flags: OpenFlags,
    offset: AtomicU64,
}

impl Drop for FileData {
    fn drop(&mut self) {
        vfs::close_fs(&self.node);
    }
}

/// An open node with its access mode and file offset.
///
/// Clones share the offset, as descriptors duplicated with `dup` do. The
/// node is closed when the last clone is dropped.
#[derive(Clone)]
pub struct File {
    data: Arc<FileData>,
}

impl File {
    /// Wraps a node that has already been opened with `open_fs()`.
    pub fn new(node: NodeRef, flags: OpenFlags) -> Self {
        Self {
            data: Arc::new(FileData {
                node,
                flags,
                offset: AtomicU64::new(0),
            }),
        }
    }

    /// Opens `node` and wraps it.
    pub fn open(node: NodeRef, flags: OpenFlags) -> Result<Self, KernelError> {
        vfs::open_fs(&node, flags)?;
        Ok(Self::new(node, flags))
    }

    pub fn node(&self) -> &NodeRef {
        &self.data.node
    }

    pub fn flags(&self) -> OpenFlags {
        self.data.flags
    }

    pub fn offset(&self) -> u64 {
        self.data.offset.load(Ordering::Relaxed)
    }

    /// Read from file.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, KernelError> {
        if !self.data.flags.readable() {
            return Err(KernelError::BadFileDescriptor);
        }
        if vfs::resolve(&self.data.node).is_dir() {
            return Err(KernelError::IsADirectory);
        }
        let n = vfs::read_fs(&self.data.node, self.offset(), buf)?;
        self.data.offset.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    /// Write to file.
    pub fn write(&self, buf: &[u8]) -> Result<usize, KernelError> {
        if !self.data.flags.writable() {
            return Err(KernelError::BadFileDescriptor);
        }
        if self.data.flags.contains(OpenFlags::APPEND) {
            let end = vfs::resolve(&self.data.node).length();
            self.data.offset.store(end, Ordering::Relaxed);
        }
        let n = vfs::write_fs(&self.data.node, self.offset(), buf)?;
        self.data.offset.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    pub fn readdir(&self, index: usize) -> Result<Option<Dirent>, KernelError> {
        if !vfs::resolve(&self.data.node).is_dir() {
            return Err(KernelError::NotADirectory);
        }
        Ok(vfs::readdir_fs(&self.data.node, index))
    }

    pub fn ioctl(&self, request: u64, arg: &mut [u8]) -> Result<usize, KernelError> {
        vfs::ioctl_fs(&self.data.node, request, arg)
    }
}
