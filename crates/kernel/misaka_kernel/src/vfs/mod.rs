//! Virtual file system.
//!
//! Every openable kernel object is a [`Node`]. A node carries its metadata
//! and a [`FileOps`] object implementing the operations it supports; the
//! `*_fs` functions dispatch to those operations, first following mount
//! redirects and falling back to fixed results for missing capabilities.

use core::{
    fmt,
    sync::atomic::{AtomicI64, AtomicU64, Ordering},
};
use std::{string::String, sync::Arc};

use bitflags::bitflags;
use misaka_kernel_params::MAX_MOUNT_DEPTH;
use misaka_types::fs::{Dirent, NodeFlags, OpenFlags, perm};

pub(crate) use self::path::split_parent;
pub use self::{
    mount::{MountCallback, Vfs},
    path::canonicalize_path,
};
use crate::{error::KernelError, proc::Process, sync::SpinLock};

mod mount;
mod path;
pub mod tmpfs;

pub type NodeRef = Arc<Node>;

bitflags! {
    /// Operations a node implements.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const OPEN = 1 << 2;
        const CLOSE = 1 << 3;
        const READDIR = 1 << 4;
        const FINDDIR = 1 << 5;
        const IOCTL = 1 << 6;
        const CREATE = 1 << 7;
        const MKDIR = 1 << 8;
        const MKFIFO = 1 << 9;
        const UNLINK = 1 << 10;
        const TRUNCATE = 1 << 11;
        const SELECT = 1 << 12;
    }
}

/// Implementation behind a node.
///
/// Only the methods named by `capabilities()` are ever called; the provided
/// bodies return the same results the dispatch functions use for missing
/// capabilities.
#[expect(unused_variables)]
pub trait FileOps: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    fn read(&self, node: &Node, offset: u64, buf: &mut [u8]) -> Result<usize, KernelError> {
        Ok(0)
    }

    fn write(&self, node: &Node, offset: u64, buf: &[u8]) -> Result<usize, KernelError> {
        Ok(0)
    }

    fn open(&self, node: &Node, flags: OpenFlags) -> Result<(), KernelError> {
        Ok(())
    }

    fn close(&self, node: &Node) {}

    fn readdir(&self, node: &Node, index: usize) -> Option<Dirent> {
        None
    }

    fn finddir(&self, node: &Node, name: &str) -> Option<NodeRef> {
        None
    }

    /// Handles device-specific `request`.
    ///
    /// `arg` is the caller's argument buffer, read and written in place.
    /// Returns a request-specific value.
    fn ioctl(&self, node: &Node, request: u64, arg: &mut [u8]) -> Result<usize, KernelError> {
        Err(KernelError::InvalidInput)
    }

    fn create(&self, node: &Node, name: &str, mask: u32) -> Result<(), KernelError> {
        Err(KernelError::NotADirectory)
    }

    fn mkdir(&self, node: &Node, name: &str, mask: u32) -> Result<(), KernelError> {
        Err(KernelError::NotADirectory)
    }

    fn mkfifo(&self, node: &Node, name: &str, mask: u32) -> Result<(), KernelError> {
        Err(KernelError::NotADirectory)
    }

    fn unlink(&self, node: &Node, name: &str) -> Result<(), KernelError> {
        Err(KernelError::NotADirectory)
    }

    fn truncate(&self, node: &Node) -> Result<(), KernelError> {
        Ok(())
    }

    /// Returns `true` if a read would not block.
    fn selectcheck(&self, node: &Node) -> Result<bool, KernelError> {
        Err(KernelError::InvalidInput)
    }

    /// Arranges for `p` to be woken when the node becomes readable.
    fn selectwait(&self, node: &Node, p: &Process) -> Result<(), KernelError> {
        Err(KernelError::InvalidInput)
    }
}

/// A node with no operations of its own; mount points redirect through
/// `ptr`.
struct NoOps;

impl FileOps for NoOps {
    fn capabilities(&self) -> Capabilities {
        Capabilities::empty()
    }
}

/// A file system object.
pub struct Node {
    name: String,
    mask: u32,
    uid: u32,
    gid: u32,
    flags: NodeFlags,
    inode: u64,
    length: AtomicU64,
    /// Number of opens; -1 if the node is pinned and never closed.
    refcount: AtomicI64,
    /// Mount redirect.
    ptr: SpinLock<Option<NodeRef>>,
    ops: Box<dyn FileOps>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("flags", &self.flags)
            .field("inode", &self.inode)
            .field("refcount", &self.refcount.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Node {
    pub fn new<O>(name: impl Into<String>, flags: NodeFlags, ops: O) -> Self
    where
        O: FileOps + 'static,
    {
        Self {
            name: name.into(),
            mask: 0o666,
            uid: 0,
            gid: 0,
            flags,
            inode: 0,
            length: AtomicU64::new(0),
            refcount: AtomicI64::new(0),
            ptr: SpinLock::new(None),
            ops: Box::new(ops),
        }
    }

    /// A node that redirects every operation to `target`.
    pub fn mount_point(name: impl Into<String>, target: NodeRef) -> Self {
        let node = Self::new(name, target.flags | NodeFlags::MOUNTPOINT, NoOps)
            .with_mask(target.mask)
            .with_owner(target.uid, target.gid);
        *node.ptr.lock() = Some(target);
        node
    }

    #[must_use]
    pub fn with_mask(mut self, mask: u32) -> Self {
        self.mask = mask;
        self
    }

    #[must_use]
    pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    #[must_use]
    pub fn with_inode(mut self, inode: u64) -> Self {
        self.inode = inode;
        self
    }

    #[must_use]
    pub fn with_length(self, length: u64) -> Self {
        self.length.store(length, Ordering::Relaxed);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mask(&self) -> u32 {
        self.mask
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn gid(&self) -> u32 {
        self.gid
    }

    pub fn flags(&self) -> NodeFlags {
        self.flags
    }

    pub fn inode(&self) -> u64 {
        self.inode
    }

    pub fn is_dir(&self) -> bool {
        self.flags.contains(NodeFlags::DIRECTORY)
    }

    pub fn length(&self) -> u64 {
        self.length.load(Ordering::Relaxed)
    }

    pub fn set_length(&self, length: u64) {
        self.length.store(length, Ordering::Relaxed);
    }

    pub fn refcount(&self) -> i64 {
        self.refcount.load(Ordering::Relaxed)
    }

    pub fn ops(&self) -> &dyn FileOps {
        &*self.ops
    }

    fn has(&self, cap: Capabilities) -> bool {
        self.ops.capabilities().contains(cap)
    }
}

/// Follows mount redirects from `node` to the node implementing it.
pub fn resolve(node: &NodeRef) -> NodeRef {
    let mut node = Arc::clone(node);
    for _ in 0..MAX_MOUNT_DEPTH {
        let next = node.ptr.lock().clone();
        match next {
            Some(next) => node = next,
            None => break,
        }
    }
    node
}

pub fn read_fs(node: &NodeRef, offset: u64, buf: &mut [u8]) -> Result<usize, KernelError> {
    let node = resolve(node);
    if !node.has(Capabilities::READ) {
        return Ok(0);
    }
    node.ops.read(&node, offset, buf)
}

pub fn write_fs(node: &NodeRef, offset: u64, buf: &[u8]) -> Result<usize, KernelError> {
    let node = resolve(node);
    if !node.has(Capabilities::WRITE) {
        return Ok(0);
    }
    node.ops.write(&node, offset, buf)
}

/// Records an open of `node` and runs its open operation.
pub fn open_fs(node: &NodeRef, flags: OpenFlags) -> Result<(), KernelError> {
    let node = resolve(node);
    if node.has(Capabilities::OPEN) {
        node.ops.open(&node, flags)?;
    }
    // pinned nodes stay at -1
    let _ = node
        .refcount
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            (n >= 0).then_some(n + 1)
        });
    Ok(())
}

/// Drops an open of `node`, running its close operation on the last one.
pub fn close_fs(node: &NodeRef) {
    let node = resolve(node);
    let res = node
        .refcount
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            (n > 0).then_some(n - 1)
        });
    match res {
        Ok(1) => {
            log::trace!("last close of {}", node.name);
            if node.has(Capabilities::CLOSE) {
                node.ops.close(&node);
            }
        }
        Ok(_) => {}
        Err(-1) => {}
        Err(n) => log::warn!("close of {} with refcount {n}", node.name),
    }
}

/// Pins `node` so that it is never closed.
pub fn lock_node(node: &Node) {
    node.refcount.store(-1, Ordering::Release);
}

pub fn readdir_fs(node: &NodeRef, index: usize) -> Option<Dirent> {
    let node = resolve(node);
    if !node.is_dir() || !node.has(Capabilities::READDIR) {
        return None;
    }
    node.ops.readdir(&node, index)
}

pub fn finddir_fs(node: &NodeRef, name: &str) -> Option<NodeRef> {
    let node = resolve(node);
    if !node.is_dir() || !node.has(Capabilities::FINDDIR) {
        return None;
    }
    node.ops.finddir(&node, name)
}

pub fn ioctl_fs(node: &NodeRef, request: u64, arg: &mut [u8]) -> Result<usize, KernelError> {
    let node = resolve(node);
    if !node.has(Capabilities::IOCTL) {
        return Err(KernelError::InvalidInput);
    }
    node.ops.ioctl(&node, request, arg)
}

fn dir_op<F>(node: &NodeRef, cap: Capabilities, f: F) -> Result<(), KernelError>
where
    F: FnOnce(&Node) -> Result<(), KernelError>,
{
    let node = resolve(node);
    if !node.is_dir() {
        return Err(KernelError::NotADirectory);
    }
    if !node.has(cap) {
        return Err(KernelError::PermissionDenied);
    }
    if !has_permission(&node, perm::WRITE) {
        return Err(KernelError::PermissionDenied);
    }
    f(&node)
}

pub fn create_fs(parent: &NodeRef, name: &str, mask: u32) -> Result<(), KernelError> {
    dir_op(parent, Capabilities::CREATE, |node| {
        node.ops.create(node, name, mask)
    })
}

pub fn mkdir_fs(parent: &NodeRef, name: &str, mask: u32) -> Result<(), KernelError> {
    dir_op(parent, Capabilities::MKDIR, |node| {
        node.ops.mkdir(node, name, mask)
    })
}

pub fn mkfifo_fs(parent: &NodeRef, name: &str, mask: u32) -> Result<(), KernelError> {
    dir_op(parent, Capabilities::MKFIFO, |node| {
        node.ops.mkfifo(node, name, mask)
    })
}

pub fn unlink_fs(parent: &NodeRef, name: &str) -> Result<(), KernelError> {
    dir_op(parent, Capabilities::UNLINK, |node| node.ops.unlink(node, name))
}

pub fn truncate_fs(node: &NodeRef) -> Result<(), KernelError> {
    let node = resolve(node);
    if !node.has(Capabilities::TRUNCATE) {
        return Ok(());
    }
    node.ops.truncate(&node)
}

pub fn selectcheck_fs(node: &NodeRef) -> Result<bool, KernelError> {
    let node = resolve(node);
    if !node.has(Capabilities::SELECT) {
        return Err(KernelError::InvalidInput);
    }
    node.ops.selectcheck(&node)
}

pub fn selectwait_fs(node: &NodeRef, p: &Process) -> Result<(), KernelError> {
    let node = resolve(node);
    if !node.has(Capabilities::SELECT) {
        return Err(KernelError::InvalidInput);
    }
    node.ops.selectwait(&node, p)
}

/// Checks `bit` (one of [`perm`]) against the credentials of the current
/// process.
///
/// Root passes every check except execute. Outside process context every
/// check passes.
pub fn has_permission(node: &Node, bit: u32) -> bool {
    let Some(p) = Process::try_current() else {
        return true;
    };
    if p.uid() == 0 && bit != perm::EXEC {
        return true;
    }

    let mut allowed = node.mask & 0o7;
    if p.uid() == node.uid {
        allowed |= (node.mask >> 6) & 0o7;
    }
    if p.gid() == node.gid {
        allowed |= (node.mask >> 3) & 0o7;
    }
    allowed & bit != 0
}
