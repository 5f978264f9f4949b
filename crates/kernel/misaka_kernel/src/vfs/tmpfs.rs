//! In-memory file system.

use core::sync::atomic::{AtomicU64, Ordering};
use std::{
    collections::BTreeMap,
    string::{String, ToString as _},
    sync::Arc,
};

use derive_more::From;
use misaka_types::fs::{Dirent, NodeFlags};

use super::{Capabilities, FileOps, Node, NodeRef};
use crate::{
    error::KernelError,
    pipe::{self, Pipe},
    proc::{ProcTable, Process},
    sync::SpinLock,
};

#[derive(Default)]
struct Dir {
    entries: SpinLock<BTreeMap<String, Entry>>,
}

#[derive(Default)]
struct Content {
    data: SpinLock<Vec<u8>>,
}

#[derive(Clone, From)]
enum Kind {
    Dir(Arc<Dir>),
    File(Arc<Content>),
    Fifo(Arc<Pipe>),
}

#[derive(Clone)]
struct Entry {
    inode: u64,
    mask: u32,
    uid: u32,
    gid: u32,
    kind: Kind,
}

pub struct Tmpfs {
    procs: Arc<ProcTable>,
    pipe_size: usize,
    next_inode: AtomicU64,
    root: Arc<Dir>,
}

impl Tmpfs {
    pub fn new(procs: &Arc<ProcTable>, pipe_size: usize) -> Arc<Self> {
        Arc::new(Self {
            procs: Arc::clone(procs),
            pipe_size,
            next_inode: AtomicU64::new(1),
            root: Arc::new(Dir::default()),
        })
    }

    /// Returns a node for the root directory.
    pub fn root(self: &Arc<Self>) -> NodeRef {
        Arc::new(
            Node::new(
                "/",
                NodeFlags::DIRECTORY,
                DirOps {
                    fs: Arc::clone(self),
                    dir: Arc::clone(&self.root),
                },
            )
            .with_mask(0o777),
        )
    }

    fn node(self: &Arc<Self>, name: &str, entry: &Entry) -> Node {
        let node = match &entry.kind {
            Kind::Dir(dir) => Node::new(
                name,
                NodeFlags::DIRECTORY,
                DirOps {
                    fs: Arc::clone(self),
                    dir: Arc::clone(dir),
                },
            ),
            Kind::File(content) => {
                let len = content.data.lock().len();
                Node::new(
                    name,
                    NodeFlags::FILE,
                    FileContentOps {
                        content: Arc::clone(content),
                    },
                )
                .with_length(len as u64)
            }
            Kind::Fifo(pipe) => pipe::fifo_node(name, pipe),
        };
        node.with_mask(entry.mask)
            .with_owner(entry.uid, entry.gid)
            .with_inode(entry.inode)
    }

    fn new_entry(&self, mask: u32, kind: Kind) -> Entry {
        let (uid, gid) = Process::try_current().map_or((0, 0), |p| (p.uid(), p.gid()));
        Entry {
            inode: self.next_inode.fetch_add(1, Ordering::Relaxed),
            mask,
            uid,
            gid,
            kind,
        }
    }
}

struct DirOps {
    fs: Arc<Tmpfs>,
    dir: Arc<Dir>,
}

impl DirOps {
    fn insert(&self, name: &str, mask: u32, kind: Kind) -> Result<(), KernelError> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(KernelError::InvalidInput);
        }
        let mut entries = self.dir.entries.lock();
        if entries.contains_key(name) {
            return Err(KernelError::AlreadyExists);
        }
        entries.insert(name.to_string(), self.fs.new_entry(mask, kind));
        Ok(())
    }
}

impl FileOps for DirOps {
    fn capabilities(&self) -> Capabilities {
        Capabilities::READDIR
            | Capabilities::FINDDIR
            | Capabilities::CREATE
            | Capabilities::MKDIR
            | Capabilities::MKFIFO
            | Capabilities::UNLINK
    }

    fn readdir(&self, _node: &Node, index: usize) -> Option<Dirent> {
        match index {
            0 => Some(Dirent::new(0, ".")),
            1 => Some(Dirent::new(0, "..")),
            _ => self
                .dir
                .entries
                .lock()
                .iter()
                .nth(index - 2)
                .map(|(name, entry)| Dirent::new(entry.inode, name.as_str())),
        }
    }

    fn finddir(&self, _node: &Node, name: &str) -> Option<NodeRef> {
        let entry = self.dir.entries.lock().get(name).cloned()?;
        Some(Arc::new(self.fs.node(name, &entry)))
    }

    fn create(&self, _node: &Node, name: &str, mask: u32) -> Result<(), KernelError> {
        self.insert(name, mask, Arc::new(Content::default()).into())
    }

    fn mkdir(&self, _node: &Node, name: &str, mask: u32) -> Result<(), KernelError> {
        self.insert(name, mask, Arc::new(Dir::default()).into())
    }

    fn mkfifo(&self, _node: &Node, name: &str, mask: u32) -> Result<(), KernelError> {
        let pipe = Pipe::new(&self.fs.procs, self.fs.pipe_size);
        self.insert(name, mask, pipe.into())
    }

    fn unlink(&self, _node: &Node, name: &str) -> Result<(), KernelError> {
        let mut entries = self.dir.entries.lock();
        let entry = entries.get(name).ok_or(KernelError::FsEntryNotFound)?;
        if let Kind::Dir(dir) = &entry.kind {
            if !dir.entries.lock().is_empty() {
                return Err(KernelError::DirectoryNotEmpty);
            }
        }
        entries.remove(name);
        Ok(())
    }
}

struct FileContentOps {
    content: Arc<Content>,
}

fn to_index(offset: u64) -> Result<usize, KernelError> {
    usize::try_from(offset).map_err(|_| KernelError::InvalidInput)
}

impl FileOps for FileContentOps {
    fn capabilities(&self) -> Capabilities {
        Capabilities::READ | Capabilities::WRITE | Capabilities::TRUNCATE
    }

    fn read(&self, _node: &Node, offset: u64, buf: &mut [u8]) -> Result<usize, KernelError> {
        let offset = to_index(offset)?;
        let data = self.content.data.lock();
        let Some(src) = data.get(offset..) else {
            return Ok(0);
        };
        let n = src.len().min(buf.len());
        buf[..n].copy_from_slice(&src[..n]);
        Ok(n)
    }

    fn write(&self, node: &Node, offset: u64, buf: &[u8]) -> Result<usize, KernelError> {
        let offset = to_index(offset)?;
        let mut data = self.content.data.lock();
        let end = offset + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        node.set_length(data.len() as u64);
        Ok(buf.len())
    }

    fn truncate(&self, node: &Node) -> Result<(), KernelError> {
        self.content.data.lock().clear();
        node.set_length(0);
        Ok(())
    }
}
