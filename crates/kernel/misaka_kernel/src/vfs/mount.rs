use std::{
    collections::BTreeMap,
    string::{String, ToString as _},
    sync::Arc,
};

use misaka_types::fs::{Dirent, NodeFlags, OpenFlags, perm};

use super::{
    Capabilities, FileOps, Node, NodeRef, finddir_fs, has_permission, lock_node, open_fs,
    path::{self, canonicalize_path},
    resolve,
};
use crate::{error::KernelError, proc::Process, sync::SpinLock};

/// Builds the root node of a file system from `(source, target)`.
pub type MountCallback = Arc<dyn Fn(&str, &str) -> Result<NodeRef, KernelError> + Send + Sync>;

#[derive(Default)]
struct MountEntry {
    name: String,
    node: Option<NodeRef>,
    children: Vec<MountEntry>,
}

impl MountEntry {
    fn child(&self, name: &str) -> Option<&Self> {
        self.children.iter().find(|e| e.name == name)
    }

    fn child_or_insert(&mut self, name: &str) -> &mut Self {
        let pos = match self.children.iter().position(|e| e.name == name) {
            Some(pos) => pos,
            None => {
                self.children.push(Self {
                    name: name.to_string(),
                    ..Self::default()
                });
                self.children.len() - 1
            }
        };
        &mut self.children[pos]
    }

    fn walk<'a, I>(&self, components: I) -> Option<&Self>
    where
        I: IntoIterator<Item = &'a str>,
    {
        components
            .into_iter()
            .try_fold(self, |entry, name| entry.child(name))
    }

    fn dump(&self, depth: usize) {
        let kind = if self.node.is_some() { "mounted" } else { "" };
        log::info!("{:indent$}/{} {kind}", "", self.name, indent = depth * 2);
        for child in &self.children {
            child.dump(depth + 1);
        }
    }
}

type Tree = Arc<SpinLock<MountEntry>>;

/// Directory listing the mount tree entries below `path`.
struct MapperOps {
    tree: Tree,
    path: Vec<String>,
}

impl FileOps for MapperOps {
    fn capabilities(&self) -> Capabilities {
        Capabilities::READDIR | Capabilities::FINDDIR
    }

    fn readdir(&self, _node: &Node, index: usize) -> Option<Dirent> {
        match index {
            0 => return Some(Dirent::new(0, ".")),
            1 => return Some(Dirent::new(1, "..")),
            _ => {}
        }
        let tree = self.tree.lock();
        let entry = tree.walk(self.path.iter().map(String::as_str))?;
        let child = entry.children.get(index - 2)?;
        Some(Dirent::new(index as u64 - 2, child.name.as_str()))
    }

    fn finddir(&self, _node: &Node, name: &str) -> Option<NodeRef> {
        let tree = self.tree.lock();
        let entry = tree.walk(self.path.iter().map(String::as_str))?;
        let child = entry.child(name)?;
        if let Some(node) = &child.node {
            return Some(Arc::clone(node));
        }
        let mut path = self.path.clone();
        path.push(name.to_string());
        Some(Arc::new(mapper(Arc::clone(&self.tree), name, path)))
    }
}

fn mapper(tree: Tree, name: &str, path: Vec<String>) -> Node {
    Node::new(name, NodeFlags::DIRECTORY, MapperOps { tree, path }).with_mask(0o555)
}

/// The mount table and the registry of file system types.
pub struct Vfs {
    tree: Tree,
    filesystems: SpinLock<BTreeMap<String, MountCallback>>,
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs {
    pub fn new() -> Self {
        Self {
            tree: Arc::new(SpinLock::new(MountEntry::default())),
            filesystems: SpinLock::new(BTreeMap::new()),
        }
    }

    /// Registers file system type `name`, mountable with `mount_type()`.
    pub fn register_fs(&self, name: &str, callback: MountCallback) -> Result<(), KernelError> {
        let mut filesystems = self.filesystems.lock();
        if filesystems.contains_key(name) {
            return Err(KernelError::AlreadyExists);
        }
        filesystems.insert(name.to_string(), callback);
        Ok(())
    }

    /// Mounts a new instance of file system `fstype` built from `source`
    /// at `target`.
    pub fn mount_type(&self, fstype: &str, source: &str, target: &str) -> Result<(), KernelError> {
        let callback = self
            .filesystems
            .lock()
            .get(fstype)
            .cloned()
            .ok_or(KernelError::UnknownFsType)?;
        let root = callback(source, target)?;
        self.mount(target, root)
    }

    /// Makes `root` reachable at `path`, replacing anything mounted there.
    pub fn mount(&self, path: &str, root: NodeRef) -> Result<(), KernelError> {
        let path = canonicalize_path("/", path)?;
        lock_node(&root);

        let name = path::split_parent(&path).map_or("/", |(_, name)| name);
        let mount_point = Arc::new(Node::mount_point(name, root));
        lock_node(&mount_point);

        let mut tree = self.tree.lock();
        let entry = path::components(&path).fold(&mut *tree, |entry, name| {
            entry.child_or_insert(name)
        });
        if entry.node.replace(mount_point).is_some() {
            log::warn!("{path}: replacing existing mount");
        }
        log::info!("mounted {path}");
        Ok(())
    }

    /// Mounts a directory at `path` that lists the mounts below it.
    pub fn map_directory(&self, path: &str) -> Result<(), KernelError> {
        let path = canonicalize_path("/", path)?;
        let components = path::components(&path)
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        let name = components.last().map_or("/", String::as_str);
        let node = mapper(Arc::clone(&self.tree), name, components.clone());
        self.mount(&path, Arc::new(node))
    }

    /// Returns the node mounted at `/`.
    pub fn root(&self) -> Option<NodeRef> {
        self.tree.lock().node.clone()
    }

    /// Finds the node at canonical path `path` without opening it.
    ///
    /// The deepest mount covering the path is located in the mount table
    /// and the remaining components are looked up with `finddir`.
    pub fn lookup(&self, path: &str) -> Result<NodeRef, KernelError> {
        let components = path::components(path).collect::<Vec<_>>();

        let (mut node, depth) = {
            let tree = self.tree.lock();
            let mut entry = &*tree;
            let mut last = tree.node.clone().map(|node| (node, 0));
            for (i, name) in components.iter().enumerate() {
                let Some(child) = entry.child(name) else {
                    break;
                };
                entry = child;
                if let Some(node) = &child.node {
                    last = Some((Arc::clone(node), i + 1));
                }
            }
            last.ok_or(KernelError::FsEntryNotFound)?
        };

        for name in &components[depth..] {
            if !resolve(&node).is_dir() {
                return Err(KernelError::NotADirectory);
            }
            node = finddir_fs(&node, name).ok_or(KernelError::FsEntryNotFound)?;
        }
        Ok(node)
    }

    /// Opens `path`, relative to the current working directory.
    ///
    /// The returned node has been opened with `open_fs()`; the caller owns
    /// that open.
    pub fn kopen(&self, path: &str, flags: OpenFlags) -> Result<NodeRef, KernelError> {
        let cwd = Process::try_current().map_or_else(|| "/".to_string(), |p| p.cwd());
        let path = canonicalize_path(&cwd, path)?;
        let node = self.lookup(&path)?;

        let target = resolve(&node);
        if target.is_dir() {
            if flags.writable() {
                return Err(KernelError::IsADirectory);
            }
        } else if flags.contains(OpenFlags::DIRECTORY) {
            return Err(KernelError::NotADirectory);
        }
        let readable = !flags.readable() || has_permission(&target, perm::READ);
        let writable = !flags.writable() || has_permission(&target, perm::WRITE);
        if !readable || !writable {
            return Err(KernelError::PermissionDenied);
        }

        open_fs(&node, flags)?;
        Ok(node)
    }

    /// Logs the mount table.
    ///
    /// For debugging.
    pub fn dump(&self) {
        self.tree.lock().dump(0);
    }
}
