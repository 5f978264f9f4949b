use std::{string::String, sync::Arc};

use misaka_types::{
    error::SyscallError,
    fs::{Dirent, OpenFlags},
    termios::{Termios, Winsize},
};

use super::syscall;
use crate::{
    error::KernelError,
    file::File,
    kernel::Kernel,
    pipe,
    proc::Process,
    vfs::{self, NodeRef, canonicalize_path},
};

/// Resolves the parent directory of `path` and returns it with the final
/// component.
fn parent_of(kernel: &Kernel, p: &Process, path: &str) -> Result<(NodeRef, String), KernelError> {
    let path = canonicalize_path(&p.cwd(), path)?;
    let (parent, name) = vfs::split_parent(&path).ok_or(KernelError::InvalidInput)?;
    let dir = kernel.vfs().lookup(parent)?;
    Ok((dir, name.into()))
}

/// Opens `path` and returns the new file descriptor.
///
/// With `CREATE` a missing file is created with permission bits `mode`;
/// `CREATE | EXCL` fails if the path exists.
pub fn open(path: &str, flags: OpenFlags, mode: u32) -> Result<usize, SyscallError> {
    syscall(|kernel, p| {
        if flags.contains(OpenFlags::CREATE) {
            let canonical = canonicalize_path(&p.cwd(), path)?;
            match kernel.vfs().lookup(&canonical) {
                Ok(_) if flags.contains(OpenFlags::EXCL) => {
                    return Err(KernelError::AlreadyExists);
                }
                Ok(_) => {}
                Err(KernelError::FsEntryNotFound) => {
                    let (dir, name) = parent_of(kernel, p, &canonical)?;
                    vfs::create_fs(&dir, &name, mode)?;
                }
                Err(e) => return Err(e),
            }
        }

        let node = kernel.vfs().kopen(path, flags)?;
        let file = File::new(node, flags);
        if flags.contains(OpenFlags::TRUNC) && flags.writable() {
            vfs::truncate_fs(file.node())?;
        }
        p.add_ofile(file)
    })
}

pub fn read(fd: usize, buf: &mut [u8]) -> Result<usize, SyscallError> {
    syscall(|_, p| p.ofile(fd)?.read(buf))
}

pub fn write(fd: usize, buf: &[u8]) -> Result<usize, SyscallError> {
    syscall(|_, p| p.ofile(fd)?.write(buf))
}

pub fn close(fd: usize) -> Result<(), SyscallError> {
    syscall(|_, p| {
        let _file = p.unset_ofile(fd)?;
        Ok(())
    })
}

pub fn dup(fd: usize) -> Result<usize, SyscallError> {
    syscall(|_, p| {
        let file = p.ofile(fd)?;
        p.add_ofile(file)
    })
}

/// Makes `new` refer to the file open at `old`, closing what `new` held.
pub fn dup2(old: usize, new: usize) -> Result<usize, SyscallError> {
    syscall(|_, p| {
        let file = p.ofile(old)?;
        if old != new {
            let _replaced = p.set_ofile(new, file)?;
        }
        Ok(new)
    })
}

/// Creates an anonymous pipe and returns its read and write descriptors.
pub fn pipe() -> Result<(usize, usize), SyscallError> {
    syscall(|kernel, p| {
        let (r, w) = pipe::make_unix_pipe(kernel.procs(), kernel.config().pipe_size);
        let rf = File::open(r, OpenFlags::READ_ONLY)?;
        let wf = File::open(w, OpenFlags::WRITE_ONLY)?;
        let rfd = p.add_ofile(rf)?;
        match p.add_ofile(wf) {
            Ok(wfd) => Ok((rfd, wfd)),
            Err(e) => {
                let _ = p.unset_ofile(rfd);
                Err(e)
            }
        }
    })
}

pub fn ioctl(fd: usize, request: u64, arg: &mut [u8]) -> Result<usize, SyscallError> {
    syscall(|_, p| p.ofile(fd)?.ioctl(request, arg))
}

/// Returns entry `index` of directory `fd`, or `None` past the end.
pub fn readdir(fd: usize, index: usize) -> Result<Option<Dirent>, SyscallError> {
    syscall(|_, p| p.ofile(fd)?.readdir(index))
}

pub fn mkdir(path: &str, mode: u32) -> Result<(), SyscallError> {
    syscall(|kernel, p| {
        let (dir, name) = parent_of(kernel, p, path)?;
        vfs::mkdir_fs(&dir, &name, mode)
    })
}

pub fn mkfifo(path: &str, mode: u32) -> Result<(), SyscallError> {
    syscall(|kernel, p| {
        let (dir, name) = parent_of(kernel, p, path)?;
        vfs::mkfifo_fs(&dir, &name, mode)
    })
}

pub fn unlink(path: &str) -> Result<(), SyscallError> {
    syscall(|kernel, p| {
        let (dir, name) = parent_of(kernel, p, path)?;
        vfs::unlink_fs(&dir, &name)
    })
}

/// Mounts a new instance of the registered file system `fstype`.
///
/// Only root may mount.
pub fn mount(fstype: &str, source: &str, target: &str) -> Result<(), SyscallError> {
    syscall(|kernel, p| {
        if p.uid() != 0 {
            return Err(KernelError::NotPermitted);
        }
        let target = canonicalize_path(&p.cwd(), target)?;
        kernel.vfs().mount_type(fstype, source, &target)
    })
}

/// Allocates a pseudo-terminal and returns its master and slave
/// descriptors.
pub fn openpty(
    termios: Option<&Termios>,
    winsize: Option<&Winsize>,
) -> Result<(usize, usize), SyscallError> {
    syscall(|kernel, p| {
        let (master, slave) = kernel.ptys().openpty(termios, winsize);
        let master = File::open(master, OpenFlags::READ_WRITE)?;
        let slave = File::open(slave, OpenFlags::READ_WRITE)?;
        let mfd = p.add_ofile(master)?;
        match p.add_ofile(slave) {
            Ok(sfd) => Ok((mfd, sfd)),
            Err(e) => {
                let _ = p.unset_ofile(mfd);
                Err(e)
            }
        }
    })
}

fn first_ready(nodes: &[NodeRef]) -> Result<Option<usize>, KernelError> {
    for (i, node) in nodes.iter().enumerate() {
        if vfs::selectcheck_fs(node)? {
            return Ok(Some(i));
        }
    }
    Ok(None)
}

/// Waits until one of `fds` is readable and returns its index in `fds`.
pub fn fswait(fds: &[usize]) -> Result<usize, SyscallError> {
    syscall(|_, p| {
        if fds.is_empty() {
            return Err(KernelError::InvalidInput);
        }
        let nodes = fds
            .iter()
            .map(|&fd| p.ofile(fd).map(|f| Arc::clone(f.node())))
            .collect::<Result<Vec<_>, _>>()?;

        loop {
            if let Some(i) = first_ready(&nodes)? {
                return Ok(i);
            }

            p.prepare_sleep(true);
            let subscribed = nodes
                .iter()
                .try_for_each(|node| vfs::selectwait_fs(node, p));
            // data may have arrived before the subscriptions were in place
            let ready = subscribed.and_then(|()| first_ready(&nodes));
            let give_up = !matches!(ready, Ok(None)) || p.has_wake_reason();
            if give_up {
                if !p.cancel_sleep() {
                    p.block();
                }
                match ready {
                    Ok(Some(i)) => return Ok(i),
                    Err(e) => return Err(e),
                    Ok(None) => return Err(KernelError::Interrupted),
                }
            }
            p.block();
        }
    })
}

pub fn chdir(path: &str) -> Result<(), SyscallError> {
    syscall(|kernel, p| {
        let path = canonicalize_path(&p.cwd(), path)?;
        let node = kernel.vfs().lookup(&path)?;
        if !vfs::resolve(&node).is_dir() {
            return Err(KernelError::NotADirectory);
        }
        p.set_cwd(&path);
        Ok(())
    })
}

pub fn getcwd() -> Result<String, SyscallError> {
    syscall(|_, p| Ok(p.cwd()))
}
