use strum::FromRepr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, thiserror::Error)]
#[repr(isize)]
pub enum SyscallError {
    // EPERM
    #[error("operation not permitted")]
    NotPermitted = 1,
    // ENOENT
    #[error("no such file or directory")]
    FsEntryNotFound = 2,
    // ESRCH
    #[error("no such process")]
    ProcessNotFound = 3,
    // EINTR
    #[error("interrupted system call")]
    Interrupted = 4,
    // EIO
    #[error("input/output error")]
    Io = 5,
    // EBADF
    #[error("bad file descriptor")]
    BadFileDescriptor = 9,
    // EAGAIN
    #[error("resource temporarily unavailable")]
    ResourceTempolaryUnavailable = 11,
    // ENOMEM
    #[error("cannot allocate memory")]
    OutOfMemory = 12,
    // EACCESS
    #[error("permission denied")]
    PermissionDenied = 13,
    // EEXIST
    #[error("file exists")]
    AlreadyExists = 17,
    // ENOTDIR
    #[error("not a directory")]
    NotADirectory = 20,
    // EISDIR
    #[error("is a directory")]
    IsADirectory = 21,
    // EINVAL
    #[error("invalid argument")]
    InvalidInput = 22,
    // EMFILE
    #[error("too many open files")]
    TooManyOpenFiles = 24,
    // ENOTTY
    #[error("inappropriate I/O control operation")]
    NoTty = 25,
    // ESPIPE
    #[error("illegal seek")]
    NotSeekable = 29,
    // EROFS
    #[error("read-only file system")]
    ReadOnlyFilesystem = 30,
    // EPIPE
    #[error("broken pipe")]
    BrokenPipe = 32,
    // ENAMETOOLONG
    #[error("file name too long")]
    InvalidFilename = 36,
    // ENOTEMPTY
    #[error("directory not empty")]
    DirectoryNotEmpty = 39,
    // EMSGSIZE
    #[error("message too long")]
    MessageTooLong = 90,
    // EADDRINUSE
    #[error("address already in use")]
    AddrInUse = 98,
    // ERESTARTSYS
    #[error("process was killed during the system call")]
    Killed = 512,
    #[error("unknown error")]
    Unknown = -1,
}

impl SyscallError {
    /// Returns the errno value carried back to the caller.
    #[must_use]
    pub const fn errno(self) -> isize {
        self as isize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_values_round_trip() {
        assert_eq!(SyscallError::BrokenPipe.errno(), 32);
        assert_eq!(SyscallError::from_repr(4), Some(SyscallError::Interrupted));
        assert_eq!(SyscallError::from_repr(10_000), None);
    }
}
