use misaka_types::error::SyscallError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    #[error("lock is held by another context")]
    LockContended,
    #[error("caller process already killed")]
    CallerProcessAlreadyKilled,
    #[error("interrupted by signal")]
    Interrupted,
    #[error("broken pipe")]
    BrokenPipe,
    #[error("operation would block")]
    WouldBlock,
    #[error("file system entry not found")]
    FsEntryNotFound,
    #[error("file system entry already exists")]
    AlreadyExists,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("directory not empty")]
    DirectoryNotEmpty,
    #[error("invalid input")]
    InvalidInput,
    #[error("path too long")]
    PathTooLong,
    #[error("message too long")]
    MessageTooLong,
    #[error("bad file descriptor")]
    BadFileDescriptor,
    #[error("too many open files")]
    TooManyOpenFiles,
    #[error("process table full")]
    NoFreeProc,
    #[error("process not found")]
    ProcessNotFound,
    #[error("permission denied")]
    PermissionDenied,
    #[error("operation not permitted")]
    NotPermitted,
    #[error("inappropriate ioctl for device")]
    NoTty,
    #[error("unknown filesystem type")]
    UnknownFsType,
    #[error("no such pex client")]
    NoSuchClient,
    #[error("pex endpoint already bound")]
    EndpointAlreadyBound,
}

impl From<KernelError> for SyscallError {
    fn from(error: KernelError) -> Self {
        match error {
            KernelError::LockContended | KernelError::WouldBlock => {
                Self::ResourceTempolaryUnavailable
            }
            KernelError::CallerProcessAlreadyKilled => Self::Killed,
            KernelError::Interrupted => Self::Interrupted,
            KernelError::BrokenPipe => Self::BrokenPipe,
            KernelError::FsEntryNotFound | KernelError::UnknownFsType => Self::FsEntryNotFound,
            KernelError::AlreadyExists => Self::AlreadyExists,
            KernelError::EndpointAlreadyBound => Self::AddrInUse,
            KernelError::NotADirectory => Self::NotADirectory,
            KernelError::IsADirectory => Self::IsADirectory,
            KernelError::DirectoryNotEmpty => Self::DirectoryNotEmpty,
            KernelError::InvalidInput | KernelError::NoSuchClient => Self::InvalidInput,
            KernelError::PathTooLong => Self::InvalidFilename,
            KernelError::MessageTooLong => Self::MessageTooLong,
            KernelError::BadFileDescriptor => Self::BadFileDescriptor,
            KernelError::TooManyOpenFiles => Self::TooManyOpenFiles,
            KernelError::NoFreeProc => Self::OutOfMemory,
            KernelError::ProcessNotFound => Self::ProcessNotFound,
            KernelError::PermissionDenied => Self::PermissionDenied,
            KernelError::NotPermitted => Self::NotPermitted,
            KernelError::NoTty => Self::NoTty,
        }
    }
}
