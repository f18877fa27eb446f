use thiserror::Error;

use crate::fs::codec::CodecError;
use crate::store::StoreError;

/// Errors surfaced to the kernel, one variant per errno.
///
/// Every mutating operation aborts its transaction on the first error and
/// returns one of these. Store errors matching "key not found" become
/// [`FsError::NotFound`]; create-only races become [`FsError::Exists`]; any
/// other store, codec, or transaction failure is [`FsError::Fault`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FsError {
    #[error("read-only file system")]
    ReadOnly,
    #[error("file exists")]
    Exists,
    #[error("no such file or directory")]
    NotFound,
    #[error("directory not empty")]
    NotEmpty,
    #[error("permission denied")]
    Access,
    #[error("bad file handle")]
    BadHandle,
    #[error("entry type not supported")]
    NotSupported,
    #[error("internal fault")]
    Fault,
}

impl FsError {
    pub fn errno(self) -> libc::c_int {
        match self {
            FsError::ReadOnly => libc::EROFS,
            FsError::Exists => libc::EEXIST,
            FsError::NotFound => libc::ENOENT,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::Access => libc::EACCES,
            FsError::BadHandle => libc::EBADF,
            FsError::NotSupported => libc::ENOTSUP,
            FsError::Fault => libc::EFAULT,
        }
    }
}

impl From<StoreError> for FsError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::KeyNotFound => FsError::NotFound,
            StoreError::RecordExists | StoreError::MapKeyExists => FsError::Exists,
            _ => FsError::Fault,
        }
    }
}

impl From<CodecError> for FsError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::UnknownEntryType(_) => FsError::NotSupported,
            _ => FsError::Fault,
        }
    }
}
