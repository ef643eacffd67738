//! Filesystem error types.

use std::io;

use kvfs_kv::{KvError, TxError};
use thiserror::Error;

/// Filesystem error type.
///
/// One variant per error kind a host adapter has to distinguish. The adapter,
/// not the engine, maps these onto OS error numbers.
#[derive(Debug, Error)]
pub enum FsError {
    /// File or directory not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Path already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Expected a file.
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// Expected a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Directory not empty.
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    /// Malformed name or argument, or a rename into the source's own subtree.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A path segment or attribute name is longer than 255 bytes.
    #[error("name too long: {0}")]
    NameTooLong(String),

    /// Extended attribute not present.
    #[error("no such attribute: {0}")]
    AttrNotFound(String),

    /// Reserved extended attribute name.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// File size or link count limit reached.
    #[error("no space: {0}")]
    NoSpace(String),

    /// The backing store failed.
    #[error("storage error: {0}")]
    Storage(#[from] KvError),

    /// Fewer bytes were available than requested.
    ///
    /// A short-read signal rather than a failure; `read` bytes were copied.
    #[error("end of data after {read} bytes")]
    EndOfData { read: usize },
}

impl FsError {
    /// Create a NotFound error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    /// Create an AlreadyExists error.
    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists(path.into())
    }

    /// Create an IsADirectory error.
    pub fn is_a_directory(path: impl Into<String>) -> Self {
        Self::IsADirectory(path.into())
    }

    /// Create a NotADirectory error.
    pub fn not_a_directory(path: impl Into<String>) -> Self {
        Self::NotADirectory(path.into())
    }

    /// Create a DirectoryNotEmpty error.
    pub fn directory_not_empty(path: impl Into<String>) -> Self {
        Self::DirectoryNotEmpty(path.into())
    }

    /// Create an InvalidArgument error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an AttrNotFound error.
    pub fn attr_not_found(name: impl Into<String>) -> Self {
        Self::AttrNotFound(name.into())
    }

    /// Create a NoSpace error.
    pub fn no_space(msg: impl Into<String>) -> Self {
        Self::NoSpace(msg.into())
    }

    /// Create a Storage error for an undecodable stored value.
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Storage(KvError::corrupt(msg))
    }
}

impl TxError for FsError {
    fn as_kv(&self) -> Option<&KvError> {
        match self {
            FsError::Storage(e) => Some(e),
            _ => None,
        }
    }
}

/// Convert FsError to std::io::Error for host adapters.
impl From<FsError> for io::Error {
    fn from(e: FsError) -> Self {
        match e {
            FsError::NotFound(msg) => io::Error::new(io::ErrorKind::NotFound, msg),
            FsError::AlreadyExists(msg) => io::Error::new(io::ErrorKind::AlreadyExists, msg),
            FsError::IsADirectory(msg) => io::Error::new(io::ErrorKind::IsADirectory, msg),
            FsError::NotADirectory(msg) => io::Error::new(io::ErrorKind::NotADirectory, msg),
            FsError::DirectoryNotEmpty(msg) => {
                io::Error::new(io::ErrorKind::DirectoryNotEmpty, msg)
            }
            FsError::InvalidArgument(msg) => io::Error::new(io::ErrorKind::InvalidInput, msg),
            FsError::NameTooLong(msg) => io::Error::new(io::ErrorKind::InvalidInput, msg),
            FsError::AttrNotFound(msg) => io::Error::new(io::ErrorKind::NotFound, msg),
            FsError::NotSupported(msg) => io::Error::new(io::ErrorKind::Unsupported, msg),
            FsError::NoSpace(msg) => io::Error::new(io::ErrorKind::StorageFull, msg),
            FsError::Storage(e) => io::Error::other(e),
            FsError::EndOfData { read } => io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("end of data after {read} bytes"),
            ),
        }
    }
}

/// Filesystem result type.
pub type FsResult<T> = Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_storage_conflicts_retry() {
        assert!(FsError::Storage(KvError::Conflict).is_retryable());
        assert!(!FsError::Storage(KvError::backend("gone")).is_retryable());
        assert!(!FsError::not_found("/x").is_retryable());
        assert!(FsError::not_found("/x").as_kv().is_none());
    }

    #[test]
    fn test_io_error_kinds() {
        let kind = |e: FsError| io::Error::from(e).kind();
        assert_eq!(kind(FsError::not_found("/a")), io::ErrorKind::NotFound);
        assert_eq!(
            kind(FsError::directory_not_empty("/d")),
            io::ErrorKind::DirectoryNotEmpty
        );
        assert_eq!(
            kind(FsError::NotSupported("com.apple.ResourceFork".into())),
            io::ErrorKind::Unsupported
        );
        assert_eq!(kind(FsError::no_space("big")), io::ErrorKind::StorageFull);
        assert_eq!(
            kind(FsError::EndOfData { read: 3 }),
            io::ErrorKind::UnexpectedEof
        );
    }
}
