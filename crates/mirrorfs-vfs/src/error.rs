//! VFS error types.

use std::io;
use thiserror::Error;

/// Everything a storage or bridge call can fail with.
///
/// Storage-side variants carry the offending path; bridge-side variants
/// (`Cancelled`, `Remote`) carry the transport's message.
#[derive(Debug, Error)]
pub enum VfsError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// Resolves outside the export root, directly or through a symlink.
    #[error("path escapes root: {0}")]
    PathEscapesRoot(String),

    /// Relative, empty, or otherwise unusable as an absolute path.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// The remote side answered without a result payload.
    #[error("call cancelled: {0}")]
    Cancelled(String),

    /// The remote side could not be reached or reported a failure.
    #[error("remote error: {0}")]
    Remote(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Other(String),
}

impl VfsError {
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    pub fn not_a_directory(path: impl Into<String>) -> Self {
        Self::NotADirectory(path.into())
    }

    pub fn is_a_directory(path: impl Into<String>) -> Self {
        Self::IsADirectory(path.into())
    }

    pub fn path_escapes_root(path: impl Into<String>) -> Self {
        Self::PathEscapesRoot(path.into())
    }

    pub fn invalid_path(path: impl Into<String>) -> Self {
        Self::InvalidPath(path.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn remote(msg: impl Into<String>) -> Self {
        Self::Remote(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// True if the path does not exist.
    ///
    /// Local storage reports missing paths through `Io`, so that kind counts too.
    pub fn is_not_found(&self) -> bool {
        match self {
            VfsError::NotFound(_) => true,
            VfsError::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// VFS result type.
pub type VfsResult<T> = Result<T, VfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_not_found() {
        assert!(VfsError::not_found("/a").is_not_found());
        assert!(VfsError::Io(io::Error::from(io::ErrorKind::NotFound)).is_not_found());
        assert!(!VfsError::remote("boom").is_not_found());
        assert!(!VfsError::path_escapes_root("/etc").is_not_found());
    }

    #[test]
    fn test_messages_carry_path() {
        assert_eq!(
            VfsError::path_escapes_root("/etc/passwd").to_string(),
            "path escapes root: /etc/passwd"
        );
        assert_eq!(
            VfsError::cancelled("no result").to_string(),
            "call cancelled: no result"
        );
    }
}
