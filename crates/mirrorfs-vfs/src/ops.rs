//! VFS operations trait.
//!
//! This trait defines the read-only questions a mirror asks of storage,
//! shaped for RPC: path-based, stateless, one call per question.

use async_trait::async_trait;
use std::path::Path;

use super::types::{DirEntry, FileAttr, StatFs};
use super::VfsResult;

/// Core VFS operations trait.
///
/// All paths are absolute. Implementations hold no per-call state: every
/// method is answered from a fresh query of the underlying storage, so two
/// calls for the same path may observe different results.
///
/// The server implements this over the real filesystem ([`LocalBackend`]);
/// the client implements it over the network, which lets the FUSE
/// dispatcher run unchanged against either.
///
/// [`LocalBackend`]: crate::LocalBackend
#[async_trait]
pub trait VfsOps: Send + Sync {
    /// Get filesystem statistics for the filesystem containing `path`.
    async fn statfs(&self, path: &Path) -> VfsResult<StatFs>;

    /// Get file attributes, including the native inode number when known.
    async fn getattr(&self, path: &Path) -> VfsResult<FileAttr>;

    /// Read directory entries.
    ///
    /// Returns all entries in the directory (no pagination), ordered by name.
    async fn readdir(&self, path: &Path) -> VfsResult<Vec<DirEntry>>;

    /// Read the entire file contents.
    async fn read_all(&self, path: &Path) -> VfsResult<Vec<u8>>;
}
