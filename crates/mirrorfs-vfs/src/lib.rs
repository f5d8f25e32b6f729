//! Read-only virtual filesystem shapes for mirrorfs.
//!
//! This crate holds everything the client and the server agree on that is
//! not wire encoding:
//!
//! - [`VfsOps`] - The four read-only questions a mirror can ask of storage
//! - [`FileAttr`], [`DirEntry`], [`StatFs`] - The abstract answers
//! - [`LocalBackend`] - Real filesystem access under an export root
//! - [`MemoryBackend`] - In-memory tree (for tests and loopback mounts)
//!
//! ## Design Decisions
//!
//! - **Path-based, no inodes**: Operations take absolute paths. The FUSE
//!   client owns the inode ↔ path mapping.
//! - **Whole-file reads**: `read_all` transfers the complete content. The
//!   caller windows the bytes locally, so no open handles exist anywhere.
//! - **Native identity travels with metadata**: [`FileAttr::ino`] carries the
//!   storage's own inode number when the platform exposes it.

pub mod backends;
mod error;
mod ops;
mod types;

pub use backends::{LocalBackend, MemoryBackend};
pub use error::{VfsError, VfsResult};
pub use ops::VfsOps;
pub use types::{DirEntry, FileAttr, FileType, StatFs};
