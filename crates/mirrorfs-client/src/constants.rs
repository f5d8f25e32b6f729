//! Client configuration constants.
//!
//! Centralizes hardcoded values for easier configuration and documentation.

use std::time::Duration;

/// Inode number the kernel uses for the mount root (`FUSE_ROOT_ID`).
pub const ROOT_INODE: u64 = 1;

/// First identifier handed out when the remote side has no native inode
/// number. Native numbers stay far below this, so the two never collide.
pub const SYNTHETIC_INODE_BASE: u64 = 1 << 63;

/// How long the kernel may cache attributes and entries.
pub const DEFAULT_ATTR_TTL: Duration = Duration::from_secs(1);

/// Concurrent identity resolutions per directory listing.
pub const READDIR_CONCURRENCY: usize = 32;

/// Block size reported in attributes for `st_blocks` accounting.
pub const BLOCK_SIZE: u32 = 512;

/// Filesystem name shown in the mount table.
pub const FS_NAME: &str = "mirrorfs";

/// Service name reported to OpenTelemetry.
pub const SERVICE_NAME: &str = "mirrorfs-mount";
