//! Filesystem operations, independent of the kernel transport.
//!
//! [`MountSession`] owns everything one mount needs: the inode table, the
//! storage bridge, the mount root, the local owner and the attribute TTL.
//! Each kernel operation is one async method returning [`FsError`], the
//! two-code taxonomy the kernel sees. The FUSE adapter in [`crate::fuse`]
//! only translates these into replies.

use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use mirrorfs_vfs::{FileAttr, FileType, StatFs, VfsOps};

use crate::constants::{BLOCK_SIZE, DEFAULT_ATTR_TTL, READDIR_CONCURRENCY};
use crate::inode::{InodeTable, ResolveError};

/// Errors surfaced to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FsError {
    /// Unknown identifier or vanished entry.
    #[error("no such entry")]
    NotFound,
    /// Remote failure, out-of-range read, or anything else.
    #[error("I/O error")]
    Io,
}

impl FsError {
    pub fn errno(self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::Io => libc::EIO,
        }
    }
}

/// One directory listing entry, ready for the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dirent {
    pub ino: u64,
    /// Ordinal position; the kernel passes it back as the next cursor.
    pub offset: i64,
    pub kind: fuser::FileType,
    pub name: String,
}

/// Answer to an extended-attribute query. None are exported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XattrReply {
    /// Required buffer size, for a query made with a zero-sized buffer.
    Size(u32),
    Data(Vec<u8>),
}

/// Reply to `getxattr`/`listxattr`: an empty attribute set rather than
/// ENOSYS, so tools that look for attributes keep going.
pub fn xattr_reply(size: u32) -> XattrReply {
    if size == 0 {
        XattrReply::Size(0)
    } else {
        XattrReply::Data(Vec::new())
    }
}

/// Hand `entries` to `add` in order until it returns `true` (buffer full).
/// The entry that did not fit is not counted. Returns how many were taken.
pub fn fill_dir<F>(entries: &[Dirent], mut add: F) -> usize
where
    F: FnMut(&Dirent) -> bool,
{
    let mut added = 0;
    for entry in entries {
        if add(entry) {
            break;
        }
        added += 1;
    }
    added
}

/// Per-mount context, cheap to clone into each operation's task.
#[derive(Clone)]
pub struct MountSession {
    table: Arc<InodeTable>,
    backend: Arc<dyn VfsOps>,
    uid: u32,
    gid: u32,
    attr_ttl: Duration,
}

impl MountSession {
    /// Create a session exporting `root` (an absolute path on the server).
    ///
    /// Files appear owned by the calling process until [`with_owner`] says
    /// otherwise.
    ///
    /// [`with_owner`]: MountSession::with_owner
    pub fn new(backend: Arc<dyn VfsOps>, root: impl Into<PathBuf>) -> Self {
        Self {
            table: Arc::new(InodeTable::new(root)),
            backend,
            uid: rustix::process::getuid().as_raw(),
            gid: rustix::process::getgid().as_raw(),
            attr_ttl: DEFAULT_ATTR_TTL,
        }
    }

    /// Override the owner reported for every file.
    pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    /// Override how long the kernel may cache attributes.
    pub fn with_attr_ttl(mut self, attr_ttl: Duration) -> Self {
        self.attr_ttl = attr_ttl;
        self
    }

    pub fn attr_ttl(&self) -> Duration {
        self.attr_ttl
    }

    pub fn table(&self) -> &InodeTable {
        &self.table
    }

    // ========================================================================
    // Kernel operations
    // ========================================================================

    /// Statistics of the filesystem holding the mount root, unmodified.
    #[tracing::instrument(skip(self), name = "fs.statfs", level = "debug")]
    pub async fn statfs(&self) -> Result<StatFs, FsError> {
        let root = self.table.root();
        self.backend.statfs(root.path()).await.map_err(|e| {
            tracing::warn!("statfs {}: {}", root.path().display(), e);
            FsError::Io
        })
    }

    /// Resolve `name` under `parent` and count it as a kernel reference.
    #[tracing::instrument(skip(self), name = "fs.lookup", level = "debug")]
    pub async fn lookup(&self, parent: u64, name: &OsStr) -> Result<fuser::FileAttr, FsError> {
        match self
            .table
            .lookup(parent, name, self.backend.as_ref())
            .await
        {
            Ok((record, attr)) => Ok(self.to_fuse_attr(record.id(), &attr)),
            Err(ResolveError::UnknownParent(_)) | Err(ResolveError::Stat(_)) => {
                Err(FsError::NotFound)
            }
            Err(e @ ResolveError::InvalidName(_)) => {
                tracing::debug!("lookup failed: {}", e);
                Err(FsError::Io)
            }
        }
    }

    /// Fresh attributes for a known identifier.
    #[tracing::instrument(skip(self), name = "fs.getattr", level = "debug")]
    pub async fn getattr(&self, ino: u64) -> Result<fuser::FileAttr, FsError> {
        let record = self.table.get(ino).ok_or(FsError::NotFound)?;
        let attr = self
            .backend
            .getattr(record.path())
            .await
            .map_err(|e| {
                tracing::debug!("getattr {}: {}", record.path().display(), e);
                FsError::Io
            })?;
        Ok(self.to_fuse_attr(ino, &attr))
    }

    /// Open a file or directory. Only checks the identifier is known; no
    /// handle state exists.
    pub fn open(&self, ino: u64) -> Result<(), FsError> {
        self.table.get(ino).map(|_| ()).ok_or(FsError::NotFound)
    }

    /// List a directory from cursor `offset`.
    ///
    /// Entries are re-fetched every call. Each is resolved to an identifier
    /// (concurrently, keeping listing order); entries that fail to resolve
    /// are dropped before ordinals are assigned, so ordinals start at 1 and
    /// have no gaps. A cursor past the end yields an empty listing.
    #[tracing::instrument(skip(self), name = "fs.readdir", level = "debug")]
    pub async fn readdir(&self, ino: u64, offset: i64) -> Result<Vec<Dirent>, FsError> {
        let skip = usize::try_from(offset).map_err(|_| FsError::Io)?;
        let record = self.table.get(ino).ok_or(FsError::NotFound)?;
        let listing = self
            .backend
            .readdir(record.path())
            .await
            .map_err(|e| {
                tracing::debug!("readdir {}: {}", record.path().display(), e);
                FsError::Io
            })?;

        let table = &self.table;
        let backend = self.backend.as_ref();
        let resolved: Vec<Option<Dirent>> = futures::stream::iter(listing)
            .map(|entry| async move {
                match table.resolve(ino, OsStr::new(&entry.name), backend).await {
                    Ok((child, _)) => Some(Dirent {
                        ino: child.id(),
                        offset: 0,
                        kind: to_fuse_kind(entry.kind),
                        name: entry.name,
                    }),
                    Err(e) => {
                        // Listed, then gone: omitted rather than reported.
                        tracing::debug!(name = %entry.name, "skipping entry: {}", e);
                        None
                    }
                }
            })
            .buffered(READDIR_CONCURRENCY)
            .collect()
            .await;

        Ok(resolved
            .into_iter()
            .flatten()
            .enumerate()
            .map(|(i, dirent)| Dirent {
                offset: i as i64 + 1,
                ..dirent
            })
            .skip(skip)
            .collect())
    }

    /// Read up to `size` bytes at `offset`.
    ///
    /// The whole file is fetched and windowed locally. Reading at exactly
    /// the end returns nothing; past the end is an error.
    #[tracing::instrument(skip(self), name = "fs.read", level = "debug")]
    pub async fn read(&self, ino: u64, offset: i64, size: u32) -> Result<Vec<u8>, FsError> {
        let record = self.table.get(ino).ok_or(FsError::NotFound)?;
        let start = usize::try_from(offset).map_err(|_| FsError::Io)?;
        let data = self
            .backend
            .read_all(record.path())
            .await
            .map_err(|e| {
                tracing::debug!("read {}: {}", record.path().display(), e);
                FsError::Io
            })?;

        if start > data.len() {
            return Err(FsError::Io);
        }
        let end = start.saturating_add(size as usize).min(data.len());
        Ok(data[start..end].to_vec())
    }

    /// Drop kernel references to an identifier.
    pub fn forget(&self, ino: u64, nlookup: u64) {
        self.table.forget(ino, nlookup);
    }

    /// Flush or release a file or directory. No handle state exists, so this
    /// leaves the table alone and succeeds even for a forgotten identifier.
    pub fn release(&self, ino: u64) -> Result<(), FsError> {
        tracing::trace!(ino, "release");
        Ok(())
    }

    // ========================================================================
    // Attribute conversion
    // ========================================================================

    fn to_fuse_attr(&self, ino: u64, attr: &FileAttr) -> fuser::FileAttr {
        fuser::FileAttr {
            ino,
            size: attr.size,
            blocks: attr.size.div_ceil(u64::from(BLOCK_SIZE)),
            atime: attr.mtime,
            mtime: attr.mtime,
            ctime: attr.mtime,
            crtime: attr.mtime,
            kind: to_fuse_kind(attr.kind),
            perm: (attr.perm & 0o7777) as u16,
            nlink: if attr.is_dir() { 2 } else { 1 },
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }
}

fn to_fuse_kind(kind: FileType) -> fuser::FileType {
    match kind {
        FileType::File => fuser::FileType::RegularFile,
        FileType::Directory => fuser::FileType::Directory,
        FileType::Symlink => fuser::FileType::Symlink,
    }
}
