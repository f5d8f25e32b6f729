//! Core VFS types.
//!
//! These types are RPC-friendly (path-based, plain data) and are what the
//! rest of mirrorfs sees instead of the Cap'n Proto wire records.

use std::time::SystemTime;

/// Mask selecting the file-type bits of a POSIX mode.
pub const S_IFMT: u32 = 0o170000;
/// Directory type bits.
pub const S_IFDIR: u32 = 0o040000;
/// Regular file type bits.
pub const S_IFREG: u32 = 0o100000;
/// Symbolic link type bits.
pub const S_IFLNK: u32 = 0o120000;

/// Kind of entry, as far as the mirror distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
}

impl FileType {
    pub fn is_file(&self) -> bool {
        matches!(self, FileType::File)
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, FileType::Directory)
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self, FileType::Symlink)
    }

    /// Classify a POSIX mode by its type bits.
    ///
    /// Devices, sockets and fifos are presented as regular files; the mirror
    /// only ever reads them as byte streams.
    pub fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            S_IFDIR => FileType::Directory,
            S_IFLNK => FileType::Symlink,
            _ => FileType::File,
        }
    }

    /// The POSIX type bits for this kind.
    pub fn mode_bits(&self) -> u32 {
        match self {
            FileType::File => S_IFREG,
            FileType::Directory => S_IFDIR,
            FileType::Symlink => S_IFLNK,
        }
    }
}

/// File attributes (metadata).
///
/// Produced fresh on every query and never cached. Ownership is not part of
/// this record: the mounting process substitutes its own uid/gid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttr {
    /// Final path component.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// File type.
    pub kind: FileType,
    /// Permission bits (e.g., 0o644), without type bits.
    pub perm: u32,
    /// Last modification time.
    pub mtime: SystemTime,
    /// Native inode number on the storage side, 0 when unavailable.
    pub ino: u64,
}

impl FileAttr {
    /// Create attributes for a file.
    pub fn file(name: impl Into<String>, size: u64, perm: u32) -> Self {
        Self {
            name: name.into(),
            size,
            kind: FileType::File,
            perm,
            mtime: SystemTime::now(),
            ino: 0,
        }
    }

    /// Create attributes for a directory.
    pub fn directory(name: impl Into<String>, perm: u32) -> Self {
        Self {
            name: name.into(),
            size: 0,
            kind: FileType::Directory,
            perm,
            mtime: SystemTime::now(),
            ino: 0,
        }
    }

    /// Set the native inode number.
    pub fn with_ino(mut self, ino: u64) -> Self {
        self.ino = ino;
        self
    }

    /// Build attributes from a full POSIX mode (type + permission bits).
    pub fn from_mode(
        name: impl Into<String>,
        size: u64,
        mode: u32,
        mtime: SystemTime,
        ino: u64,
    ) -> Self {
        Self {
            name: name.into(),
            size,
            kind: FileType::from_mode(mode),
            perm: mode & 0o7777,
            mtime,
            ino,
        }
    }

    /// Full POSIX mode: type bits plus permission bits.
    pub fn mode(&self) -> u32 {
        self.kind.mode_bits() | (self.perm & 0o7777)
    }

    pub fn is_file(&self) -> bool {
        self.kind.is_file()
    }

    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    pub fn is_symlink(&self) -> bool {
        self.kind.is_symlink()
    }
}

/// Directory entry.
///
/// `kind` is the entry's own type (a symlink stays a symlink); `attr` is the
/// stat record of what the entry refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Entry name (not full path).
    pub name: String,
    /// Entry type.
    pub kind: FileType,
    /// Nested stat record.
    pub attr: FileAttr,
}

impl DirEntry {
    /// Create a directory entry whose type is taken from its attributes.
    pub fn new(attr: FileAttr) -> Self {
        Self {
            name: attr.name.clone(),
            kind: attr.kind,
            attr,
        }
    }

    /// Returns true if the entry is a directory.
    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }
}

/// Filesystem statistics.
///
/// Returned verbatim from the storage side; the client never adjusts these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatFs {
    /// Total blocks, in units of `bsize`.
    pub blocks: u64,
    /// Free blocks.
    pub bfree: u64,
    /// Available blocks (to non-root).
    pub bavail: u64,
    /// Total inodes.
    pub files: u64,
    /// Free inodes.
    pub ffree: u64,
    /// Block size.
    pub bsize: u32,
    /// Preferred I/O size.
    pub iosize: u32,
    /// Maximum name length.
    pub namelen: u32,
}

impl Default for StatFs {
    /// A plausible 4 GiB filesystem, half full.
    fn default() -> Self {
        Self {
            blocks: 1 << 20,
            bfree: 1 << 19,
            bavail: 1 << 19,
            files: 1 << 20,
            ffree: 1 << 19,
            bsize: 4096,
            iosize: 4096,
            namelen: 255,
        }
    }
}
