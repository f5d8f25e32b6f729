//! Local filesystem backend.
//!
//! Answers the four read-only questions against real paths, confined to an
//! export root.

use async_trait::async_trait;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::error::{VfsError, VfsResult};
use crate::ops::VfsOps;
use crate::types::{DirEntry, FileAttr, FileType, StatFs};

/// Local filesystem backend.
///
/// Request paths are absolute physical paths. For example, with `root` set
/// to `/srv/export`, `getattr("/srv/export/a.txt")` stats that exact file
/// while `getattr("/etc/passwd")` is refused.
///
/// Path security is enforced after canonicalization, so neither `..` nor a
/// symlink can reach outside the root.
///
/// Inode numbers are only unique within one device. Entries that live on a
/// different device than the root (a nested mount) are reported with inode
/// `0` so clients assign them an identity of their own.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
    root_dev: Option<u64>,
}

impl LocalBackend {
    /// Create a local backend exporting the given root.
    ///
    /// The root is canonicalized at construction time to handle symlinks
    /// (e.g. macOS `/tmp` → `/private/tmp`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root: PathBuf = root.into();
        let root = dunce::canonicalize(&root).unwrap_or(root);
        let root_dev = std::fs::metadata(&root).ok().map(|m| m.dev());
        Self { root, root_dev }
    }

    /// Create a local backend, failing unless the root is an existing directory.
    pub fn open(root: impl Into<PathBuf>) -> VfsResult<Self> {
        let root: PathBuf = root.into();
        let canonical = dunce::canonicalize(&root).map_err(VfsError::from)?;
        let meta = std::fs::metadata(&canonical).map_err(VfsError::from)?;
        if !meta.is_dir() {
            return Err(VfsError::not_a_directory(root.display().to_string()));
        }
        Ok(Self {
            root: canonical,
            root_dev: Some(meta.dev()),
        })
    }

    /// Get the export root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a request path to a canonical path inside the root.
    ///
    /// Returns an error if the path is relative, missing, or escapes the root.
    async fn resolve(&self, path: &Path) -> VfsResult<PathBuf> {
        if !path.is_absolute() {
            return Err(VfsError::invalid_path(path.display().to_string()));
        }

        let canonical = fs::canonicalize(path).await.map_err(VfsError::from)?;

        if !canonical.starts_with(&self.root) {
            tracing::warn!(path = %path.display(), "refusing path outside export root");
            return Err(VfsError::path_escapes_root(format!(
                "{} is not under {}",
                canonical.display(),
                self.root.display()
            )));
        }

        Ok(canonical)
    }

    /// Convert std::fs::Metadata to FileAttr.
    fn metadata_to_attr(&self, name: String, meta: &std::fs::Metadata) -> FileAttr {
        FileAttr::from_mode(
            name,
            meta.len(),
            meta.mode(),
            meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH),
            exported_ino(self.root_dev, meta.dev(), meta.ino()),
        )
    }

    /// Final component of a request path, or the whole path for `/`.
    fn path_name(path: &Path) -> String {
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned())
    }
}

/// Native inode number, or `0` when `dev` is not the export root's device.
fn exported_ino(root_dev: Option<u64>, dev: u64, ino: u64) -> u64 {
    if root_dev == Some(dev) { ino } else { 0 }
}

#[async_trait]
impl VfsOps for LocalBackend {
    async fn statfs(&self, path: &Path) -> VfsResult<StatFs> {
        let full_path = self.resolve(path).await?;
        let stat = rustix::fs::statvfs(&full_path).map_err(|e| VfsError::Io(e.into()))?;

        Ok(StatFs {
            blocks: stat.f_blocks,
            bfree: stat.f_bfree,
            bavail: stat.f_bavail,
            files: stat.f_files,
            ffree: stat.f_ffree,
            bsize: stat.f_frsize as u32,
            iosize: stat.f_bsize as u32,
            namelen: stat.f_namemax as u32,
        })
    }

    async fn getattr(&self, path: &Path) -> VfsResult<FileAttr> {
        let full_path = self.resolve(path).await?;
        // Follows symlinks: the kernel sees what the link points at.
        let meta = fs::metadata(&full_path).await.map_err(VfsError::from)?;
        Ok(self.metadata_to_attr(Self::path_name(path), &meta))
    }

    async fn readdir(&self, path: &Path) -> VfsResult<Vec<DirEntry>> {
        let full_path = self.resolve(path).await?;
        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&full_path).await.map_err(VfsError::from)?;

        while let Some(entry) = dir.next_entry().await.map_err(VfsError::from)? {
            let file_type = entry.file_type().await.map_err(VfsError::from)?;
            let kind = if file_type.is_dir() {
                FileType::Directory
            } else if file_type.is_symlink() {
                FileType::Symlink
            } else {
                FileType::File
            };

            // Does not traverse symlinks, so dangling links still list.
            let meta = entry.metadata().await.map_err(VfsError::from)?;
            let name = entry.file_name().to_string_lossy().into_owned();

            entries.push(DirEntry {
                name: name.clone(),
                kind,
                attr: self.metadata_to_attr(name, &meta),
            });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn read_all(&self, path: &Path) -> VfsResult<Vec<u8>> {
        let full_path = self.resolve(path).await?;
        if fs::metadata(&full_path).await.map_err(VfsError::from)?.is_dir() {
            return Err(VfsError::is_a_directory(path.display().to_string()));
        }
        fs::read(&full_path).await.map_err(VfsError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup() -> (LocalBackend, TempDir) {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello world!").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let backend = LocalBackend::new(dir.path());
        (backend, dir)
    }

    #[tokio::test]
    async fn test_getattr_file() {
        let (backend, dir) = setup().await;

        let attr = backend.getattr(&dir.path().join("a.txt")).await.unwrap();
        assert_eq!(attr.name, "a.txt");
        assert_eq!(attr.size, 12);
        assert!(attr.is_file());
        assert_ne!(attr.ino, 0);
    }

    #[tokio::test]
    async fn test_getattr_directory() {
        let (backend, dir) = setup().await;

        let attr = backend.getattr(&dir.path().join("sub")).await.unwrap();
        assert!(attr.is_dir());
        assert_eq!(attr.mode() & 0o170000, 0o040000);
    }

    #[tokio::test]
    async fn test_getattr_missing() {
        let (backend, dir) = setup().await;

        let err = backend
            .getattr(&dir.path().join("missing.txt"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_readdir_sorted() {
        let (backend, dir) = setup().await;
        std::fs::write(dir.path().join("0-first.txt"), b"").unwrap();

        let entries = backend.readdir(dir.path()).await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["0-first.txt", "a.txt", "sub"]);

        let sub = &entries[2];
        assert!(sub.is_dir());
        assert_ne!(sub.attr.ino, 0);
    }

    #[tokio::test]
    async fn test_readdir_empty() {
        let (backend, dir) = setup().await;

        let entries = backend.readdir(&dir.path().join("sub")).await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_readdir_keeps_dangling_symlink() {
        let (backend, dir) = setup().await;
        std::os::unix::fs::symlink(dir.path().join("nowhere"), dir.path().join("link")).unwrap();

        let entries = backend.readdir(dir.path()).await.unwrap();
        let link = entries.iter().find(|e| e.name == "link").unwrap();
        assert!(link.kind.is_symlink());
    }

    #[tokio::test]
    async fn test_read_all() {
        let (backend, dir) = setup().await;

        let data = backend.read_all(&dir.path().join("a.txt")).await.unwrap();
        assert_eq!(data, b"hello world!");
    }

    #[tokio::test]
    async fn test_read_all_directory_fails() {
        let (backend, dir) = setup().await;

        assert!(backend.read_all(&dir.path().join("sub")).await.is_err());
    }

    #[tokio::test]
    async fn test_statfs() {
        let (backend, dir) = setup().await;

        let stat = backend.statfs(dir.path()).await.unwrap();
        assert!(stat.blocks > 0);
        assert!(stat.bsize > 0);
        assert!(stat.namelen > 0);
    }

    #[tokio::test]
    async fn test_path_escape_blocked() {
        let (backend, dir) = setup().await;

        let result = backend.getattr(&dir.path().join("../../../etc/passwd")).await;
        assert!(result.is_err());

        let result = backend.read_all(Path::new("/etc/passwd")).await;
        assert!(matches!(result, Err(VfsError::PathEscapesRoot(_))));
    }

    #[tokio::test]
    async fn test_symlink_escape_blocked() {
        let (backend, dir) = setup().await;
        std::os::unix::fs::symlink("/etc", dir.path().join("etc")).unwrap();

        let result = backend.readdir(&dir.path().join("etc")).await;
        assert!(matches!(result, Err(VfsError::PathEscapesRoot(_))));
    }

    #[tokio::test]
    async fn test_relative_path_rejected() {
        let (backend, _dir) = setup().await;

        let result = backend.getattr(Path::new("a.txt")).await;
        assert!(matches!(result, Err(VfsError::InvalidPath(_))));
    }

    #[test]
    fn test_open_requires_directory() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("plain");
        std::fs::write(&file, b"x").unwrap();

        assert!(LocalBackend::open(dir.path()).is_ok());
        assert!(LocalBackend::open(&file).is_err());
        assert!(LocalBackend::open(dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_exported_ino_is_per_device() {
        assert_eq!(exported_ino(Some(7), 7, 1234), 1234);
        assert_eq!(exported_ino(Some(7), 8, 1234), 0);
        assert_eq!(exported_ino(None, 7, 1234), 0);
    }

    #[tokio::test]
    async fn test_same_device_keeps_native_ino() {
        let (backend, dir) = setup().await;
        let native = std::fs::metadata(dir.path().join("a.txt")).unwrap().ino();

        let attr = backend.getattr(&dir.path().join("a.txt")).await.unwrap();
        assert_eq!(attr.ino, native);

        let entries = backend.readdir(dir.path()).await.unwrap();
        assert_eq!(entries[0].attr.ino, native);
    }

    #[tokio::test]
    async fn test_nested_mount_hides_native_ino() {
        let backend = LocalBackend::new("/");
        let root_dev = std::fs::metadata("/").unwrap().dev();

        // Any pseudo filesystem mounted under / will do; skip when none is.
        let Some(nested) = ["/proc", "/sys", "/dev", "/dev/shm", "/run"]
            .into_iter()
            .map(Path::new)
            .find(|p| std::fs::metadata(p).is_ok_and(|m| m.dev() != root_dev))
        else {
            return;
        };

        let attr = backend.getattr(nested).await.unwrap();
        assert_eq!(attr.ino, 0, "{}", nested.display());
        assert!(attr.is_dir());
    }
}
