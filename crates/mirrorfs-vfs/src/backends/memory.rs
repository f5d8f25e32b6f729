//! In-memory filesystem backend.
//!
//! Used for testing and loopback mounts. The tree is built up front and then
//! served read-only; `remove` exists so tests can make entries vanish
//! between two queries.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{VfsError, VfsResult};
use crate::ops::VfsOps;
use crate::types::{DirEntry, FileAttr, StatFs};

/// Entry in the memory filesystem.
#[derive(Debug, Clone)]
enum Entry {
    File { data: Vec<u8>, attr: FileAttr },
    Directory { attr: FileAttr },
}

impl Entry {
    fn attr(&self) -> &FileAttr {
        match self {
            Entry::File { attr, .. } => attr,
            Entry::Directory { attr } => attr,
        }
    }
}

/// In-memory filesystem backend.
///
/// Thread-safe via internal `RwLock`. Paths are absolute; the root is `/`.
/// Every entry gets a synthetic native inode number, the root being 1.
#[derive(Debug)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<PathBuf, Entry>>,
    next_ino: AtomicU64,
    statfs: StatFs,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create a new filesystem holding only the root directory.
    pub fn new() -> Self {
        let mut entries = HashMap::new();
        entries.insert(
            PathBuf::new(),
            Entry::Directory {
                attr: FileAttr::directory("/", 0o755).with_ino(1),
            },
        );
        Self {
            entries: RwLock::new(entries),
            next_ino: AtomicU64::new(2),
            statfs: StatFs::default(),
        }
    }

    /// Add a file, creating parent directories as needed.
    pub fn with_file(self, path: impl AsRef<Path>, data: impl Into<Vec<u8>>) -> Self {
        self.insert_file(path, data);
        self
    }

    /// Add a directory, creating parent directories as needed.
    pub fn with_dir(self, path: impl AsRef<Path>) -> Self {
        self.insert_dir(path);
        self
    }

    /// Replace the statistics returned by `statfs`.
    pub fn with_statfs(mut self, statfs: StatFs) -> Self {
        self.statfs = statfs;
        self
    }

    /// Insert or replace a file.
    pub fn insert_file(&self, path: impl AsRef<Path>, data: impl Into<Vec<u8>>) {
        let normalized = Self::normalize(path.as_ref());
        let data = data.into();
        let attr = FileAttr::file(Self::name_of(&normalized), data.len() as u64, 0o644)
            .with_ino(self.alloc_ino());

        let mut entries = self.write_entries();
        Self::ensure_parents(&mut entries, &normalized, &self.next_ino);
        entries.insert(normalized, Entry::File { data, attr });
    }

    /// Insert a directory if it does not exist yet.
    pub fn insert_dir(&self, path: impl AsRef<Path>) {
        let normalized = Self::normalize(path.as_ref());
        let mut entries = self.write_entries();
        Self::ensure_parents(&mut entries, &normalized, &self.next_ino);
        if !entries.contains_key(&normalized) {
            let attr = FileAttr::directory(Self::name_of(&normalized), 0o755)
                .with_ino(self.next_ino.fetch_add(1, Ordering::Relaxed));
            entries.insert(normalized, Entry::Directory { attr });
        }
    }

    /// Remove an entry and everything below it. Returns false if absent.
    pub fn remove(&self, path: impl AsRef<Path>) -> bool {
        let normalized = Self::normalize(path.as_ref());
        if normalized.as_os_str().is_empty() {
            return false;
        }
        let mut entries = self.write_entries();
        let existed = entries.remove(&normalized).is_some();
        entries.retain(|p, _| !p.starts_with(&normalized));
        existed
    }

    fn alloc_ino(&self) -> u64 {
        self.next_ino.fetch_add(1, Ordering::Relaxed)
    }

    // Writers only run from test setup; a poisoned lock is recovered.
    fn write_entries(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<PathBuf, Entry>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Normalize a path: remove leading `/`, resolve `.` and `..`.
    fn normalize(path: &Path) -> PathBuf {
        let mut result = PathBuf::new();
        for component in path.components() {
            match component {
                Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
                Component::ParentDir => {
                    result.pop();
                }
                Component::Normal(s) => result.push(s),
            }
        }
        result
    }

    fn name_of(normalized: &Path) -> String {
        normalized
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "/".to_string())
    }

    /// Ensure all parent directories exist.
    fn ensure_parents(entries: &mut HashMap<PathBuf, Entry>, path: &Path, next_ino: &AtomicU64) {
        let mut current = PathBuf::new();
        for component in path.parent().into_iter().flat_map(|p| p.components()) {
            if let Component::Normal(s) = component {
                current.push(s);
                entries.entry(current.clone()).or_insert_with(|| Entry::Directory {
                    attr: FileAttr::directory(s.to_string_lossy(), 0o755)
                        .with_ino(next_ino.fetch_add(1, Ordering::Relaxed)),
                });
            }
        }
    }

    /// Validate a request path and look up its entry.
    fn lookup(&self, path: &Path) -> VfsResult<(PathBuf, Entry)> {
        if !path.is_absolute() {
            return Err(VfsError::invalid_path(path.display().to_string()));
        }
        let normalized = Self::normalize(path);
        let entries = self
            .entries
            .read()
            .map_err(|_| VfsError::other("lock poisoned"))?;
        entries
            .get(&normalized)
            .cloned()
            .map(|e| (normalized, e))
            .ok_or_else(|| VfsError::not_found(path.display().to_string()))
    }
}

#[async_trait]
impl VfsOps for MemoryBackend {
    async fn statfs(&self, path: &Path) -> VfsResult<StatFs> {
        self.lookup(path)?;
        Ok(self.statfs.clone())
    }

    async fn getattr(&self, path: &Path) -> VfsResult<FileAttr> {
        let (_, entry) = self.lookup(path)?;
        Ok(entry.attr().clone())
    }

    async fn readdir(&self, path: &Path) -> VfsResult<Vec<DirEntry>> {
        let (dir, entry) = self.lookup(path)?;
        if !matches!(entry, Entry::Directory { .. }) {
            return Err(VfsError::not_a_directory(path.display().to_string()));
        }

        let entries = self
            .entries
            .read()
            .map_err(|_| VfsError::other("lock poisoned"))?;

        let mut result: Vec<DirEntry> = entries
            .iter()
            .filter(|(p, _)| !p.as_os_str().is_empty() && p.parent() == Some(dir.as_path()))
            .map(|(_, e)| DirEntry::new(e.attr().clone()))
            .collect();

        result.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(result)
    }

    async fn read_all(&self, path: &Path) -> VfsResult<Vec<u8>> {
        match self.lookup(path)? {
            (_, Entry::File { data, .. }) => Ok(data),
            (_, Entry::Directory { .. }) => {
                Err(VfsError::is_a_directory(path.display().to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MemoryBackend {
        MemoryBackend::new()
            .with_file("/a.txt", b"hello world!".to_vec())
            .with_file("/docs/readme.md", b"# hi".to_vec())
            .with_dir("/empty")
    }

    #[tokio::test]
    async fn test_root_attr() {
        let fs = sample();
        let attr = fs.getattr(Path::new("/")).await.unwrap();
        assert!(attr.is_dir());
        assert_eq!(attr.ino, 1);
    }

    #[tokio::test]
    async fn test_parents_created() {
        let fs = sample();
        let attr = fs.getattr(Path::new("/docs")).await.unwrap();
        assert!(attr.is_dir());
        assert_eq!(attr.name, "docs");
    }

    #[tokio::test]
    async fn test_readdir_sorted_and_direct_children_only() {
        let fs = sample();
        let entries = fs.readdir(Path::new("/")).await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "docs", "empty"]);
    }

    #[tokio::test]
    async fn test_readdir_file_fails() {
        let fs = sample();
        let err = fs.readdir(Path::new("/a.txt")).await.unwrap_err();
        assert!(matches!(err, VfsError::NotADirectory(_)));
    }

    #[tokio::test]
    async fn test_read_all() {
        let fs = sample();
        let data = fs.read_all(Path::new("/docs/readme.md")).await.unwrap();
        assert_eq!(data, b"# hi");
        assert!(fs.read_all(Path::new("/docs")).await.is_err());
    }

    #[tokio::test]
    async fn test_distinct_inos() {
        let fs = sample();
        let a = fs.getattr(Path::new("/a.txt")).await.unwrap();
        let b = fs.getattr(Path::new("/docs/readme.md")).await.unwrap();
        assert_ne!(a.ino, b.ino);
        assert!(a.ino > 1 && b.ino > 1);
    }

    #[tokio::test]
    async fn test_remove_subtree() {
        let fs = sample();
        assert!(fs.remove("/docs"));
        assert!(fs.getattr(Path::new("/docs/readme.md")).await.unwrap_err().is_not_found());
        assert!(!fs.remove("/docs"));
        assert!(!fs.remove("/"));
    }

    #[tokio::test]
    async fn test_relative_path_rejected() {
        let fs = sample();
        let err = fs.getattr(Path::new("a.txt")).await.unwrap_err();
        assert!(matches!(err, VfsError::InvalidPath(_)));
    }

    #[tokio::test]
    async fn test_statfs_configurable() {
        let stat = StatFs {
            blocks: 10,
            ..StatFs::default()
        };
        let fs = MemoryBackend::new().with_statfs(stat.clone());
        assert_eq!(fs.statfs(Path::new("/")).await.unwrap(), stat);
        assert!(fs.statfs(Path::new("/nope")).await.is_err());
    }
}
