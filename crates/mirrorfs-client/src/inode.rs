//! Inode table: kernel identifiers ↔ remote paths.
//!
//! The kernel names every object by a 64-bit identifier; the server only
//! understands paths. The table hands out identifiers lazily as names are
//! resolved, and keeps no tree: a child's path is its parent's path joined
//! with the name.
//!
//! Identity comes from the server's native inode number whenever it has one,
//! so hard links and repeated lookups of one object land on one identifier.
//! Objects without a native number get an identifier minted from a counter
//! starting at [`SYNTHETIC_INODE_BASE`], keyed by path.
//!
//! A record keeps the path it was first resolved under. When a second path
//! reports the same native inode (a hard link, or a rename seen before the
//! kernel forgot the old name) the existing record wins and a warning is
//! logged; operations on that identifier keep addressing the first path,
//! and fail once it no longer exists on the server.
//!
//! No lock is held across a remote call. Two resolutions racing for the
//! same object both stat it, then converge in a single atomic
//! insert-if-absent. A minted identifier is only inserted while its path
//! mapping still points at it, checked under the same shard lock that
//! [`InodeTable::forget`] evicts under.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use mirrorfs_vfs::{FileAttr, VfsError, VfsOps};

use crate::constants::{ROOT_INODE, SYNTHETIC_INODE_BASE};

/// One known filesystem object.
///
/// Immutable after creation apart from its kernel lookup count.
#[derive(Debug)]
pub struct InodeRecord {
    id: u64,
    path: PathBuf,
    lookups: AtomicU64,
}

impl InodeRecord {
    fn new(id: u64, path: PathBuf) -> Self {
        Self {
            id,
            path,
            lookups: AtomicU64::new(0),
        }
    }

    /// Kernel-visible identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Absolute remote path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Outstanding kernel lookups.
    pub fn lookup_count(&self) -> u64 {
        self.lookups.load(Ordering::Acquire)
    }

    /// Subtract `n` lookups, saturating at zero. Returns the new count.
    fn release(&self, n: u64) -> u64 {
        let previous = self
            .lookups
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                Some(c.saturating_sub(n))
            })
            .unwrap_or(0);
        previous.saturating_sub(n)
    }
}

/// Why a (parent, name) pair did not resolve.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("unknown parent inode {0}")]
    UnknownParent(u64),
    #[error("invalid name {0:?}")]
    InvalidName(String),
    /// The remote stat failed; usually the entry vanished.
    #[error("stat failed: {0}")]
    Stat(#[from] VfsError),
}

/// A successful resolution: the record and the attributes fetched for it.
pub type Resolved = (Arc<InodeRecord>, FileAttr);

/// Concurrent identifier registry for one mount session.
#[derive(Debug)]
pub struct InodeTable {
    root: Arc<InodeRecord>,
    records: DashMap<u64, Arc<InodeRecord>>,
    /// Minted identifiers for objects without a native inode number.
    synthetic: DashMap<PathBuf, u64>,
    next_id: AtomicU64,
}

impl InodeTable {
    /// Create a table holding only the root record.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = Arc::new(InodeRecord::new(ROOT_INODE, root.into()));
        let records = DashMap::new();
        records.insert(ROOT_INODE, root.clone());
        Self {
            root,
            records,
            synthetic: DashMap::new(),
            next_id: AtomicU64::new(SYNTHETIC_INODE_BASE),
        }
    }

    /// The mount root record.
    pub fn root(&self) -> Arc<InodeRecord> {
        self.root.clone()
    }

    /// Direct, non-creating lookup.
    pub fn get(&self, id: u64) -> Option<Arc<InodeRecord>> {
        self.records.get(&id).map(|r| r.value().clone())
    }

    /// Number of live records, root included.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Resolve `name` under `parent`, creating a record on first sight.
    ///
    /// Does not count as a kernel lookup; used for directory listings.
    pub async fn resolve(
        &self,
        parent: u64,
        name: &OsStr,
        backend: &dyn VfsOps,
    ) -> Result<Resolved, ResolveError> {
        self.resolve_inner(parent, name, backend, false).await
    }

    /// Resolve on behalf of a kernel lookup, bumping the lookup count.
    pub async fn lookup(
        &self,
        parent: u64,
        name: &OsStr,
        backend: &dyn VfsOps,
    ) -> Result<Resolved, ResolveError> {
        self.resolve_inner(parent, name, backend, true).await
    }

    async fn resolve_inner(
        &self,
        parent: u64,
        name: &OsStr,
        backend: &dyn VfsOps,
        counted: bool,
    ) -> Result<Resolved, ResolveError> {
        let parent = self.get(parent).ok_or(ResolveError::UnknownParent(parent))?;
        validate_name(name)?;
        let path = parent.path.join(name);

        // Remote call outside any table lock.
        let attr = backend.getattr(&path).await?;

        let record = loop {
            let (id, minted) = self.identity_for(&path, attr.ino);
            let entry = self.records.entry(id);
            // forget() may have retired this id since identity_for; mint again.
            if minted && self.synthetic.get(&path).map(|m| *m) != Some(id) {
                continue;
            }
            let entry = entry.or_insert_with(|| Arc::new(InodeRecord::new(id, path.clone())));
            // Counted under the shard lock so forget() can't evict in between.
            if counted {
                entry.lookups.fetch_add(1, Ordering::AcqRel);
            }
            break entry.value().clone();
        };

        if record.path != path {
            tracing::warn!(
                id = record.id,
                bound = %record.path.display(),
                resolved = %path.display(),
                "inode already bound to another path, keeping the first"
            );
        }

        Ok((record, attr))
    }

    /// Identifier for `path`, and whether it came from the synthetic counter.
    fn identity_for(&self, path: &Path, native: u64) -> (u64, bool) {
        if native != 0 && native != ROOT_INODE && native < SYNTHETIC_INODE_BASE {
            return (native, false);
        }
        let id = *self
            .synthetic
            .entry(path.to_path_buf())
            .or_insert_with(|| self.next_id.fetch_add(1, Ordering::Relaxed));
        (id, true)
    }

    /// Drop `nlookup` kernel references; evict the record at zero.
    ///
    /// The root is never evicted and unknown identifiers are ignored.
    pub fn forget(&self, id: u64, nlookup: u64) {
        if id == ROOT_INODE {
            return;
        }
        let Entry::Occupied(entry) = self.records.entry(id) else {
            return;
        };
        if entry.get().release(nlookup) > 0 {
            return;
        }
        // Still under the shard lock, so no resolve can re-insert this id
        // between dropping the mapping and the record.
        self.synthetic
            .remove_if(&entry.get().path, |_, minted| *minted == id);
        let (_, record) = entry.remove_entry();
        tracing::trace!(id, path = %record.path.display(), "evicted inode");
    }
}

fn validate_name(name: &OsStr) -> Result<(), ResolveError> {
    let bytes = name.as_encoded_bytes();
    if bytes.is_empty() || name == "." || name == ".." || bytes.contains(&b'/') {
        return Err(ResolveError::InvalidName(name.to_string_lossy().into_owned()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mirrorfs_vfs::{DirEntry, MemoryBackend, StatFs, VfsResult};

    fn sample() -> MemoryBackend {
        MemoryBackend::new()
            .with_file("/data/a.txt", b"hello world!".to_vec())
            .with_dir("/data/sub")
    }

    /// Strips native inode numbers, as a platform without them would.
    struct NoInodes(MemoryBackend);

    #[async_trait]
    impl VfsOps for NoInodes {
        async fn statfs(&self, path: &Path) -> VfsResult<StatFs> {
            self.0.statfs(path).await
        }

        async fn getattr(&self, path: &Path) -> VfsResult<FileAttr> {
            Ok(self.0.getattr(path).await?.with_ino(0))
        }

        async fn readdir(&self, path: &Path) -> VfsResult<Vec<DirEntry>> {
            self.0.readdir(path).await
        }

        async fn read_all(&self, path: &Path) -> VfsResult<Vec<u8>> {
            self.0.read_all(path).await
        }
    }

    #[tokio::test]
    async fn test_resolve_uses_native_inode() {
        let backend = sample();
        let table = InodeTable::new("/data");
        let native = backend.getattr(Path::new("/data/a.txt")).await.unwrap().ino;

        let (record, attr) = table
            .resolve(ROOT_INODE, OsStr::new("a.txt"), &backend)
            .await
            .unwrap();
        assert_eq!(record.id(), native);
        assert_eq!(record.path(), Path::new("/data/a.txt"));
        assert_eq!(attr.size, 12);
        assert_eq!(record.lookup_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_resolves_converge() {
        let backend = sample();
        let table = InodeTable::new("/data");

        let (a, b) = tokio::join!(
            table.lookup(ROOT_INODE, OsStr::new("a.txt"), &backend),
            table.lookup(ROOT_INODE, OsStr::new("a.txt"), &backend),
        );
        let (a, _) = a.unwrap();
        let (b, _) = b.unwrap();

        assert_eq!(a.id(), b.id());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(table.len(), 2);
        assert_eq!(a.lookup_count(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_resolves_converge_across_threads() {
        let backend = Arc::new(sample());
        let table = Arc::new(InodeTable::new("/data"));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let backend = backend.clone();
            let table = table.clone();
            tasks.push(tokio::spawn(async move {
                let (record, _) = table
                    .lookup(ROOT_INODE, OsStr::new("sub"), backend.as_ref())
                    .await
                    .unwrap();
                record.id()
            }));
        }

        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(ids[0]).unwrap().lookup_count(), 16);
    }

    #[tokio::test]
    async fn test_synthetic_ids_when_no_native_inode() {
        let backend = NoInodes(sample());
        let table = InodeTable::new("/data");

        let (a, _) = table
            .resolve(ROOT_INODE, OsStr::new("a.txt"), &backend)
            .await
            .unwrap();
        let (sub, _) = table
            .resolve(ROOT_INODE, OsStr::new("sub"), &backend)
            .await
            .unwrap();
        let (again, _) = table
            .resolve(ROOT_INODE, OsStr::new("a.txt"), &backend)
            .await
            .unwrap();

        assert!(a.id() >= SYNTHETIC_INODE_BASE);
        assert!(sub.id() >= SYNTHETIC_INODE_BASE);
        assert_ne!(a.id(), sub.id());
        assert_eq!(a.id(), again.id());
    }

    /// Reports one native inode for every regular file, like hard links.
    struct SharedInode(MemoryBackend);

    #[async_trait]
    impl VfsOps for SharedInode {
        async fn statfs(&self, path: &Path) -> VfsResult<StatFs> {
            self.0.statfs(path).await
        }

        async fn getattr(&self, path: &Path) -> VfsResult<FileAttr> {
            let attr = self.0.getattr(path).await?;
            Ok(if attr.is_file() { attr.with_ino(4242) } else { attr })
        }

        async fn readdir(&self, path: &Path) -> VfsResult<Vec<DirEntry>> {
            self.0.readdir(path).await
        }

        async fn read_all(&self, path: &Path) -> VfsResult<Vec<u8>> {
            self.0.read_all(path).await
        }
    }

    #[tokio::test]
    async fn test_shared_native_inode_keeps_first_path() {
        let backend = SharedInode(sample());
        let table = InodeTable::new("/data");

        let (first, _) = table
            .lookup(ROOT_INODE, OsStr::new("a.txt"), &backend)
            .await
            .unwrap();

        // Renamed on the server while the kernel still holds the old name
        backend.0.remove("/data/a.txt");
        backend.0.insert_file("/data/b.txt", b"hello world!".to_vec());

        let (second, attr) = table
            .lookup(ROOT_INODE, OsStr::new("b.txt"), &backend)
            .await
            .unwrap();
        assert_eq!(attr.name, "b.txt");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.id(), 4242);
        assert_eq!(second.path(), Path::new("/data/a.txt"));
        assert_eq!(second.lookup_count(), 2);
        assert_eq!(table.len(), 2);

        // Once the kernel lets go, the new name gets its own binding
        table.forget(4242, 2);
        let (fresh, _) = table
            .lookup(ROOT_INODE, OsStr::new("b.txt"), &backend)
            .await
            .unwrap();
        assert_eq!(fresh.path(), Path::new("/data/b.txt"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_synthetic_ids_survive_lookup_forget_races() {
        let backend = Arc::new(NoInodes(sample()));
        let table = Arc::new(InodeTable::new("/data"));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let backend = backend.clone();
            let table = table.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..200 {
                    let (record, _) = table
                        .lookup(ROOT_INODE, OsStr::new("a.txt"), backend.as_ref())
                        .await
                        .unwrap();
                    // Every live minted id must be reachable from its path
                    let mapped = table.synthetic.get(record.path()).map(|m| *m);
                    assert!(mapped.is_some());
                    table.forget(record.id(), 1);
                    tokio::task::yield_now().await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        // Balanced lookups and forgets leave nothing behind
        assert_eq!(table.len(), 1);
        assert!(table.synthetic.is_empty());

        let (a, _) = table
            .lookup(ROOT_INODE, OsStr::new("a.txt"), backend.as_ref())
            .await
            .unwrap();
        let (again, _) = table
            .lookup(ROOT_INODE, OsStr::new("a.txt"), backend.as_ref())
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&a, &again));
        assert_eq!(table.synthetic.get(a.path()).map(|m| *m), Some(a.id()));
    }

    #[tokio::test]
    async fn test_missing_name() {
        let backend = sample();
        let table = InodeTable::new("/data");

        let err = table
            .lookup(ROOT_INODE, OsStr::new("missing.txt"), &backend)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Stat(e) if e.is_not_found()));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_parent() {
        let backend = sample();
        let table = InodeTable::new("/data");

        let err = table
            .lookup(9999, OsStr::new("a.txt"), &backend)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::UnknownParent(9999)));
        assert!(table.get(9999).is_none());
    }

    #[tokio::test]
    async fn test_invalid_names() {
        let backend = sample();
        let table = InodeTable::new("/data");

        for name in ["", ".", "..", "a/b"] {
            let err = table
                .lookup(ROOT_INODE, OsStr::new(name), &backend)
                .await
                .unwrap_err();
            assert!(matches!(err, ResolveError::InvalidName(_)), "{name:?}");
        }
    }

    #[tokio::test]
    async fn test_nested_paths_join() {
        let backend = MemoryBackend::new().with_file("/data/sub/deep.txt", b"x".to_vec());
        let table = InodeTable::new("/data");

        let (sub, _) = table
            .lookup(ROOT_INODE, OsStr::new("sub"), &backend)
            .await
            .unwrap();
        let (deep, attr) = table
            .lookup(sub.id(), OsStr::new("deep.txt"), &backend)
            .await
            .unwrap();
        assert_eq!(deep.path(), Path::new("/data/sub/deep.txt"));
        assert_eq!(attr.size, 1);
    }

    #[tokio::test]
    async fn test_forget_evicts_at_zero() {
        let backend = sample();
        let table = InodeTable::new("/data");

        let (record, _) = table
            .lookup(ROOT_INODE, OsStr::new("a.txt"), &backend)
            .await
            .unwrap();
        table
            .lookup(ROOT_INODE, OsStr::new("a.txt"), &backend)
            .await
            .unwrap();
        let id = record.id();

        table.forget(id, 1);
        assert!(table.get(id).is_some());
        table.forget(id, 1);
        assert!(table.get(id).is_none());

        // Forgetting again, or something never seen, is harmless.
        table.forget(id, 1);
        table.forget(424242, 3);
    }

    #[tokio::test]
    async fn test_forget_synthetic_reissues_id() {
        let backend = NoInodes(sample());
        let table = InodeTable::new("/data");

        let (first, _) = table
            .lookup(ROOT_INODE, OsStr::new("a.txt"), &backend)
            .await
            .unwrap();
        table.forget(first.id(), 1);
        assert!(table.get(first.id()).is_none());

        let (second, _) = table
            .lookup(ROOT_INODE, OsStr::new("a.txt"), &backend)
            .await
            .unwrap();
        assert_ne!(first.id(), second.id());
        assert!(table.get(second.id()).is_some());
    }

    #[test]
    fn test_root_never_evicted() {
        let table = InodeTable::new("/data");
        table.forget(ROOT_INODE, u64::MAX);
        assert_eq!(table.root().path(), Path::new("/data"));
        assert_eq!(table.root().id(), ROOT_INODE);
    }
}
