//! Path-based filesystem operations over the index and the bucket
//!
//! [`BucketFs`] is what the kernel transport talks to. Metadata calls are
//! served from the index alone; content calls go through open sessions
//! and reach the bucket only on open and flush.

pub mod capabilities;

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, error, trace};

use crate::attr::{FileAttributes, NodeKind, Owner, BLOCK_SIZE};
use crate::error::{FestivusError, Result};
use crate::index::MetadataIndex;
use crate::indexer::{BulkIndexer, IndexReport};
use crate::keys::{self, KeySpace};
use crate::lister::{DirEntry, DirectoryLister};
use crate::resolver::AttributeResolver;
use crate::session::{SessionHandle, SessionManager};
use crate::store::{BlobStore, ObjectInfo};

pub use self::capabilities::{Capabilities, Operation};

/// Longest file name reported by `statfs`
pub const NAME_MAX: u32 = 255;

/// Filesystem totals reported by `statfs`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

impl StatFs {
    /// A bucket has no fixed capacity; report everything as free
    pub fn synthetic() -> Self {
        Self {
            blocks: u64::MAX,
            bfree: u64::MAX,
            bavail: u64::MAX,
            files: u64::MAX,
            ffree: u64::MAX,
            bsize: BLOCK_SIZE as u32,
            namelen: NAME_MAX,
            frsize: BLOCK_SIZE as u32,
        }
    }
}

/// Filesystem over one bucket and one index namespace
pub struct BucketFs {
    resolver: AttributeResolver,
    lister: DirectoryLister,
    sessions: SessionManager,
    indexer: BulkIndexer,
    capabilities: Capabilities,
}

impl BucketFs {
    pub fn new(
        index: Arc<dyn MetadataIndex>,
        store: Arc<dyn BlobStore>,
        keys: KeySpace,
        owner: Owner,
        read_only: bool,
    ) -> Self {
        let capabilities = if read_only {
            Capabilities::read_only()
        } else {
            Capabilities::full()
        };

        Self {
            resolver: AttributeResolver::new(index.clone(), keys.clone(), owner),
            lister: DirectoryLister::new(index.clone(), keys.clone()),
            sessions: SessionManager::new(store.clone()),
            indexer: BulkIndexer::new(index, store, keys),
            capabilities,
        }
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Refuse operations this mount does not serve
    pub fn check(&self, op: Operation) -> Result<()> {
        self.capabilities.check(op).map_err(|e| {
            debug!("{} refused: {}", op, e);
            e
        })
    }

    pub async fn getattr(&self, path: &str) -> Result<FileAttributes> {
        trace!("getattr {}", path);
        self.resolver.resolve(path).await
    }

    pub async fn readdir(&self, path: &str) -> Result<Vec<DirEntry>> {
        trace!("readdir {}", path);
        self.lister.entries(path).await
    }

    /// Open a file; `write` requests a writable session
    pub async fn open(&self, path: &str, write: bool) -> Result<SessionHandle> {
        self.check(Operation::Open)?;
        if write {
            self.check(Operation::Write)?;
        }

        let (kind, _) = self.resolver.lookup(path).await?;
        if kind == NodeKind::Directory {
            return Err(FestivusError::IsADirectory(path.to_string()));
        }
        self.sessions.open(path).await
    }

    pub async fn read(&self, path: &str, size: u32, offset: u64) -> Result<Bytes> {
        self.check(Operation::Read)?;
        self.sessions.read(path, size, offset).await
    }

    pub async fn write(&self, path: &str, data: &[u8], offset: u64) -> Result<u64> {
        self.check(Operation::Write)?;
        self.sessions.write(path, data, offset).await
    }

    /// Upload pending writes and bring the index up to date with them
    pub async fn flush(&self, path: &str) -> Result<()> {
        self.check(Operation::Flush)?;
        if let Some(uploaded) = self.sessions.flush(path).await? {
            self.record_upload(path, uploaded.size).await;
        }
        Ok(())
    }

    /// Close one handle; the session goes away with its last handle
    pub async fn release(&self, path: &str, handle: SessionHandle) -> Result<()> {
        self.check(Operation::Release)?;
        self.sessions.release(path, handle).await;
        Ok(())
    }

    /// Resize a file.
    ///
    /// An open session is resized in place and uploaded on its next
    /// flush. Without one, the object is fetched, resized and uploaded
    /// immediately.
    pub async fn truncate(&self, path: &str, size: u64) -> Result<()> {
        self.check(Operation::Truncate)?;
        if self.sessions.is_open(path) {
            return self.sessions.truncate(path, size).await;
        }

        debug!("truncate {} to {} without a session", path, size);
        let handle = self.open(path, true).await?;
        let result = async {
            self.sessions.truncate(path, size).await?;
            self.flush(path).await
        }
        .await;
        self.sessions.release(path, handle).await;
        result
    }

    pub async fn fsync(&self, path: &str) -> Result<()> {
        self.check(Operation::Fsync)?;
        self.flush(path).await
    }

    pub fn statfs(&self) -> Result<StatFs> {
        self.check(Operation::Statfs)?;
        Ok(StatFs::synthetic())
    }

    /// Rebuild the index from a full bucket listing
    pub async fn reindex(&self) -> Result<IndexReport> {
        self.indexer.reindex().await
    }

    /// Record a completed upload so attributes reflect it.
    ///
    /// The content is already durable at this point; a failure here only
    /// leaves the index stale until the next bulk index, so it is logged
    /// rather than reported as a failed write.
    async fn record_upload(&self, path: &str, size: u64) {
        let now = Utc::now();
        let created = match self.resolver.lookup(path).await {
            Ok((NodeKind::File, record)) => {
                DateTime::from_timestamp(record.ctime, 0).unwrap_or(now)
            }
            _ => now,
        };

        let object = ObjectInfo {
            name: keys::object_name(path).to_string(),
            size,
            created,
            updated: now,
        };
        if let Err(e) = self.indexer.index_object(&object).await {
            error!("index update after flush of {} failed: {}", path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::MemoryIndex;
    use crate::store::MemoryStore;
    use tokio_test::assert_ok;

    const OWNER: Owner = Owner { uid: 1, gid: 1 };

    async fn indexed_fs(
        files: &[(&str, &str)],
        read_only: bool,
    ) -> (Arc<MemoryIndex>, Arc<MemoryStore>, BucketFs) {
        let index = Arc::new(MemoryIndex::new());
        let store = Arc::new(MemoryStore::new());
        let then = DateTime::from_timestamp(1_000, 0).unwrap();
        for (name, data) in files {
            store.insert(*name, data.to_string(), then, then);
        }
        let fs = BucketFs::new(index.clone(), store.clone(), KeySpace::new(""), OWNER, read_only);
        fs.reindex().await.unwrap();
        (index, store, fs)
    }

    #[tokio::test]
    async fn test_getattr_and_readdir() {
        let (_, _, fs) = indexed_fs(&[("docs/a.txt", "hello")], false).await;

        assert!(fs.getattr("/").await.unwrap().is_dir());
        assert!(fs.getattr("/docs").await.unwrap().is_dir());
        assert_eq!(fs.getattr("/docs/a.txt").await.unwrap().size, 5);

        let entries = fs.readdir("/docs").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "a.txt");
    }

    #[tokio::test]
    async fn test_open_directory_fails() {
        let (_, _, fs) = indexed_fs(&[("docs/a.txt", "hello")], false).await;
        let err = fs.open("/docs", false).await.unwrap_err();
        assert!(matches!(err, FestivusError::IsADirectory(_)));
    }

    #[tokio::test]
    async fn test_flush_refreshes_index() {
        let (_, _, fs) = indexed_fs(&[("notes.txt", "abc")], false).await;

        let handle = fs.open("/notes.txt", true).await.unwrap();
        fs.write("/notes.txt", b"abcdefgh", 0).await.unwrap();
        fs.flush("/notes.txt").await.unwrap();
        fs.release("/notes.txt", handle).await.unwrap();

        let attrs = fs.getattr("/notes.txt").await.unwrap();
        assert_eq!(attrs.size, 8);
        assert_eq!(attrs.ctime, 1_000);
        assert!(attrs.mtime > 1_000);

        // The parent's modification time follows the write
        assert!(fs.getattr("/").await.unwrap().mtime >= attrs.mtime);
    }

    #[tokio::test]
    async fn test_truncate_without_session_uploads() {
        let (_, store, fs) = indexed_fs(&[("f.bin", "0123456789")], false).await;

        fs.truncate("/f.bin", 4).await.unwrap();
        assert_eq!(store.get_object("f.bin").await.unwrap(), "0123");
        assert_eq!(fs.getattr("/f.bin").await.unwrap().size, 4);
        assert!(fs.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_truncate_open_session_defers_upload() {
        let (_, store, fs) = indexed_fs(&[("f.bin", "0123456789")], false).await;

        fs.open("/f.bin", true).await.unwrap();
        fs.truncate("/f.bin", 2).await.unwrap();
        assert_eq!(store.get_object("f.bin").await.unwrap(), "0123456789");

        assert_ok!(fs.fsync("/f.bin").await);
        assert_eq!(store.get_object("f.bin").await.unwrap(), "01");
    }

    #[tokio::test]
    async fn test_closing_reader_keeps_writer_session() {
        let (_, store, fs) = indexed_fs(&[("f.txt", "orig")], false).await;

        let reader = fs.open("/f.txt", false).await.unwrap();
        let writer = fs.open("/f.txt", true).await.unwrap();
        fs.write("/f.txt", b"NEW DATA", 0).await.unwrap();
        fs.release("/f.txt", reader).await.unwrap();

        assert_ok!(fs.flush("/f.txt").await);
        assert_eq!(store.get_object("f.txt").await.unwrap(), "NEW DATA");
        assert_eq!(fs.getattr("/f.txt").await.unwrap().size, 8);

        fs.release("/f.txt", writer).await.unwrap();
        assert!(fs.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_truncate_past_size_limit() {
        let (_, store, fs) = indexed_fs(&[("f.bin", "0123")], false).await;

        let err = fs.truncate("/f.bin", u64::MAX).await.unwrap_err();
        assert_eq!(err.to_errno(), libc::EFBIG);
        assert_eq!(store.get_object("f.bin").await.unwrap(), "0123");
        assert!(fs.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_read_only_mount() {
        let (_, _, fs) = indexed_fs(&[("f.txt", "ro")], true).await;

        assert!(matches!(
            fs.open("/f.txt", true).await,
            Err(FestivusError::ReadOnly)
        ));
        fs.open("/f.txt", false).await.unwrap();
        assert_eq!(fs.read("/f.txt", 10, 0).await.unwrap(), "ro");
        assert!(matches!(
            fs.write("/f.txt", b"x", 0).await,
            Err(FestivusError::ReadOnly)
        ));
        assert!(matches!(
            fs.truncate("/f.txt", 0).await,
            Err(FestivusError::ReadOnly)
        ));
        assert_ok!(fs.flush("/f.txt").await);
    }

    #[tokio::test]
    async fn test_statfs_is_synthetic() {
        let (_, _, fs) = indexed_fs(&[], false).await;
        let stats = fs.statfs().unwrap();
        assert_eq!(stats.bsize, 256);
        assert_eq!(stats.namelen, NAME_MAX);
        assert_eq!(stats.bfree, u64::MAX);
    }

    #[tokio::test]
    async fn test_index_failure_after_upload_still_succeeds() {
        let (index, store, fs) = indexed_fs(&[("f.txt", "a")], false).await;
        fs.open("/f.txt", true).await.unwrap();
        fs.write("/f.txt", b"b", 0).await.unwrap();

        index.set_unavailable(true);
        assert_ok!(fs.flush("/f.txt").await);
        assert_eq!(store.get_object("f.txt").await.unwrap(), "b");
    }
}
