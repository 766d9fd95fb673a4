//! Open file sessions
//!
//! Objects can only be fetched and stored whole, so an open file is a
//! full in-memory copy of its object. Reads and writes operate on that
//! buffer; `flush` uploads it if it changed; `release` drops it.
//!
//! Sessions are keyed by path. Each path has its own async lock, so
//! operations on one path are serialized while different paths proceed
//! independently. Several handles may share one session; it is dropped
//! when the last of them is released.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, trace, warn};

use crate::error::{FestivusError, Result};
use crate::keys;
use crate::store::{content_type_for, BlobStore};

/// Largest object a session may grow to, the single-request upload limit
pub const MAX_OBJECT_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Identifier handed to the transport for an open session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub u64);

/// Buffered content of one open path
#[derive(Debug)]
struct FileSession {
    buffer: BytesMut,
    dirty: bool,
    handles: HashSet<SessionHandle>,
}

impl FileSession {
    fn new(data: Bytes) -> Self {
        Self {
            buffer: BytesMut::from(&data[..]),
            dirty: false,
            handles: HashSet::new(),
        }
    }
}

/// Per-path slot; `None` until the content has been fetched
type Slot = Arc<Mutex<Option<FileSession>>>;

/// Buffer end of an `len`-byte access at `offset`, bounded by [`MAX_OBJECT_SIZE`]
fn buffer_end(path: &str, offset: u64, len: u64) -> Result<usize> {
    offset
        .checked_add(len)
        .filter(|end| *end <= MAX_OBJECT_SIZE)
        .and_then(|end| usize::try_from(end).ok())
        .ok_or_else(|| {
            FestivusError::FileTooLarge(format!(
                "{} cannot extend past {} bytes (offset={} len={})",
                path, MAX_OBJECT_SIZE, offset, len
            ))
        })
}

/// Result of a flush that uploaded content
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Uploaded {
    pub size: u64,
}

/// Owns every open session
pub struct SessionManager {
    store: Arc<dyn BlobStore>,
    sessions: DashMap<String, Slot>,
    next_handle: AtomicU64,
}

impl SessionManager {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            sessions: DashMap::new(),
            next_handle: AtomicU64::new(1),
        }
    }

    fn slot(&self, path: &str) -> Slot {
        self.sessions
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Lock the slot currently registered for `path`.
    ///
    /// A slot removed by a concurrent last release is detached from the
    /// map, so locking is retried until the locked slot is the live one.
    async fn lock_slot(&self, path: &str) -> (Slot, OwnedMutexGuard<Option<FileSession>>) {
        loop {
            let slot = self.slot(path);
            let guard = slot.clone().lock_owned().await;
            let live = self
                .sessions
                .get(path)
                .map(|current| Arc::ptr_eq(current.value(), &slot))
                .unwrap_or(false);
            if live {
                return (slot, guard);
            }
        }
    }

    fn next_handle(&self) -> SessionHandle {
        SessionHandle(self.next_handle.fetch_add(1, Ordering::SeqCst))
    }

    fn existing_slot(&self, path: &str) -> Result<Slot> {
        self.sessions
            .get(path)
            .map(|slot| slot.clone())
            .ok_or_else(|| FestivusError::NoSession(path.to_string()))
    }

    /// Drop an empty slot left behind by a failed fetch
    fn discard_if_empty(&self, path: &str, slot: &Slot, session: &Option<FileSession>) {
        if session.is_none() {
            self.sessions
                .remove_if(path, |_, current| Arc::ptr_eq(current, slot));
        }
    }

    async fn fetch(&self, path: &str) -> Result<Bytes> {
        let data = self.store.get_object(keys::object_name(path)).await?;
        debug!("fetched {} ({} bytes)", path, data.len());
        Ok(data)
    }

    /// Fetch the object at `path` and hand out a new handle on it.
    ///
    /// Opening a path that already has a clean session refreshes the
    /// shared content; opening one with unflushed writes fails with `Busy`.
    pub async fn open(&self, path: &str) -> Result<SessionHandle> {
        let path = keys::normalize(path);
        let (slot, mut session) = self.lock_slot(&path).await;

        if let Some(existing) = session.as_ref() {
            if existing.dirty {
                return Err(FestivusError::Busy(format!(
                    "{} has unflushed writes from {} open handles",
                    path,
                    existing.handles.len()
                )));
            }
        }

        let data = match self.fetch(&path).await {
            Ok(data) => data,
            Err(e) => {
                self.discard_if_empty(&path, &slot, &session);
                return Err(e);
            }
        };

        let handle = self.next_handle();
        let current = session.get_or_insert_with(|| FileSession::new(Bytes::new()));
        current.buffer = BytesMut::from(&data[..]);
        current.handles.insert(handle);
        debug!(
            "opened {} as handle {} ({} open)",
            path,
            handle.0,
            current.handles.len()
        );
        Ok(handle)
    }

    /// Read up to `size` bytes at `offset`, clamped to the buffer.
    ///
    /// A path without a session is fetched again first.
    pub async fn read(&self, path: &str, size: u32, offset: u64) -> Result<Bytes> {
        let path = keys::normalize(path);
        let (slot, mut session) = self.lock_slot(&path).await;

        if session.is_none() {
            debug!("read of {} without a session, fetching", path);
            match self.fetch(&path).await {
                Ok(data) => *session = Some(FileSession::new(data)),
                Err(e) => {
                    self.discard_if_empty(&path, &slot, &session);
                    return Err(e);
                }
            }
        }

        let buffer = match session.as_ref() {
            Some(s) => &s.buffer,
            None => return Err(FestivusError::NoSession(path)),
        };

        let len = buffer.len() as u64;
        if offset >= len {
            trace!("read {} past end (offset={} len={})", path, offset, len);
            return Ok(Bytes::new());
        }
        let end = len.min(offset.saturating_add(size as u64));
        Ok(Bytes::copy_from_slice(&buffer[offset as usize..end as usize]))
    }

    /// Write `data` at `offset`, zero-filling any gap past the current end
    pub async fn write(&self, path: &str, data: &[u8], offset: u64) -> Result<u64> {
        let path = keys::normalize(path);
        let slot = self.existing_slot(&path)?;
        let mut guard = slot.lock().await;
        let session = guard
            .as_mut()
            .ok_or_else(|| FestivusError::NoSession(path.clone()))?;

        let end = buffer_end(&path, offset, data.len() as u64)?;
        let start = offset as usize;
        if end > session.buffer.len() {
            session.buffer.resize(end, 0);
        }
        session.buffer[start..end].copy_from_slice(data);
        session.dirty = true;

        trace!("write {} offset={} size={}", path, offset, data.len());
        Ok(data.len() as u64)
    }

    /// Resize the buffer of an open session
    pub async fn truncate(&self, path: &str, size: u64) -> Result<()> {
        let path = keys::normalize(path);
        let slot = self.existing_slot(&path)?;
        let mut guard = slot.lock().await;
        let session = guard
            .as_mut()
            .ok_or_else(|| FestivusError::NoSession(path.clone()))?;

        let size = buffer_end(&path, size, 0)?;
        if session.buffer.len() != size {
            session.buffer.resize(size, 0);
            session.dirty = true;
        }
        Ok(())
    }

    /// Upload the buffer if it changed since the last fetch or flush.
    ///
    /// A failed upload leaves the buffer and its dirty flag in place.
    pub async fn flush(&self, path: &str) -> Result<Option<Uploaded>> {
        let path = keys::normalize(path);
        let slot = self.existing_slot(&path)?;
        let mut guard = slot.lock().await;
        let session = guard
            .as_mut()
            .ok_or_else(|| FestivusError::NoSession(path.clone()))?;

        if !session.dirty {
            trace!("flush {}: clean", path);
            return Ok(None);
        }

        let content = Bytes::copy_from_slice(&session.buffer);
        let size = content.len() as u64;
        self.store
            .put_object(keys::object_name(&path), content, &content_type_for(&path))
            .await?;

        session.dirty = false;
        debug!("flushed {} ({} bytes)", path, size);
        Ok(Some(Uploaded { size }))
    }

    /// Close `handle` on `path`.
    ///
    /// The session survives while other handles remain open. Closing the
    /// last one drops it, flushed or not. Returns whether it was dropped.
    pub async fn release(&self, path: &str, handle: SessionHandle) -> bool {
        let path = keys::normalize(path);
        let slot = match self.sessions.get(&path).map(|slot| slot.clone()) {
            Some(slot) => slot,
            None => return false,
        };
        let mut guard = slot.lock().await;

        if let Some(session) = guard.as_mut() {
            session.handles.remove(&handle);
            if !session.handles.is_empty() {
                trace!(
                    "released handle {} of {}, {} still open",
                    handle.0,
                    path,
                    session.handles.len()
                );
                return false;
            }
            if session.dirty {
                warn!(
                    "releasing {} with {} unflushed bytes",
                    path,
                    session.buffer.len()
                );
            }
        }

        *guard = None;
        self.sessions
            .remove_if(&path, |_, current| Arc::ptr_eq(current, &slot));
        true
    }

    pub fn is_open(&self, path: &str) -> bool {
        self.sessions.contains_key(&keys::normalize(path))
    }

    pub async fn is_dirty(&self, path: &str) -> bool {
        match self.sessions.get(&keys::normalize(path)).map(|s| s.clone()) {
            Some(slot) => slot.lock().await.as_ref().map(|s| s.dirty).unwrap_or(false),
            None => false,
        }
    }

    /// Number of paths with a session
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::Utc;
    use tokio_test::assert_ok;

    fn manager_with(files: &[(&str, &str)]) -> (Arc<MemoryStore>, SessionManager) {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        for (name, data) in files {
            store.insert(*name, data.to_string(), now, now);
        }
        let manager = SessionManager::new(store.clone());
        (store, manager)
    }

    #[tokio::test]
    async fn test_open_missing_creates_no_session() {
        let (_, manager) = manager_with(&[]);
        let err = manager.open("/nope.txt").await.unwrap_err();
        assert!(matches!(err, FestivusError::NotFound(_)));
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_read_is_clamped() {
        let (_, manager) = manager_with(&[("f.txt", "0123456789")]);
        manager.open("/f.txt").await.unwrap();

        assert_eq!(manager.read("/f.txt", 100, 0).await.unwrap().len(), 10);
        assert_eq!(manager.read("/f.txt", 4, 8).await.unwrap(), "89");
        assert!(manager.read("/f.txt", 4, 10).await.unwrap().is_empty());
        assert!(manager.read("/f.txt", 4, 500).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_without_session_refetches() {
        let (_, manager) = manager_with(&[("f.txt", "abc")]);
        assert_eq!(manager.read("/f.txt", 3, 0).await.unwrap(), "abc");
        assert!(manager.is_open("/f.txt"));
    }

    #[tokio::test]
    async fn test_read_missing_object_leaves_no_session() {
        let (_, manager) = manager_with(&[]);
        assert!(manager.read("/nope", 3, 0).await.is_err());
        assert!(!manager.is_open("/nope"));
    }

    #[tokio::test]
    async fn test_write_grows_and_marks_dirty() {
        let (_, manager) = manager_with(&[("f.bin", "abc")]);
        manager.open("/f.bin").await.unwrap();
        assert!(!manager.is_dirty("/f.bin").await);

        assert_eq!(manager.write("/f.bin", b"XY", 5).await.unwrap(), 2);
        assert!(manager.is_dirty("/f.bin").await);
        assert_eq!(
            manager.read("/f.bin", 10, 0).await.unwrap(),
            Bytes::from_static(b"abc\0\0XY")
        );

        manager.write("/f.bin", b"Z", 0).await.unwrap();
        assert_eq!(manager.read("/f.bin", 1, 0).await.unwrap(), "Z");
    }

    #[tokio::test]
    async fn test_write_without_session_fails() {
        let (_, manager) = manager_with(&[("f", "abc")]);
        let err = manager.write("/f", b"x", 0).await.unwrap_err();
        assert!(matches!(err, FestivusError::NoSession(_)));
    }

    #[tokio::test]
    async fn test_flush_uploads_only_when_dirty() {
        let (store, manager) = manager_with(&[("notes.txt", "old")]);
        manager.open("/notes.txt").await.unwrap();

        assert_eq!(manager.flush("/notes.txt").await.unwrap(), None);

        manager.write("/notes.txt", b"new!", 0).await.unwrap();
        assert_eq!(
            manager.flush("/notes.txt").await.unwrap(),
            Some(Uploaded { size: 4 })
        );
        assert_eq!(store.get_object("notes.txt").await.unwrap(), "new!");
        assert_eq!(store.content_type("notes.txt").as_deref(), Some("text/plain"));
        assert!(!manager.is_dirty("/notes.txt").await);

        assert_eq!(manager.flush("/notes.txt").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_buffer() {
        let (store, manager) = manager_with(&[("f", "abc")]);
        manager.open("/f").await.unwrap();
        manager.write("/f", b"xyz", 0).await.unwrap();

        store.set_unavailable(true);
        let err = manager.flush("/f").await.unwrap_err();
        assert!(matches!(err, FestivusError::BackendUnavailable(_)));
        assert!(manager.is_dirty("/f").await);

        store.set_unavailable(false);
        assert_ok!(manager.flush("/f").await);
        assert_eq!(store.get_object("f").await.unwrap(), "xyz");
    }

    #[tokio::test]
    async fn test_release_discards_unconditionally() {
        let (store, manager) = manager_with(&[("f", "abc")]);
        let handle = manager.open("/f").await.unwrap();
        manager.write("/f", b"zzz", 0).await.unwrap();
        assert!(manager.release("/f", handle).await);

        assert!(!manager.is_open("/f"));
        assert_eq!(store.get_object("f").await.unwrap(), "abc");
        // Releasing an unknown path is harmless
        assert!(!manager.release("/f", handle).await);
    }

    #[tokio::test]
    async fn test_release_keeps_session_for_other_handles() {
        let (store, manager) = manager_with(&[("f.txt", "orig")]);
        let reader = manager.open("/f.txt").await.unwrap();
        let writer = manager.open("/f.txt").await.unwrap();
        assert_ne!(reader, writer);

        manager.write("/f.txt", b"NEW DATA", 0).await.unwrap();
        assert!(!manager.release("/f.txt", reader).await);
        assert!(manager.is_dirty("/f.txt").await);

        assert_eq!(
            manager.flush("/f.txt").await.unwrap(),
            Some(Uploaded { size: 8 })
        );
        assert_eq!(store.get_object("f.txt").await.unwrap(), "NEW DATA");

        assert!(manager.release("/f.txt", writer).await);
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_release_of_read_only_session() {
        let (_, manager) = manager_with(&[("f", "abc")]);
        // A read without an open leaves a session no handle owns
        manager.read("/f", 3, 0).await.unwrap();
        assert!(manager.is_open("/f"));

        assert!(manager.release("/f", SessionHandle(42)).await);
        assert!(!manager.is_open("/f"));
    }

    #[tokio::test]
    async fn test_reopen_after_last_release() {
        let (_, manager) = manager_with(&[("f", "abc")]);
        let first = manager.open("/f").await.unwrap();
        manager.release("/f", first).await;

        let second = manager.open("/f").await.unwrap();
        manager.write("/f", b"x", 0).await.unwrap();
        assert_eq!(manager.read("/f", 3, 0).await.unwrap(), "xbc");
        assert!(manager.release("/f", second).await);
    }

    #[tokio::test]
    async fn test_write_past_size_limit_is_refused() {
        let (_, manager) = manager_with(&[("f.bin", "abc")]);
        manager.open("/f.bin").await.unwrap();

        let err = manager
            .write("/f.bin", b"y", i64::MAX as u64)
            .await
            .unwrap_err();
        assert!(matches!(err, FestivusError::FileTooLarge(_)));
        assert_eq!(err.to_errno(), libc::EFBIG);

        let err = manager.write("/f.bin", b"y", u64::MAX).await.unwrap_err();
        assert!(matches!(err, FestivusError::FileTooLarge(_)));

        assert!(matches!(
            manager.write("/f.bin", b"yy", MAX_OBJECT_SIZE - 1).await,
            Err(FestivusError::FileTooLarge(_))
        ));

        // The rejected writes left the buffer untouched
        assert!(!manager.is_dirty("/f.bin").await);
        assert_eq!(manager.read("/f.bin", 10, 0).await.unwrap(), "abc");
    }

    #[tokio::test]
    async fn test_reopen_clean_session_refreshes() {
        let (store, manager) = manager_with(&[("f", "one")]);
        let first = manager.open("/f").await.unwrap();

        store
            .put_object("f", Bytes::from_static(b"two"), "text/plain")
            .await
            .unwrap();
        let second = manager.open("/f").await.unwrap();

        assert_ne!(first, second);
        assert_eq!(manager.read("/f", 3, 0).await.unwrap(), "two");
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn test_reopen_dirty_session_is_busy() {
        let (_, manager) = manager_with(&[("f", "one")]);
        manager.open("/f").await.unwrap();
        manager.write("/f", b"ONE", 0).await.unwrap();

        let err = manager.open("/f").await.unwrap_err();
        assert!(matches!(err, FestivusError::Busy(_)));
        // The unflushed content survives the rejected open
        assert_eq!(manager.read("/f", 3, 0).await.unwrap(), "ONE");

        manager.flush("/f").await.unwrap();
        assert_ok!(manager.open("/f").await);
    }

    #[tokio::test]
    async fn test_truncate() {
        let (_, manager) = manager_with(&[("f", "abcdef")]);
        manager.open("/f").await.unwrap();

        manager.truncate("/f", 6).await.unwrap();
        assert!(!manager.is_dirty("/f").await);

        manager.truncate("/f", 2).await.unwrap();
        assert!(manager.is_dirty("/f").await);
        assert_eq!(manager.read("/f", 10, 0).await.unwrap(), "ab");
    }

    #[tokio::test]
    async fn test_truncate_past_size_limit_is_refused() {
        let (_, manager) = manager_with(&[("f", "abcdef")]);
        manager.open("/f").await.unwrap();

        let err = manager.truncate("/f", MAX_OBJECT_SIZE + 1).await.unwrap_err();
        assert!(matches!(err, FestivusError::FileTooLarge(_)));
        assert_eq!(manager.read("/f", 10, 0).await.unwrap(), "abcdef");
    }
}
