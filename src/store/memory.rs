//! Process-local blob store

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream;
use parking_lot::RwLock;
use tracing::debug;

use super::{BlobStore, ObjectInfo, ObjectStream};
use crate::error::{FestivusError, Result};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    content_type: String,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
}

/// Blob store kept entirely in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<String, StoredObject>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object with explicit timestamps
    pub fn insert(
        &self,
        name: impl Into<String>,
        data: impl Into<Bytes>,
        created: DateTime<Utc>,
        updated: DateTime<Utc>,
    ) {
        let name = name.into();
        let content_type = super::content_type_for(&name);
        self.objects.write().insert(
            name,
            StoredObject {
                data: data.into(),
                content_type,
                created,
                updated,
            },
        );
    }

    /// Content type recorded at the last write of `name`
    pub fn content_type(&self, name: &str) -> Option<String> {
        self.objects
            .read()
            .get(name)
            .map(|object| object.content_type.clone())
    }

    /// Simulate losing (or regaining) the connection to the store
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(FestivusError::BackendUnavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    fn list_objects(&self) -> ObjectStream {
        if let Err(e) = self.check_available() {
            return Box::pin(stream::iter(vec![Err(e)]));
        }

        let listing: Vec<Result<ObjectInfo>> = self
            .objects
            .read()
            .iter()
            .map(|(name, object)| {
                Ok(ObjectInfo {
                    name: name.clone(),
                    size: object.data.len() as u64,
                    created: object.created,
                    updated: object.updated,
                })
            })
            .collect();
        Box::pin(stream::iter(listing))
    }

    async fn get_object(&self, name: &str) -> Result<Bytes> {
        self.check_available()?;
        self.objects
            .read()
            .get(name)
            .map(|object| object.data.clone())
            .ok_or_else(|| FestivusError::NotFound(name.to_string()))
    }

    async fn put_object(&self, name: &str, data: Bytes, content_type: &str) -> Result<()> {
        self.check_available()?;
        debug!("put {} ({} bytes, {})", name, data.len(), content_type);

        let now = Utc::now();
        let mut objects = self.objects.write();
        let created = objects.get(name).map(|o| o.created).unwrap_or(now);
        objects.insert(
            name.to_string(),
            StoredObject {
                data,
                content_type: content_type.to_string(),
                created,
                updated: now,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_put_get_and_list() {
        let store = MemoryStore::new();
        store
            .put_object("a/b.txt", Bytes::from_static(b"hello"), "text/plain")
            .await
            .unwrap();

        assert_eq!(store.get_object("a/b.txt").await.unwrap(), "hello");
        assert_eq!(store.content_type("a/b.txt").as_deref(), Some("text/plain"));

        let listing: Vec<_> = store.list_objects().collect().await;
        assert_eq!(listing.len(), 1);
        let info = listing[0].as_ref().unwrap();
        assert_eq!(info.name, "a/b.txt");
        assert_eq!(info.size, 5);
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let store = MemoryStore::new();
        let err = store.get_object("nope").await.unwrap_err();
        assert!(matches!(err, FestivusError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_overwrite_keeps_creation_time() {
        let store = MemoryStore::new();
        let created = DateTime::from_timestamp(1_000, 0).unwrap();
        store.insert("f", Bytes::from_static(b"1"), created, created);
        store
            .put_object("f", Bytes::from_static(b"22"), "application/octet-stream")
            .await
            .unwrap();

        let listing: Vec<_> = store.list_objects().collect().await;
        let info = listing[0].as_ref().unwrap();
        assert_eq!(info.created, created);
        assert!(info.updated > created);
        assert_eq!(info.size, 2);
    }

    #[tokio::test]
    async fn test_unavailable_store() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(store.get_object("f").await.unwrap_err().is_transient());
        let listing: Vec<_> = store.list_objects().collect().await;
        assert!(listing[0].is_err());
    }
}
