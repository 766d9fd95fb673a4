//! Blob store abstraction
//!
//! Objects are addressed by their full name (the filesystem path without
//! the leading separator) and are only ever fetched or written whole.

pub mod memory;
pub mod s3;

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;

use crate::error::Result;

pub use self::memory::MemoryStore;
pub use self::s3::S3Store;

/// Listing entry for a stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub name: String,
    pub size: u64,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// Stream type for full bucket enumeration
pub type ObjectStream = Pin<Box<dyn Stream<Item = Result<ObjectInfo>> + Send>>;

/// Whole-object storage backend
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Enumerate every object in the bucket exactly once
    fn list_objects(&self) -> ObjectStream;

    /// Fetch the full content of `name`
    async fn get_object(&self, name: &str) -> Result<Bytes>;

    /// Overwrite `name` with `data`
    async fn put_object(&self, name: &str, data: Bytes, content_type: &str) -> Result<()>;
}

/// Content type inferred from the object name's extension
pub fn content_type_for(name: &str) -> String {
    mime_guess::from_path(name)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}
