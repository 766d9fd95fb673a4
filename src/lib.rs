//! festivus: an object-storage bucket mounted as a filesystem
//!
//! File content lives in the bucket; directory structure and attributes
//! live in a Redis index so that `stat` and `readdir` never touch the
//! bucket.
//!
//! # Architecture
//!
//! - **Index**: `MetadataIndex` over Redis (or memory) holding one entry
//!   set and one metadata record per directory and one attribute record
//!   per file, all under a configurable base key.
//! - **Store**: `BlobStore` over S3-compatible buckets, whole objects only.
//! - **Core**: attribute resolution, directory listing, open file sessions
//!   and bulk indexing, composed into `BucketFs`.
//! - **FUSE Adapter**: translates inode-based kernel callbacks into
//!   `BucketFs` path operations.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use festivus::attr::Owner;
//! use festivus::fs::BucketFs;
//! use festivus::index::MemoryIndex;
//! use festivus::keys::KeySpace;
//! use festivus::store::MemoryStore;
//!
//! # async fn example() -> festivus::Result<()> {
//! let fs = BucketFs::new(
//!     Arc::new(MemoryIndex::new()),
//!     Arc::new(MemoryStore::new()),
//!     KeySpace::new(""),
//!     Owner::current(None, None),
//!     false,
//! );
//! fs.reindex().await?;
//! let root = fs.readdir("/").await?;
//! # Ok(())
//! # }
//! ```

pub mod attr;
pub mod config;
pub mod env;
pub mod error;
pub mod fs;
pub mod fuse;
pub mod index;
pub mod indexer;
pub mod keys;
pub mod lister;
pub mod mount;
pub mod resolver;
pub mod retry;
pub mod session;
pub mod store;

pub use error::{FestivusError, Result};
