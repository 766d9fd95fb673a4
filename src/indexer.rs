//! Bulk indexing of the object store into the metadata index
//!
//! Each object contributes:
//! - its name to the entry set of every directory on its path,
//! - its times to the metadata record of every such directory
//!   (latest modification, earliest creation),
//! - its own attribute record.
//!
//! The writes for one object go out as a single pipeline. Directory
//! records are read before the pipeline is built, so two indexers over
//! the same base key (or an indexer racing live writes) can lose merges.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::attr::AttrRecord;
use crate::error::{FestivusError, Result};
use crate::index::{HashLookup, MetadataIndex, Pipeline};
use crate::keys::{self, KeySpace, ObjectPath, SEPARATOR};
use crate::store::{BlobStore, ObjectInfo};

/// Progress is logged every this many objects
const PROGRESS_INTERVAL: u64 = 1000;

/// Outcome of a full indexing run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexReport {
    pub indexed: u64,
    pub skipped: u64,
}

/// Populates the metadata index from a full bucket listing
pub struct BulkIndexer {
    index: Arc<dyn MetadataIndex>,
    store: Arc<dyn BlobStore>,
    keys: KeySpace,
    running: AtomicBool,
}

impl BulkIndexer {
    pub fn new(index: Arc<dyn MetadataIndex>, store: Arc<dyn BlobStore>, keys: KeySpace) -> Self {
        Self {
            index,
            store,
            keys,
            running: AtomicBool::new(false),
        }
    }

    /// Index every object in the store.
    ///
    /// The first failing object aborts the run; objects already indexed
    /// stay indexed and a rerun converges.
    pub async fn reindex(&self) -> Result<IndexReport> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(FestivusError::Busy(
                "bulk index already running".to_string(),
            ));
        }
        scopeguard::defer! {
            self.running.store(false, Ordering::SeqCst);
        }

        let started = Instant::now();
        info!("Indexing bucket under base key {:?}", self.keys.base());

        let mut report = IndexReport::default();
        let mut objects = self.store.list_objects();
        while let Some(object) = objects.next().await {
            let object = object?;
            if self.index_object(&object).await? {
                report.indexed += 1;
                if report.indexed % PROGRESS_INTERVAL == 0 {
                    info!("Indexed {} objects", report.indexed);
                }
            } else {
                report.skipped += 1;
            }
        }

        info!(
            "Indexing finished: {} objects indexed, {} skipped in {:?}",
            report.indexed,
            report.skipped,
            started.elapsed()
        );
        Ok(report)
    }

    /// Record one object and its directory chain.
    ///
    /// Returns `false` when the object cannot be represented (its name
    /// uses the reserved directory marker).
    pub async fn index_object(&self, object: &ObjectInfo) -> Result<bool> {
        if keys::contains_marker(&object.name) {
            warn!(
                "Skipping {}: name uses reserved component {}",
                object.name,
                keys::DIR_METADATA
            );
            return Ok(false);
        }

        let parsed = ObjectPath::parse(&object.name);
        let updated = object.updated.timestamp();
        let created = object.created.timestamp();
        let dir_paths = parsed.dir_paths();

        let mut pipe = Pipeline::new();
        for (depth, dir) in dir_paths.iter().enumerate() {
            let meta_key = self.keys.dir_metadata_key(dir);
            let existing = self.directory_record(&meta_key).await?;
            let merged = AttrRecord::merge_directory(existing, updated, created);
            if existing != Some(merged) {
                for (field, value) in merged.encode() {
                    pipe.hset(meta_key.as_str(), field, value);
                }
            }

            if let Some(child) = parsed.dirs.get(depth) {
                pipe.sadd(self.keys.dir_key(dir), format!("{}{}", child, SEPARATOR));
            }
        }

        if let (Some(leaf), Some(leaf_path)) = (&parsed.leaf, parsed.leaf_path()) {
            let parent = dir_paths.last().map(String::as_str).unwrap_or("/");
            pipe.sadd(self.keys.dir_key(parent), leaf.as_str());

            let leaf_key = self.keys.path_key(&leaf_path);
            for (field, value) in AttrRecord::file(object.size, updated, created).encode() {
                pipe.hset(leaf_key.as_str(), field, value);
            }
        }

        debug!("indexing {} with {} commands", object.name, pipe.len());
        self.index.execute(pipe).await?;
        Ok(true)
    }

    async fn directory_record(&self, key: &str) -> Result<Option<AttrRecord>> {
        match self.index.hash_get_all(key).await? {
            HashLookup::Hash(fields) => Ok(Some(AttrRecord::decode(key, &fields)?)),
            HashLookup::Absent => Ok(None),
            HashLookup::Set => Err(FestivusError::TypeMismatch(key.to_string())),
        }
    }
}
