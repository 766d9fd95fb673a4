//! Attribute resolution
//!
//! A path names exactly one of a file, a directory, or nothing. A file's
//! record lives at the path key itself. A directory's path key (in its
//! trailing-separator form) holds the entry set, and its record lives
//! under the `DIR_METADATA` marker. Resolution reads up to three keys:
//!
//! 1. `path` as a hash: a file.
//! 2. `path + marker`, when `path` turned out to hold a set.
//! 3. `path + "/" + marker`, for bare directory names like `/a`.

use std::sync::Arc;

use tracing::trace;

use crate::attr::{AttrRecord, FileAttributes, NodeKind, Owner};
use crate::error::{FestivusError, Result};
use crate::index::{HashLookup, MetadataIndex};
use crate::keys::{self, KeySpace};

/// Resolves paths to attributes through the metadata index
pub struct AttributeResolver {
    index: Arc<dyn MetadataIndex>,
    keys: KeySpace,
    owner: Owner,
}

impl AttributeResolver {
    pub fn new(index: Arc<dyn MetadataIndex>, keys: KeySpace, owner: Owner) -> Self {
        Self { index, keys, owner }
    }

    /// Resolve `path` to its attributes, or `NotFound`
    pub async fn resolve(&self, path: &str) -> Result<FileAttributes> {
        let (kind, record) = self.lookup(path).await?;
        Ok(FileAttributes::derive(kind, &record, self.owner))
    }

    /// Resolve `path` to its stored record without derived fields
    pub async fn lookup(&self, path: &str) -> Result<(NodeKind, AttrRecord)> {
        if keys::contains_marker(path) {
            return Err(FestivusError::NotFound(path.to_string()));
        }

        let path_key = self.keys.path_key(path);
        let mut checked = None;

        match self.index.hash_get_all(&path_key).await? {
            HashLookup::Hash(fields) => {
                trace!("resolve {}: file record at {}", path, path_key);
                let record = AttrRecord::decode(&path_key, &fields)?;
                return Ok((NodeKind::File, record));
            }
            HashLookup::Set => {
                // The path key is a directory's entry set
                let marker_key = self.keys.marker_key(path);
                if let Some(record) = self.directory_record(&marker_key).await? {
                    return Ok((NodeKind::Directory, record));
                }
                checked = Some(marker_key);
            }
            HashLookup::Absent => {}
        }

        let dir_metadata_key = self.keys.dir_metadata_key(path);
        if checked.as_deref() != Some(dir_metadata_key.as_str()) {
            if let Some(record) = self.directory_record(&dir_metadata_key).await? {
                return Ok((NodeKind::Directory, record));
            }
        }

        if keys::is_root(path) {
            // The root exists even before anything has been indexed
            trace!("resolve {}: synthesized root record", path);
            return Ok((NodeKind::Directory, AttrRecord::directory(0, 0)));
        }

        Err(FestivusError::NotFound(path.to_string()))
    }

    async fn directory_record(&self, key: &str) -> Result<Option<AttrRecord>> {
        match self.index.hash_get_all(key).await? {
            HashLookup::Hash(fields) => {
                trace!("directory record at {}", key);
                Ok(Some(AttrRecord::decode(key, &fields)?))
            }
            HashLookup::Set => Err(FestivusError::TypeMismatch(key.to_string())),
            HashLookup::Absent => Ok(None),
        }
    }
}
