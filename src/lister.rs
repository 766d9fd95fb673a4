//! Directory listing from the entry sets in the metadata index

use std::sync::Arc;

use tracing::trace;

use crate::attr::NodeKind;
use crate::error::{FestivusError, Result};
use crate::index::{MetadataIndex, SetLookup};
use crate::keys::{KeySpace, SEPARATOR};

/// A decoded directory entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: NodeKind,
}

impl DirEntry {
    /// Decode a stored member; directories carry a trailing separator
    pub fn from_member(member: &str) -> Self {
        match member.strip_suffix(SEPARATOR) {
            Some(name) => Self {
                name: name.to_string(),
                kind: NodeKind::Directory,
            },
            None => Self {
                name: member.to_string(),
                kind: NodeKind::File,
            },
        }
    }
}

/// Lists immediate children of a directory
pub struct DirectoryLister {
    index: Arc<dyn MetadataIndex>,
    keys: KeySpace,
}

impl DirectoryLister {
    pub fn new(index: Arc<dyn MetadataIndex>, keys: KeySpace) -> Self {
        Self { index, keys }
    }

    /// Raw member names of the directory's entry set, in no particular order.
    ///
    /// `/a` and `/a/` read the same set. A directory with no stored set
    /// lists as empty.
    pub async fn list(&self, path: &str) -> Result<Vec<String>> {
        let key = self.keys.dir_key(path);
        trace!("list {} via {}", path, key);

        match self.index.set_members(&key).await? {
            SetLookup::Members(members) => Ok(members),
            SetLookup::Absent => Ok(Vec::new()),
            SetLookup::Hash => Err(FestivusError::NotADirectory(path.to_string())),
        }
    }

    /// Children of the directory, classified by kind
    pub async fn entries(&self, path: &str) -> Result<Vec<DirEntry>> {
        let members = self.list(path).await?;
        Ok(members
            .iter()
            .map(|member| DirEntry::from_member(member))
            .filter(|entry| !entry.name.is_empty())
            .collect())
    }
}
