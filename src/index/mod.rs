//! Metadata index abstraction
//!
//! The index is a key-value store holding two data types: hashes (attribute
//! records) and sets (directory entries). Each key holds one type. Lookups
//! report what was actually found instead of failing on a type mismatch,
//! so callers branch on a value.

pub mod memory;
pub mod redis;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;

pub use self::memory::MemoryIndex;
pub use self::redis::RedisIndex;

/// Raw hash fields as stored
pub type Fields = HashMap<String, String>;

/// Result of reading a key as a hash
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashLookup {
    /// The key holds a non-empty hash
    Hash(Fields),
    /// The key holds a set
    Set,
    /// Nothing is stored under the key
    Absent,
}

/// Result of reading a key as a set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetLookup {
    /// The key holds a non-empty set
    Members(Vec<String>),
    /// The key holds a hash
    Hash,
    /// Nothing is stored under the key
    Absent,
}

/// A single write queued in a [`Pipeline`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexCommand {
    HashSet {
        key: String,
        field: String,
        value: String,
    },
    SetAdd {
        key: String,
        member: String,
    },
}

impl IndexCommand {
    pub fn key(&self) -> &str {
        match self {
            IndexCommand::HashSet { key, .. } | IndexCommand::SetAdd { key, .. } => key,
        }
    }
}

/// Writes submitted together and applied all-or-nothing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pipeline {
    commands: Vec<IndexCommand>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hset(
        &mut self,
        key: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        self.commands.push(IndexCommand::HashSet {
            key: key.into(),
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn sadd(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.commands.push(IndexCommand::SetAdd {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn commands(&self) -> &[IndexCommand] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Key-value store used as the metadata and directory index
#[async_trait]
pub trait MetadataIndex: Send + Sync {
    /// Read every field of the hash at `key`
    async fn hash_get_all(&self, key: &str) -> Result<HashLookup>;

    /// Set one field of the hash at `key`
    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()>;

    /// Add `member` to the set at `key`
    async fn set_add(&self, key: &str, member: &str) -> Result<()>;

    /// Read the members of the set at `key`
    async fn set_members(&self, key: &str) -> Result<SetLookup>;

    /// Apply every command in `pipeline`, or none of them
    async fn execute(&self, pipeline: Pipeline) -> Result<()>;
}
