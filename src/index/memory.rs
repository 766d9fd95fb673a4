//! Process-local metadata index
//!
//! Mirrors the semantics the Redis backend relies on: one data type per
//! key, empty hashes and sets read as absent, and pipelines applied
//! all-or-nothing. Useful for single-process mounts and for tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use super::{Fields, HashLookup, IndexCommand, MetadataIndex, Pipeline, SetLookup};
use crate::error::{FestivusError, Result};

#[derive(Debug, Clone)]
enum Value {
    Hash(BTreeMap<String, String>),
    Set(BTreeSet<String>),
}

/// In-memory index keyed by string
#[derive(Debug, Default)]
pub struct MemoryIndex {
    entries: Mutex<HashMap<String, Value>>,
    /// When set, every call fails as if the server were unreachable
    unavailable: AtomicBool,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing (or regaining) the connection to the index
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of keys currently stored
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Sorted copy of every stored key
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(FestivusError::BackendUnavailable(
                "memory index marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn apply(entries: &mut HashMap<String, Value>, command: &IndexCommand) -> Result<()> {
        match command {
            IndexCommand::HashSet { key, field, value } => {
                let entry = entries
                    .entry(key.clone())
                    .or_insert_with(|| Value::Hash(BTreeMap::new()));
                match entry {
                    Value::Hash(hash) => {
                        hash.insert(field.clone(), value.clone());
                        Ok(())
                    }
                    Value::Set(_) => Err(FestivusError::TypeMismatch(key.clone())),
                }
            }
            IndexCommand::SetAdd { key, member } => {
                let entry = entries
                    .entry(key.clone())
                    .or_insert_with(|| Value::Set(BTreeSet::new()));
                match entry {
                    Value::Set(set) => {
                        set.insert(member.clone());
                        Ok(())
                    }
                    Value::Hash(_) => Err(FestivusError::TypeMismatch(key.clone())),
                }
            }
        }
    }
}

#[async_trait]
impl MetadataIndex for MemoryIndex {
    async fn hash_get_all(&self, key: &str) -> Result<HashLookup> {
        self.check_available()?;
        trace!("hgetall {}", key);
        Ok(match self.entries.lock().get(key) {
            Some(Value::Hash(hash)) => {
                let fields: Fields = hash.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                HashLookup::Hash(fields)
            }
            Some(Value::Set(_)) => HashLookup::Set,
            None => HashLookup::Absent,
        })
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.check_available()?;
        let command = IndexCommand::HashSet {
            key: key.to_string(),
            field: field.to_string(),
            value: value.to_string(),
        };
        Self::apply(&mut self.entries.lock(), &command)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        self.check_available()?;
        let command = IndexCommand::SetAdd {
            key: key.to_string(),
            member: member.to_string(),
        };
        Self::apply(&mut self.entries.lock(), &command)
    }

    async fn set_members(&self, key: &str) -> Result<SetLookup> {
        self.check_available()?;
        trace!("smembers {}", key);
        Ok(match self.entries.lock().get(key) {
            Some(Value::Set(set)) => SetLookup::Members(set.iter().cloned().collect()),
            Some(Value::Hash(_)) => SetLookup::Hash,
            None => SetLookup::Absent,
        })
    }

    async fn execute(&self, pipeline: Pipeline) -> Result<()> {
        self.check_available()?;
        let mut entries = self.entries.lock();

        // Stage against a copy of the touched keys so a failing command
        // leaves the live map untouched.
        let mut staged: HashMap<String, Value> = HashMap::new();
        for command in pipeline.commands() {
            let key = command.key();
            if !staged.contains_key(key) {
                if let Some(existing) = entries.get(key) {
                    staged.insert(key.to_string(), existing.clone());
                }
            }
            Self::apply(&mut staged, command)?;
        }

        trace!("pipeline applied {} commands", pipeline.len());
        entries.extend(staged);
        Ok(())
    }
}
