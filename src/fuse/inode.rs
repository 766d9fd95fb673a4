//! Inode numbers for filesystem paths
//!
//! The kernel addresses nodes by inode while everything below the adapter
//! is path based. Numbers are handed out on first sight of a path and stay
//! stable for the life of the mount.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::keys;

/// Root directory inode (always 1 in FUSE)
pub const ROOT_INODE: u64 = 1;

/// Bidirectional inode <-> path map
pub struct InodeTable {
    paths: DashMap<u64, String>,
    inodes: DashMap<String, u64>,
    next_inode: AtomicU64,
}

impl InodeTable {
    pub fn new() -> Self {
        let table = Self {
            paths: DashMap::new(),
            inodes: DashMap::new(),
            next_inode: AtomicU64::new(ROOT_INODE + 1),
        };
        table.paths.insert(ROOT_INODE, "/".to_string());
        table.inodes.insert("/".to_string(), ROOT_INODE);
        table
    }

    /// Inode of `path`, allocating one on first sight
    pub fn inode_for(&self, path: &str) -> u64 {
        let path = canonical(path);
        if let Some(ino) = self.inodes.get(&path) {
            return *ino;
        }

        let entry = self.inodes.entry(path.clone()).or_insert_with(|| {
            let ino = self.next_inode.fetch_add(1, Ordering::SeqCst);
            self.paths.insert(ino, path.clone());
            ino
        });
        *entry
    }

    pub fn path(&self, ino: u64) -> Option<String> {
        self.paths.get(&ino).map(|p| p.clone())
    }

    /// Path of `name` inside the directory `parent`
    pub fn child_path(&self, parent: u64, name: &str) -> Option<String> {
        self.path(parent).map(|dir| keys::join(&dir, name))
    }

    /// Inode of the directory containing `ino`; the root is its own parent
    pub fn parent(&self, ino: u64) -> u64 {
        let Some(path) = self.path(ino) else {
            return ROOT_INODE;
        };
        match path.rfind(keys::SEPARATOR) {
            Some(0) | None => ROOT_INODE,
            Some(idx) => self.inode_for(&path[..idx]),
        }
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

/// One spelling per node: leading separator, no trailing one
fn canonical(path: &str) -> String {
    let trimmed = path.trim_end_matches(keys::SEPARATOR);
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        keys::normalize(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_inode() {
        let table = InodeTable::new();
        assert_eq!(table.inode_for("/"), ROOT_INODE);
        assert_eq!(table.inode_for(""), ROOT_INODE);
        assert_eq!(table.path(ROOT_INODE).as_deref(), Some("/"));
        assert_eq!(table.parent(ROOT_INODE), ROOT_INODE);
    }

    #[test]
    fn test_inodes_are_stable() {
        let table = InodeTable::new();
        let first = table.inode_for("/docs/a.txt");
        assert_eq!(table.inode_for("/docs/a.txt"), first);
        assert_ne!(first, ROOT_INODE);
        assert_eq!(table.path(first).as_deref(), Some("/docs/a.txt"));

        // Directory spellings share one inode
        assert_eq!(table.inode_for("/docs/"), table.inode_for("/docs"));
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_child_and_parent() {
        let table = InodeTable::new();
        let docs = table.inode_for("/docs");
        assert_eq!(table.child_path(docs, "a.txt").as_deref(), Some("/docs/a.txt"));
        assert_eq!(table.child_path(ROOT_INODE, "docs").as_deref(), Some("/docs"));
        assert_eq!(table.child_path(999, "x"), None);

        let file = table.inode_for("/docs/a.txt");
        assert_eq!(table.parent(file), docs);
        assert_eq!(table.parent(docs), ROOT_INODE);
    }
}
