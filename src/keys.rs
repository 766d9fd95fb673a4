//! Path normalization and metadata index key derivation
//!
//! Filesystem paths are slash-delimited and rooted at `/`. Every index key
//! is the configured base key joined with such a path. Directories own two
//! keys: the entry set at `base + "/dir/"` and the metadata record at
//! `base + "/dir/" + DIR_METADATA`. The store allows one data type per key,
//! so the two must never share a name.

/// Reserved suffix marking a directory's metadata record
pub const DIR_METADATA: &str = "__dir_metadata__";

/// Path separator used by both the filesystem view and object names
pub const SEPARATOR: char = '/';

/// Normalize a filesystem path so that it always starts with `/`
pub fn normalize(path: &str) -> String {
    if path.starts_with(SEPARATOR) {
        path.to_string()
    } else {
        format!("{}{}", SEPARATOR, path)
    }
}

/// Directory form of a path: normalized, with exactly one trailing `/`
pub fn dir_form(path: &str) -> String {
    let mut normalized = normalize(path);
    if !normalized.ends_with(SEPARATOR) {
        normalized.push(SEPARATOR);
    }
    normalized
}

/// Whether the path names the filesystem root
pub fn is_root(path: &str) -> bool {
    path.trim_matches(SEPARATOR).is_empty()
}

/// Object store name for a filesystem path (no leading separator)
pub fn object_name(path: &str) -> &str {
    path.trim_start_matches(SEPARATOR)
}

/// Join a directory path and a child name into a filesystem path
pub fn join(dir: &str, name: &str) -> String {
    let mut joined = dir_form(dir);
    joined.push_str(name.trim_start_matches(SEPARATOR));
    joined
}

/// Whether any component of an object name equals the reserved marker
pub fn contains_marker(name: &str) -> bool {
    name.split(SEPARATOR).any(|part| part == DIR_METADATA)
}

/// An object name split into its directory chain and leaf
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectPath {
    /// Directory components from the root down, without separators
    pub dirs: Vec<String>,
    /// Final component; `None` for directory placeholder objects (`"a/b/"`)
    pub leaf: Option<String>,
}

impl ObjectPath {
    pub fn parse(name: &str) -> Self {
        let is_placeholder = name.ends_with(SEPARATOR);
        let mut parts: Vec<String> = name
            .split(SEPARATOR)
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect();

        let leaf = if is_placeholder { None } else { parts.pop() };
        Self { dirs: parts, leaf }
    }

    /// Directory paths on the chain, root first: `/`, `/a/`, `/a/b/`
    pub fn dir_paths(&self) -> Vec<String> {
        let mut paths = Vec::with_capacity(self.dirs.len() + 1);
        let mut current = String::from("/");
        paths.push(current.clone());
        for dir in &self.dirs {
            current.push_str(dir);
            current.push(SEPARATOR);
            paths.push(current.clone());
        }
        paths
    }

    /// Filesystem path of the leaf, if any
    pub fn leaf_path(&self) -> Option<String> {
        let leaf = self.leaf.as_ref()?;
        let parent = self.dir_paths().pop().unwrap_or_else(|| "/".to_string());
        Some(format!("{}{}", parent, leaf))
    }
}

/// Key derivation under a configurable base key
#[derive(Debug, Clone, Default)]
pub struct KeySpace {
    base: String,
}

impl KeySpace {
    pub fn new(base_key: impl Into<String>) -> Self {
        let base: String = base_key.into();
        Self {
            base: base.trim_end_matches(SEPARATOR).to_string(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Key of a node's own record (file attribute hash or directory entry set)
    pub fn path_key(&self, path: &str) -> String {
        format!("{}{}", self.base, normalize(path))
    }

    /// Key of the entry set for the directory at `path`
    pub fn dir_key(&self, path: &str) -> String {
        format!("{}{}", self.base, dir_form(path))
    }

    /// Marker key appended directly to the path, as given
    pub fn marker_key(&self, path: &str) -> String {
        format!("{}{}", self.path_key(path), DIR_METADATA)
    }

    /// Metadata record key for the directory at `path`
    pub fn dir_metadata_key(&self, path: &str) -> String {
        format!("{}{}", self.dir_key(path), DIR_METADATA)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_and_dir_form() {
        assert_eq!(normalize("a/b"), "/a/b");
        assert_eq!(normalize("/a/b"), "/a/b");
        assert_eq!(dir_form("/a"), "/a/");
        assert_eq!(dir_form("/a/"), "/a/");
        assert_eq!(dir_form(""), "/");
        assert_eq!(dir_form("/"), "/");
    }

    #[test]
    fn test_is_root() {
        assert!(is_root("/"));
        assert!(is_root(""));
        assert!(!is_root("/a"));
    }

    #[test]
    fn test_join() {
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/a", "b.txt"), "/a/b.txt");
        assert_eq!(join("/a/", "b/"), "/a/b/");
    }

    #[test]
    fn test_object_path_parse() {
        let parsed = ObjectPath::parse("a/b/c.txt");
        assert_eq!(parsed.dirs, vec!["a", "b"]);
        assert_eq!(parsed.leaf.as_deref(), Some("c.txt"));
        assert_eq!(parsed.dir_paths(), vec!["/", "/a/", "/a/b/"]);
        assert_eq!(parsed.leaf_path().as_deref(), Some("/a/b/c.txt"));

        let top = ObjectPath::parse("c.txt");
        assert!(top.dirs.is_empty());
        assert_eq!(top.dir_paths(), vec!["/"]);
        assert_eq!(top.leaf_path().as_deref(), Some("/c.txt"));

        let placeholder = ObjectPath::parse("a/b/");
        assert_eq!(placeholder.dirs, vec!["a", "b"]);
        assert_eq!(placeholder.leaf, None);
        assert_eq!(placeholder.leaf_path(), None);
    }

    #[test]
    fn test_keyspace() {
        let keys = KeySpace::new("tenant/");
        assert_eq!(keys.base(), "tenant");
        assert_eq!(keys.path_key("/a/b.txt"), "tenant/a/b.txt");
        assert_eq!(keys.dir_key("/a"), "tenant/a/");
        assert_eq!(keys.dir_metadata_key("/a"), "tenant/a/__dir_metadata__");
        assert_eq!(keys.marker_key("/a"), "tenant/a__dir_metadata__");

        let bare = KeySpace::new("");
        assert_eq!(bare.dir_key("/"), "/");
        assert_eq!(bare.dir_metadata_key("/"), "/__dir_metadata__");
    }

    #[test]
    fn test_contains_marker() {
        assert!(contains_marker("a/__dir_metadata__/b"));
        assert!(!contains_marker("a/b__dir_metadata__x"));
    }
}
