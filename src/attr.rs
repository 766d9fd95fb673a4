//! Attribute records and derived file attributes
//!
//! The index stores only timestamps and sizes as string hash fields.
//! [`AttrRecord`] is the typed form decoded at the index boundary;
//! [`FileAttributes`] adds everything derived at resolution time.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use crate::error::{FestivusError, Result};

/// Block size used for `st_blocks` and directory sizes
pub const BLOCK_SIZE: u64 = 256;

/// Reported size of every directory
pub const DIR_SIZE: u64 = 4 * BLOCK_SIZE;

/// Default file mode (rw-r--r--)
pub const DEFAULT_FILE_MODE: u16 = 0o644;
/// Default directory mode (rwxr-xr-x)
pub const DEFAULT_DIR_MODE: u16 = 0o755;

/// Hash field names as stored in the index
pub mod field {
    pub const MTIME: &str = "st_mtime";
    pub const ATIME: &str = "st_atime";
    pub const CTIME: &str = "st_ctime";
    pub const SIZE: &str = "st_size";
}

/// Stored attributes of a file or directory, times in seconds since epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AttrRecord {
    pub mtime: i64,
    pub atime: i64,
    pub ctime: i64,
    /// Object size in bytes; directories carry none
    pub size: Option<u64>,
}

impl AttrRecord {
    pub fn file(size: u64, mtime: i64, ctime: i64) -> Self {
        Self {
            mtime,
            atime: mtime,
            ctime,
            size: Some(size),
        }
    }

    pub fn directory(mtime: i64, ctime: i64) -> Self {
        Self {
            mtime,
            atime: mtime,
            ctime,
            size: None,
        }
    }

    /// Decode raw hash fields read from `key`.
    ///
    /// Missing fields default to zero; unknown fields are ignored.
    pub fn decode(key: &str, fields: &HashMap<String, String>) -> Result<Self> {
        let time = |name: &str| -> Result<i64> {
            match fields.get(name) {
                Some(raw) => parse_seconds(raw).ok_or_else(|| FestivusError::CorruptRecord {
                    key: key.to_string(),
                    reason: format!("{} is not numeric: {:?}", name, raw),
                }),
                None => Ok(0),
            }
        };

        let size = match fields.get(field::SIZE) {
            Some(raw) => Some(raw.trim().parse::<u64>().map_err(|_| {
                FestivusError::CorruptRecord {
                    key: key.to_string(),
                    reason: format!("{} is not a byte count: {:?}", field::SIZE, raw),
                }
            })?),
            None => None,
        };

        Ok(Self {
            mtime: time(field::MTIME)?,
            atime: time(field::ATIME)?,
            ctime: time(field::CTIME)?,
            size,
        })
    }

    /// Encode as hash fields for writing back to the index
    pub fn encode(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            (field::MTIME, self.mtime.to_string()),
            (field::ATIME, self.atime.to_string()),
            (field::CTIME, self.ctime.to_string()),
        ];
        if let Some(size) = self.size {
            fields.push((field::SIZE, size.to_string()));
        }
        fields
    }

    /// Fold one object's times into a directory record.
    ///
    /// Modification and access times only move forward, the creation
    /// time only moves back, so repeated merges converge.
    pub fn merge_directory(existing: Option<Self>, mtime: i64, ctime: i64) -> Self {
        match existing {
            None => Self::directory(mtime, ctime),
            Some(current) => Self {
                mtime: current.mtime.max(mtime),
                atime: current.atime.max(mtime),
                ctime: current.ctime.min(ctime),
                size: None,
            },
        }
    }
}

/// Parse seconds since epoch, tolerating a fractional part
fn parse_seconds(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    raw.parse::<i64>()
        .ok()
        .or_else(|| raw.parse::<f64>().ok().filter(|v| v.is_finite()).map(|v| v.floor() as i64))
}

/// Node classification produced by resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
}

/// Identity reported as owner of every node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

impl Owner {
    /// The running process identity, with optional overrides
    pub fn current(uid: Option<u32>, gid: Option<u32>) -> Self {
        Self {
            uid: uid.unwrap_or_else(|| unsafe { libc::getuid() }),
            gid: gid.unwrap_or_else(|| unsafe { libc::getgid() }),
        }
    }
}

/// Fully resolved attributes handed to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttributes {
    pub kind: NodeKind,
    pub size: u64,
    pub blocks: u64,
    pub mtime: i64,
    pub atime: i64,
    pub ctime: i64,
    /// Permission bits only
    pub perm: u16,
    /// File type bits combined with `perm`
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub dev: u64,
    pub ino: u64,
}

impl FileAttributes {
    pub fn derive(kind: NodeKind, record: &AttrRecord, owner: Owner) -> Self {
        let (size, perm, type_bits, nlink) = match kind {
            NodeKind::File => (
                record.size.unwrap_or(0),
                DEFAULT_FILE_MODE,
                libc::S_IFREG as u32,
                1,
            ),
            NodeKind::Directory => (DIR_SIZE, DEFAULT_DIR_MODE, libc::S_IFDIR as u32, 2),
        };

        Self {
            kind,
            size,
            blocks: size.div_ceil(BLOCK_SIZE),
            mtime: record.mtime,
            atime: record.atime,
            ctime: record.ctime,
            perm,
            mode: type_bits | perm as u32,
            nlink,
            uid: owner.uid,
            gid: owner.gid,
            dev: 0,
            ino: 0,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }
}

/// Convert seconds since epoch to `SystemTime`, clamping negatives to the epoch
pub fn system_time(secs: i64) -> SystemTime {
    u64::try_from(secs)
        .ok()
        .and_then(|s| SystemTime::UNIX_EPOCH.checked_add(Duration::from_secs(s)))
        .unwrap_or(SystemTime::UNIX_EPOCH)
}
