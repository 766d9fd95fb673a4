//! Capability table of filesystem operations
//!
//! Every operation the transport can issue is listed here and is either
//! served or answered with a uniform error. Nothing is a silent no-op.

use std::fmt;

use crate::error::{FestivusError, Result};

/// Operations of the transport contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Getattr,
    Readdir,
    Open,
    Read,
    Write,
    Flush,
    Release,
    Truncate,
    Fsync,
    Statfs,
    Chmod,
    Chown,
    Utimens,
    Mknod,
    Create,
    Mkdir,
    Rmdir,
    Unlink,
    Rename,
    Symlink,
    Link,
    Readlink,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Getattr => "getattr",
            Operation::Readdir => "readdir",
            Operation::Open => "open",
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::Flush => "flush",
            Operation::Release => "release",
            Operation::Truncate => "truncate",
            Operation::Fsync => "fsync",
            Operation::Statfs => "statfs",
            Operation::Chmod => "chmod",
            Operation::Chown => "chown",
            Operation::Utimens => "utimens",
            Operation::Mknod => "mknod",
            Operation::Create => "create",
            Operation::Mkdir => "mkdir",
            Operation::Rmdir => "rmdir",
            Operation::Unlink => "unlink",
            Operation::Rename => "rename",
            Operation::Symlink => "symlink",
            Operation::Link => "link",
            Operation::Readlink => "readlink",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which operations a mount serves
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    /// Content may be modified through open sessions
    pub write: bool,
    /// Buffers of open sessions may be resized
    pub truncate: bool,
}

impl Capabilities {
    /// Everything this filesystem implements
    pub fn full() -> Self {
        Self {
            write: true,
            truncate: true,
        }
    }

    pub fn read_only() -> Self {
        Self {
            write: false,
            truncate: false,
        }
    }

    /// Whether the operation is implemented at all, independent of mode
    pub fn implements(&self, op: Operation) -> bool {
        match op {
            Operation::Getattr
            | Operation::Readdir
            | Operation::Open
            | Operation::Read
            | Operation::Write
            | Operation::Flush
            | Operation::Release
            | Operation::Truncate
            | Operation::Fsync
            | Operation::Statfs => true,
            Operation::Chmod
            | Operation::Chown
            | Operation::Utimens
            | Operation::Mknod
            | Operation::Create
            | Operation::Mkdir
            | Operation::Rmdir
            | Operation::Unlink
            | Operation::Rename
            | Operation::Symlink
            | Operation::Link
            | Operation::Readlink => false,
        }
    }

    /// Admit or refuse `op`.
    ///
    /// Unimplemented operations report `NotSupported`; implemented ones
    /// that would modify content on a read-only mount report `ReadOnly`.
    pub fn check(&self, op: Operation) -> Result<()> {
        if !self.implements(op) {
            return Err(FestivusError::NotSupported(op.name().to_string()));
        }
        let allowed = match op {
            Operation::Write => self.write,
            Operation::Truncate => self.truncate,
            _ => true,
        };
        if !allowed {
            return Err(FestivusError::ReadOnly);
        }
        Ok(())
    }
}
