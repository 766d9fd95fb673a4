pub mod inode;

use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType as FuseFileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate,
    ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite,
    Request, TimeOrNow,
};
use tracing::{debug, error, info, trace};

use crate::attr::{system_time, FileAttributes, NodeKind, BLOCK_SIZE};
use crate::error::FestivusError;
use crate::fs::{BucketFs, Operation};
use crate::session::SessionHandle;

use self::inode::{InodeTable, ROOT_INODE};

/// Attribute cache TTL handed to the kernel
const ATTR_TTL: Duration = Duration::from_secs(1);

/// Generation number (not used, always 0)
const GENERATION: u64 = 0;

/// Worker threads of the runtime driving backend calls
const RUNTIME_THREADS: usize = 4;

/// Tracing target of the per-request log enabled by `--debug`
pub const REQUEST_TARGET: &str = "festivus::requests";

fn to_fuse_file_type(kind: NodeKind) -> FuseFileType {
    match kind {
        NodeKind::File => FuseFileType::RegularFile,
        NodeKind::Directory => FuseFileType::Directory,
    }
}

fn to_file_attr(ino: u64, attrs: &FileAttributes) -> FileAttr {
    FileAttr {
        ino,
        size: attrs.size,
        blocks: attrs.blocks,
        atime: system_time(attrs.atime),
        mtime: system_time(attrs.mtime),
        ctime: system_time(attrs.ctime),
        crtime: system_time(attrs.ctime),
        kind: to_fuse_file_type(attrs.kind),
        perm: attrs.perm,
        nlink: attrs.nlink,
        uid: attrs.uid,
        gid: attrs.gid,
        rdev: 0,
        blksize: BLOCK_SIZE as u32,
        flags: 0,
    }
}

fn describe_request(op: &str, unique: u64, ino: u64, uid: u32, gid: u32, pid: u32) -> String {
    format!(
        "unique: {}, opcode: {}, nodeid: {}, uid: {}, gid: {}, pid: {}",
        unique, op, ino, uid, gid, pid
    )
}

/// Log a failed call at a level matching how surprising it is
fn log_failure(op: &str, path: &str, err: &FestivusError) {
    match err {
        FestivusError::NotFound(_) | FestivusError::NotSupported(_) | FestivusError::ReadOnly => {
            debug!("{} {}: {}", op, path, err)
        }
        _ => error!("{} error for {}: {}", op, path, err),
    }
}

/// FUSE filesystem delegating inode-based kernel calls to [`BucketFs`]
pub struct FuseAdapter {
    fs: Arc<BucketFs>,
    inodes: InodeTable,
    /// Dedicated runtime for FUSE async operations
    runtime: tokio::runtime::Runtime,
    log_requests: bool,
}

impl FuseAdapter {
    pub fn new(fs: Arc<BucketFs>) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(RUNTIME_THREADS)
            .thread_name("festivus-fuse")
            .enable_all()
            .build()?;

        Ok(Self {
            fs,
            inodes: InodeTable::new(),
            runtime,
            log_requests: false,
        })
    }

    /// Log every kernel request under [`REQUEST_TARGET`]
    pub fn with_request_logging(mut self, enabled: bool) -> Self {
        self.log_requests = enabled;
        self
    }

    pub fn logs_requests(&self) -> bool {
        self.log_requests
    }

    fn log_request(&self, req: &Request<'_>, op: &str, ino: u64) {
        if self.log_requests {
            trace!(
                target: REQUEST_TARGET,
                "{}",
                describe_request(op, req.unique(), ino, req.uid(), req.gid(), req.pid())
            );
        }
    }

    /// Get path for inode, returning ENOENT if not found
    fn inode_to_path(&self, ino: u64) -> Result<String, i32> {
        self.inodes.path(ino).ok_or(libc::ENOENT)
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Result<String, i32> {
        let name = name.to_str().ok_or(libc::ENOENT)?;
        self.inodes.child_path(parent, name).ok_or(libc::ENOENT)
    }

    /// Errno for an operation the capability table refuses
    fn refused(&self, op: Operation) -> i32 {
        match self.fs.check(op) {
            Err(e) => e.to_errno(),
            Ok(()) => libc::ENOSYS,
        }
    }

    /// Run an async operation on the dedicated FUSE runtime and wait for the result.
    fn run_async<F, T>(&self, future: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        self.runtime.block_on(future)
    }

    fn reply_attr(&self, ino: u64, path: &str, reply: ReplyAttr) {
        match self.run_async(self.fs.getattr(path)) {
            Ok(attrs) => reply.attr(&ATTR_TTL, &to_file_attr(ino, &attrs)),
            Err(e) => {
                log_failure("getattr", path, &e);
                reply.error(e.to_errno());
            }
        }
    }
}

impl Filesystem for FuseAdapter {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), libc::c_int> {
        info!("FUSE session initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        let open = self.fs.sessions().len();
        if open > 0 {
            info!("FUSE session ending with {} open files", open);
        }
    }

    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        self.log_request(req, "lookup", parent);
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        trace!("lookup: {}", path);

        match self.run_async(self.fs.getattr(&path)) {
            Ok(attrs) => {
                let ino = self.inodes.inode_for(&path);
                reply.entry(&ATTR_TTL, &to_file_attr(ino, &attrs), GENERATION);
            }
            Err(e) => {
                log_failure("lookup", &path, &e);
                reply.error(e.to_errno());
            }
        }
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        self.log_request(req, "getattr", ino);
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        trace!("getattr: {} (ino={})", path, ino);
        self.reply_attr(ino, &path, reply);
    }

    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        self.log_request(req, "setattr", ino);
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        if mode.is_some() {
            reply.error(self.refused(Operation::Chmod));
            return;
        }
        if uid.is_some() || gid.is_some() {
            reply.error(self.refused(Operation::Chown));
            return;
        }
        if atime.is_some() || mtime.is_some() {
            reply.error(self.refused(Operation::Utimens));
            return;
        }

        if let Some(new_size) = size {
            trace!("setattr truncate: {} to {} bytes", path, new_size);
            if let Err(e) = self.run_async(self.fs.truncate(&path, new_size)) {
                log_failure("truncate", &path, &e);
                reply.error(e.to_errno());
                return;
            }
        }

        self.reply_attr(ino, &path, reply);
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        self.log_request(req, "open", ino);
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        let write = flags & libc::O_ACCMODE != libc::O_RDONLY;
        debug!("open: {} write={}", path, write);

        match self.run_async(self.fs.open(&path, write)) {
            Ok(handle) => reply.opened(handle.0, 0),
            Err(e) => {
                log_failure("open", &path, &e);
                reply.error(e.to_errno());
            }
        }
    }

    fn read(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        self.log_request(req, "read", ino);
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        trace!("read: {} offset={} size={}", path, offset, size);

        let offset = offset.max(0) as u64;
        match self.run_async(self.fs.read(&path, size, offset)) {
            Ok(data) => reply.data(&data),
            Err(e) => {
                log_failure("read", &path, &e);
                reply.error(e.to_errno());
            }
        }
    }

    fn write(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        self.log_request(req, "write", ino);
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        trace!("write: {} offset={} size={}", path, offset, data.len());

        let offset = offset.max(0) as u64;
        match self.run_async(self.fs.write(&path, data, offset)) {
            Ok(written) => reply.written(written as u32),
            Err(e) => {
                log_failure("write", &path, &e);
                reply.error(e.to_errno());
            }
        }
    }

    fn flush(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        self.log_request(req, "flush", ino);
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        trace!("flush: {}", path);

        match self.run_async(self.fs.flush(&path)) {
            Ok(()) => reply.ok(),
            Err(e) => {
                log_failure("flush", &path, &e);
                reply.error(e.to_errno());
            }
        }
    }

    fn release(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.log_request(req, "release", ino);
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        trace!("release: {} (fh={})", path, fh);

        match self.run_async(self.fs.release(&path, SessionHandle(fh))) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn fsync(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _datasync: bool,
        reply: ReplyEmpty,
    ) {
        self.log_request(req, "fsync", ino);
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        trace!("fsync: {}", path);

        match self.run_async(self.fs.fsync(&path)) {
            Ok(()) => reply.ok(),
            Err(e) => {
                log_failure("fsync", &path, &e);
                reply.error(e.to_errno());
            }
        }
    }

    fn opendir(&mut self, req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        self.log_request(req, "opendir", ino);
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        match self.run_async(self.fs.getattr(&path)) {
            Ok(attrs) if attrs.is_dir() => reply.opened(0, 0),
            Ok(_) => reply.error(libc::ENOTDIR),
            Err(e) => {
                log_failure("opendir", &path, &e);
                reply.error(e.to_errno());
            }
        }
    }

    fn readdir(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        self.log_request(req, "readdir", ino);
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        trace!("readdir: {} offset={}", path, offset);

        let mut entries = match self.run_async(self.fs.readdir(&path)) {
            Ok(entries) => entries,
            Err(e) => {
                log_failure("readdir", &path, &e);
                reply.error(e.to_errno());
                return;
            }
        };
        // Set members come back unordered; offsets must be stable across calls
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        let parent_ino = if ino == ROOT_INODE {
            ROOT_INODE
        } else {
            self.inodes.parent(ino)
        };

        let dots = [
            (ino, FuseFileType::Directory, ".".to_string()),
            (parent_ino, FuseFileType::Directory, "..".to_string()),
        ];
        let children = entries.into_iter().map(|entry| {
            let entry_ino = self.inodes.inode_for(&crate::keys::join(&path, &entry.name));
            (entry_ino, to_fuse_file_type(entry.kind), entry.name)
        });

        for (idx, (entry_ino, kind, name)) in dots.into_iter().chain(children).enumerate() {
            let idx = idx as i64;
            if idx < offset {
                continue;
            }
            if reply.add(entry_ino, idx + 1, kind, &name) {
                // Buffer full
                break;
            }
        }

        reply.ok();
    }

    fn releasedir(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        self.log_request(req, "releasedir", ino);
        reply.ok();
    }

    fn access(&mut self, req: &Request<'_>, ino: u64, _mask: i32, reply: ReplyEmpty) {
        self.log_request(req, "access", ino);
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        match self.run_async(self.fs.getattr(&path)) {
            Ok(_) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn statfs(&mut self, req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        self.log_request(req, "statfs", ino);
        match self.fs.statfs() {
            Ok(s) => reply.statfs(
                s.blocks, s.bfree, s.bavail, s.files, s.ffree, s.bsize, s.namelen, s.frsize,
            ),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readlink(&mut self, req: &Request<'_>, ino: u64, reply: ReplyData) {
        self.log_request(req, "readlink", ino);
        reply.error(self.refused(Operation::Readlink));
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        self.log_request(req, "mknod", parent);
        reply.error(self.refused(Operation::Mknod));
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        self.log_request(req, "create", parent);
        reply.error(self.refused(Operation::Create));
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        self.log_request(req, "mkdir", parent);
        reply.error(self.refused(Operation::Mkdir));
    }

    fn unlink(&mut self, req: &Request<'_>, parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        self.log_request(req, "unlink", parent);
        reply.error(self.refused(Operation::Unlink));
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        self.log_request(req, "rmdir", parent);
        reply.error(self.refused(Operation::Rmdir));
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        _link_name: &OsStr,
        _target: &Path,
        reply: ReplyEntry,
    ) {
        self.log_request(req, "symlink", parent);
        reply.error(self.refused(Operation::Symlink));
    }

    fn link(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _newparent: u64,
        _newname: &OsStr,
        reply: ReplyEntry,
    ) {
        self.log_request(req, "link", ino);
        reply.error(self.refused(Operation::Link));
    }

    fn rename(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        _name: &OsStr,
        _newparent: u64,
        _newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        self.log_request(req, "rename", parent);
        reply.error(self.refused(Operation::Rename));
    }
}
