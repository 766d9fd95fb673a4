use std::io;
use thiserror::Error;

/// Main error type for festivus operations
#[derive(Error, Debug)]
pub enum FestivusError {
    #[error("Path not found: {0}")]
    NotFound(String),

    /// An index key holds a different data type than the command expects
    #[error("Index key holds the wrong type: {0}")]
    TypeMismatch(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    #[error("Resource busy: {0}")]
    Busy(String),

    /// A content operation arrived for a path that has no open session
    #[error("No open session for {0}")]
    NoSession(String),

    #[error("File too large: {0}")]
    FileTooLarge(String),

    #[error("Read-only filesystem")]
    ReadOnly,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Corrupt attribute record at {key}: {reason}")]
    CorruptRecord { key: String, reason: String },

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl FestivusError {
    /// Convert error to libc errno for FUSE responses
    pub fn to_errno(&self) -> i32 {
        match self {
            FestivusError::NotFound(_) => libc::ENOENT,
            FestivusError::TypeMismatch(_) => libc::EIO,
            FestivusError::BackendUnavailable(_) => libc::EIO,
            FestivusError::NotSupported(_) => libc::ENOSYS,
            FestivusError::NotADirectory(_) => libc::ENOTDIR,
            FestivusError::IsADirectory(_) => libc::EISDIR,
            FestivusError::Busy(_) => libc::EBUSY,
            FestivusError::NoSession(_) => libc::ENOENT,
            FestivusError::FileTooLarge(_) => libc::EFBIG,
            FestivusError::ReadOnly => libc::EROFS,
            FestivusError::PermissionDenied(_) => libc::EACCES,
            FestivusError::InvalidPath(_) => libc::EINVAL,
            FestivusError::CorruptRecord { .. } => libc::EIO,
            FestivusError::Backend(_) => libc::EIO,
            FestivusError::Config(_) => libc::EINVAL,
            FestivusError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// Whether retrying the failed call may succeed.
    ///
    /// Only connectivity failures qualify; missing paths, permission
    /// and type errors are answered the same way on every attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, FestivusError::BackendUnavailable(_))
    }
}

/// Result type alias for festivus operations
pub type Result<T> = std::result::Result<T, FestivusError>;
