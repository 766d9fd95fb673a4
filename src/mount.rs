//! Mount lifecycle
//!
//! A foreground mount runs the FUSE session loop on the calling thread
//! until the filesystem is unmounted. A background mount runs it on its
//! own thread and unmounts when the returned [`ActiveMount`] is dropped.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use fuser::MountOption;
use tracing::info;

use crate::error::{FestivusError, Result};
use crate::fs::BucketFs;
use crate::fuse::FuseAdapter;

/// Name shown as the mount source
pub const FS_NAME: &str = "festivus";

/// Represents an active background mount
pub struct ActiveMount {
    pub path: PathBuf,
    session: Option<fuser::BackgroundSession>,
}

impl ActiveMount {
    pub fn unmount(&mut self) {
        if let Some(session) = self.session.take() {
            info!("Unmounting {:?}", self.path);
            drop(session);
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.session.is_some()
    }
}

impl Drop for ActiveMount {
    fn drop(&mut self) {
        self.unmount();
    }
}

/// Kernel mount options for a bucket mount
pub fn mount_options(bucket: &str, read_only: bool) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::FSName(FS_NAME.to_string()),
        MountOption::Subtype(bucket.to_string()),
        MountOption::AutoUnmount,
        MountOption::AllowOther,
        MountOption::DefaultPermissions,
        MountOption::NoExec,
    ];
    if read_only {
        options.push(MountOption::RO);
    } else {
        options.push(MountOption::RW);
    }
    options
}

/// Ensure `path` exists and is a directory
pub fn check_mount_point(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(FestivusError::NotFound(format!(
            "Mount point does not exist: {:?}",
            path
        )));
    }
    if !path.is_dir() {
        return Err(FestivusError::NotADirectory(format!(
            "Mount point is not a directory: {:?}",
            path
        )));
    }
    Ok(())
}

/// Serve `fs` at `path`, blocking until it is unmounted.
///
/// `log_requests` traces every kernel request under
/// [`REQUEST_TARGET`](crate::fuse::REQUEST_TARGET).
pub fn mount_foreground(
    fs: Arc<BucketFs>,
    path: &Path,
    options: &[MountOption],
    log_requests: bool,
) -> Result<()> {
    check_mount_point(path)?;
    let adapter = FuseAdapter::new(fs)?.with_request_logging(log_requests);

    info!("Serving at {:?} in the foreground", path);
    fuser::mount2(adapter, path, options)?;
    info!("{:?} unmounted", path);
    Ok(())
}

/// Serve `fs` at `path` from a background thread
pub fn mount_background(
    fs: Arc<BucketFs>,
    path: &Path,
    options: &[MountOption],
    log_requests: bool,
) -> Result<ActiveMount> {
    check_mount_point(path)?;
    let adapter = FuseAdapter::new(fs)?.with_request_logging(log_requests);

    let session = fuser::spawn_mount2(adapter, path, options)?;
    info!("Successfully mounted at {:?}", path);
    Ok(ActiveMount {
        path: path.to_path_buf(),
        session: Some(session),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_options() {
        let rw = mount_options("photos", false);
        assert!(rw.contains(&MountOption::FSName("festivus".to_string())));
        assert!(rw.contains(&MountOption::Subtype("photos".to_string())));
        assert!(rw.contains(&MountOption::RW));
        assert!(!rw.contains(&MountOption::RO));

        let ro = mount_options("photos", true);
        assert!(ro.contains(&MountOption::RO));
    }

    #[test]
    fn test_check_mount_point() {
        let dir = tempfile::tempdir().unwrap();
        assert!(check_mount_point(dir.path()).is_ok());

        let missing = dir.path().join("missing");
        assert!(matches!(
            check_mount_point(&missing),
            Err(FestivusError::NotFound(_))
        ));

        let file = dir.path().join("file");
        std::fs::write(&file, b"x").unwrap();
        assert!(matches!(
            check_mount_point(&file),
            Err(FestivusError::NotADirectory(_))
        ));
    }
}
