use std::path::Path;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiskError {
    /// The mount point is backed by a device that is not a dm-crypt volume.
    #[error("no dm-crypt UUID for mount point")]
    NoDmUuid,
    #[error("cannot find mount point {0}")]
    MountPointNotFound(String),
    #[error("{0}")]
    Other(String),
}

/// Resolves mount points to the UUID of the encrypted volume behind them.
pub trait DiskResolver: Send + Sync {
    fn dm_crypt_uuid_from_mount_point(&self, mount_point: &Path) -> Result<String, DiskError>;
}
