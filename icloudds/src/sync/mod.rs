pub mod backoff;
pub mod executor;
pub mod filter;
pub mod local_scan;
#[cfg(test)]
pub(crate) mod mock_drive;
pub mod plan;
pub mod reconcile;
pub mod remote_scan;
pub mod replica;
pub mod scheduler;
pub mod statedump;
pub mod suppress;
pub mod watcher;

use icloud_core::{ApiErrorClass, DriveError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("drive error: {0}")]
    Drive(#[from] DriveError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("refresh inconsistent: declared {declared} files, counted {counted}")]
    RefreshInconsistent { declared: u64, counted: u64 },
    #[error("no remote handle for {0}")]
    MissingHandle(String),
    #[error("path contains unsupported component: {0}")]
    UnsupportedPath(String),
}

impl SyncError {
    /// Worth retrying with backoff: network hiccups, 5xx, zone conflicts.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Drive(err) => err.is_retryable(),
            SyncError::Io(err) => !matches!(
                err.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
            ),
            _ => false,
        }
    }

    /// Credentials went bad; remote work must pause until re-auth.
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            SyncError::Drive(err) if err.classification() == ApiErrorClass::Auth
        )
    }
}
