//! The error taxonomy of §7, as a `thiserror` sum type. Call sites that
//! only need to propagate with context reach for `anyhow::Result` instead
//! (the daemon binary, scan-pass orchestration) — this enum exists for the
//! places that need to branch on *which* kind of failure occurred, per
//! §7's propagation policy ("the worker converts all network errors into
//! retry later... the queue layer distinguishes fatal from retryable").

use cloud_api::CloudApiError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("catalog error: {0}")]
    Catalog(#[from] rusqlite::Error),

    #[error(transparent)]
    CloudApi(#[from] CloudApiError),

    #[error("local I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cross-device boundary at {0}, refusing to recurse")]
    CrossDevice(camino::Utf8PathBuf),

    #[error("catalog invariant violated: {0}")]
    InvariantViolation(String),

    #[error("disk quota exceeded")]
    DiskFull,

    #[error("path ignored: {0}")]
    Ignored(camino::Utf8PathBuf),

    #[error("upload integrity check failed: {0}")]
    UploadVerificationFailed(String),
}

/// The coarse classification §7 asks the propagation layer to make.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Sleep and retry the same item without dropping it.
    RetryLater,
    /// Drop the item (task and/or catalog row) permanently.
    Fatal,
    /// Surface to the host application via a status/event callback.
    UserVisible,
}

impl SyncError {
    pub fn severity(&self) -> Severity {
        match self {
            SyncError::CloudApi(e) if e.requires_relogin() => Severity::UserVisible,
            SyncError::CloudApi(e) if !e.is_temporary() => Severity::Fatal,
            SyncError::CloudApi(_) => Severity::RetryLater,
            SyncError::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => Severity::Fatal,
                _ => Severity::RetryLater,
            },
            SyncError::DiskFull => Severity::UserVisible,
            SyncError::CrossDevice(_) | SyncError::Ignored(_) => Severity::Fatal,
            // §4.6 step 6/7: a size or SHA-1 mismatch after upload means the
            // copy-plan or the wire transfer was corrupted in transit, not
            // that the catalog itself is inconsistent — retry the task.
            SyncError::UploadVerificationFailed(_) => Severity::RetryLater,
            SyncError::Catalog(_) | SyncError::InvariantViolation(_) => {
                // §7: assert-and-abort in debug, log-and-abandon in release.
                if cfg!(debug_assertions) {
                    panic!("catalog invariant violation: {self}");
                }
                Severity::Fatal
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relogin_required_is_user_visible() {
        let err = SyncError::CloudApi(CloudApiError::Application {
            code: 2000,
            message: "relogin".into(),
        });
        assert_eq!(err.severity(), Severity::UserVisible);
    }

    #[test]
    fn permanent_application_error_is_fatal() {
        let err = SyncError::CloudApi(CloudApiError::Application {
            code: 2005,
            message: "conflict".into(),
        });
        assert_eq!(err.severity(), Severity::Fatal);
    }

    #[test]
    fn missing_local_file_is_fatal_not_retried() {
        let err = SyncError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert_eq!(err.severity(), Severity::Fatal);
    }
}
