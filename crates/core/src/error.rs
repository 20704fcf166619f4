//! Error types for snapvault
//!
//! This module defines the error hierarchy used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! Collaborator errors (`MetadataError`, `BackendError`, `TransferError`) are
//! produced by the metadata store, the block backend and the transfer layer.
//! The creation pipeline translates them into `SnapshotError` at its boundary.
//!
//! | Variant | Effect on the record |
//! |---------|----------------------|
//! | `LockAcquisitionFailed` | left `pending` for external retry |
//! | `BackendOperationFailed` | marked `failed` |
//! | `TransferFailed` | marked `failed` |
//! | `MetadataUpdateFailed` | retried during delta resolution, logged during terminal commit |
//! | `AlreadyFailed` | untouched |
//! | `SnapshotNotFound` / `NotPending` | untouched |

use crate::types::SnapshotStatus;
use thiserror::Error;

/// Result type alias for engine operations
pub type SnapshotResult<T> = std::result::Result<T, SnapshotError>;

/// Result type alias for metadata store operations
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;

/// Errors reported by a snapshot metadata store
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetadataError {
    /// Record does not exist
    #[error("snapshot record not found: {0}")]
    NotFound(String),

    /// Record already exists (insert)
    #[error("snapshot record already exists: {0}")]
    AlreadyExists(String),

    /// Transaction conflicted with a concurrent writer
    #[error("transaction conflict: {0}")]
    Conflict(String),

    /// Store cannot be reached
    #[error("metadata store unavailable: {0}")]
    Unavailable(String),

    /// Status transition violates the one-way lifecycle
    #[error("invalid status transition for {snapshot_id}: {from} -> {to}")]
    InvalidTransition {
        /// Record being updated
        snapshot_id: String,
        /// Current status
        from: SnapshotStatus,
        /// Requested status
        to: SnapshotStatus,
    },

    /// Transaction body asked for rollback
    #[error("transaction rolled back: {0}")]
    RolledBack(String),
}

impl MetadataError {
    /// Check if retrying the transaction could succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, MetadataError::Conflict(_) | MetadataError::Unavailable(_))
    }
}

/// Errors reported by a block-storage backend
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// Backend operation failed
    #[error("backend error: {0}")]
    Failed(String),

    /// Volume or snapshot unknown to the backend
    #[error("backend resource not found: {0}")]
    NotFound(String),

    /// Backend did not answer in time
    #[error("backend operation timed out")]
    Timeout,
}

/// Errors reported by the snapshot transfer layer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    /// Upload (or destination preparation) did not finish in time
    #[error("transfer timed out after {elapsed_ms}ms")]
    Timeout {
        /// Time spent before giving up
        elapsed_ms: u64,
    },

    /// Upload failed
    #[error("transfer failed: {0}")]
    Failed(String),

    /// Destination could not be prepared
    #[error("invalid upload destination: {0}")]
    InvalidDestination(String),
}

/// Errors surfaced by the snapshot creation engine
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    /// Waiting for a resource lock was interrupted or timed out
    #[error("failed to acquire lock for {resource_id}: {reason}")]
    LockAcquisitionFailed {
        /// Volume or snapshot id
        resource_id: String,
        /// Why the wait ended
        reason: String,
    },

    /// Backend create/prepare/finalize failed
    #[error("backend operation '{operation}' failed for snapshot {snapshot_id}: {reason}")]
    BackendOperationFailed {
        /// Backend operation name
        operation: &'static str,
        /// Snapshot being created
        snapshot_id: String,
        /// Underlying cause
        reason: String,
    },

    /// Upload failed or timed out
    #[error("transfer of snapshot {snapshot_id} failed: {source}")]
    TransferFailed {
        /// Snapshot being uploaded
        snapshot_id: String,
        /// Underlying transfer error
        #[source]
        source: TransferError,
    },

    /// Metadata transaction failed
    #[error("metadata update failed for snapshot {snapshot_id}: {source}")]
    MetadataUpdateFailed {
        /// Record being updated
        snapshot_id: String,
        /// Underlying store error
        #[source]
        source: MetadataError,
    },

    /// Record was already marked failed
    #[error("snapshot {0} is already marked as failed")]
    AlreadyFailed(String),

    /// Record does not exist
    #[error("snapshot {0} not found")]
    SnapshotNotFound(String),

    /// Record is not pending (already processed)
    #[error("snapshot {snapshot_id} is {status}, expected pending")]
    NotPending {
        /// Record id
        snapshot_id: String,
        /// Status found
        status: SnapshotStatus,
    },

    /// Configuration could not be loaded or is invalid
    #[error("configuration error: {0}")]
    Config(String),
}

impl SnapshotError {
    /// Create a backend error for `operation`
    pub fn backend(
        operation: &'static str,
        snapshot_id: impl Into<String>,
        reason: impl std::fmt::Display,
    ) -> Self {
        SnapshotError::BackendOperationFailed {
            operation,
            snapshot_id: snapshot_id.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a transfer error
    pub fn transfer(snapshot_id: impl Into<String>, source: TransferError) -> Self {
        SnapshotError::TransferFailed {
            snapshot_id: snapshot_id.into(),
            source,
        }
    }

    /// Create a metadata error
    pub fn metadata(snapshot_id: impl Into<String>, source: MetadataError) -> Self {
        SnapshotError::MetadataUpdateFailed {
            snapshot_id: snapshot_id.into(),
            source,
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        SnapshotError::Config(msg.into())
    }

    /// True if the record is left untouched and the job may be rescheduled
    pub fn is_retryable(&self) -> bool {
        matches!(self, SnapshotError::LockAcquisitionFailed { .. })
    }

    /// True if the error should drive the record to `failed`
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SnapshotError::BackendOperationFailed { .. }
                | SnapshotError::TransferFailed { .. }
                | SnapshotError::MetadataUpdateFailed { .. }
                | SnapshotError::AlreadyFailed(_)
        )
    }

    /// Stable short name, used as a structured log field
    pub fn kind(&self) -> &'static str {
        match self {
            SnapshotError::LockAcquisitionFailed { .. } => "LockAcquisitionFailed",
            SnapshotError::BackendOperationFailed { .. } => "BackendOperationFailed",
            SnapshotError::TransferFailed { .. } => "TransferFailed",
            SnapshotError::MetadataUpdateFailed { .. } => "MetadataUpdateFailed",
            SnapshotError::AlreadyFailed(_) => "AlreadyFailed",
            SnapshotError::SnapshotNotFound(_) => "SnapshotNotFound",
            SnapshotError::NotPending { .. } => "NotPending",
            SnapshotError::Config(_) => "Config",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_backend() {
        let err = SnapshotError::backend("create_local_snapshot", "snap-1", BackendError::Timeout);
        let msg = err.to_string();
        assert!(msg.contains("create_local_snapshot"));
        assert!(msg.contains("snap-1"));
        assert!(msg.contains("timed out"));
    }

    #[test]
    fn test_error_display_transfer_timeout() {
        let err = SnapshotError::transfer("snap-2", TransferError::Timeout { elapsed_ms: 3000 });
        let msg = err.to_string();
        assert!(msg.contains("snap-2"));
        assert!(msg.contains("3000ms"));
    }

    #[test]
    fn test_error_source_chain() {
        use std::error::Error as _;
        let err = SnapshotError::metadata("snap-1", MetadataError::Conflict("row".into()));
        let source = err.source().expect("metadata error has a source");
        assert!(source.to_string().contains("conflict"));
    }

    #[test]
    fn test_invalid_transition_display() {
        let err = MetadataError::InvalidTransition {
            snapshot_id: "snap-1".into(),
            from: SnapshotStatus::Failed,
            to: SnapshotStatus::Available,
        };
        assert_eq!(
            err.to_string(),
            "invalid status transition for snap-1: failed -> available"
        );
    }

    #[test]
    fn test_classification() {
        let lock = SnapshotError::LockAcquisitionFailed {
            resource_id: "vol-1".into(),
            reason: "timed out".into(),
        };
        assert!(lock.is_retryable());
        assert!(!lock.is_fatal());

        let transfer = SnapshotError::transfer("s", TransferError::Failed("io".into()));
        assert!(transfer.is_fatal());
        assert!(!transfer.is_retryable());

        assert!(!SnapshotError::SnapshotNotFound("s".into()).is_fatal());
    }

    #[test]
    fn test_metadata_transient() {
        assert!(MetadataError::Conflict("x".into()).is_transient());
        assert!(MetadataError::Unavailable("x".into()).is_transient());
        assert!(!MetadataError::NotFound("x".into()).is_transient());
    }

    #[test]
    fn test_error_pattern_matching() {
        let err = SnapshotError::NotPending {
            snapshot_id: "snap-1".into(),
            status: SnapshotStatus::Available,
        };

        match err {
            SnapshotError::NotPending { snapshot_id, status } => {
                assert_eq!(snapshot_id, "snap-1");
                assert_eq!(status, SnapshotStatus::Available);
            }
            _ => panic!("Wrong error variant"),
        }
    }
}
