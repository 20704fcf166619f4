//! Collaborator traits consumed by the snapshot engine
//!
//! The engine never talks to a concrete store, backend or transfer
//! implementation. It is handed trait objects implementing:
//!
//! - `SnapshotMetadataStore`: atomic transactions over snapshot records
//! - `BlockBackend`: local snapshot creation and upload preparation
//! - `SnapshotTransfer`: upload of a prepared resource to object storage
//!
//! Thread safety: all collaborators are shared between concurrently running
//! pipelines and must be `Send + Sync`.

use crate::error::{BackendError, MetadataResult, TransferError};
use crate::types::{SnapshotQuery, SnapshotRecord};

// ============================================================================
// Metadata store
// ============================================================================

/// View of the store inside one transaction
///
/// Reads observe the transaction's own writes. Nothing is visible to other
/// transactions until the enclosing `SnapshotMetadataStore::transaction`
/// commits.
pub trait MetadataTransaction {
    /// Read a record
    fn get(&self, snapshot_id: &str) -> MetadataResult<Option<SnapshotRecord>>;

    /// Stage a write of a whole record
    fn put(&mut self, record: SnapshotRecord) -> MetadataResult<()>;
}

/// Transactional store of snapshot records
pub trait SnapshotMetadataStore: Send + Sync {
    /// Insert a new record
    ///
    /// # Errors
    ///
    /// Returns `MetadataError::AlreadyExists` if the id is taken.
    fn insert(&self, record: SnapshotRecord) -> MetadataResult<()>;

    /// Read the committed state of a record
    fn get(&self, snapshot_id: &str) -> MetadataResult<Option<SnapshotRecord>>;

    /// Run `body` inside a transaction
    ///
    /// If `body` returns `Ok`, all staged writes commit atomically. If it
    /// returns `Err`, nothing is applied and the error is returned. A store
    /// may call `body` more than once when it retries internally.
    fn transaction(
        &self,
        body: &mut dyn FnMut(&mut dyn MetadataTransaction) -> MetadataResult<()>,
    ) -> MetadataResult<()>;

    /// Return all records matching `query`, ordered and limited as requested
    fn find(&self, query: &SnapshotQuery) -> MetadataResult<Vec<SnapshotRecord>>;

    /// Return the first record matching `query` in its ordering
    fn find_first(&self, query: &SnapshotQuery) -> MetadataResult<Option<SnapshotRecord>> {
        let limited = query.clone().limit(1);
        Ok(self.find(&limited)?.into_iter().next())
    }
}

// ============================================================================
// Block backend
// ============================================================================

/// What an upload resource contains
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceKind {
    /// Entire snapshot content
    Full,
    /// Difference against `parent_snapshot_id`
    Incremental {
        /// Delta parent
        parent_snapshot_id: String,
    },
}

/// Upload-ready resource handed from the backend to the transfer layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageResource {
    /// Snapshot the resource belongs to
    pub snapshot_id: String,
    /// Backend-specific path or device the transfer layer reads from
    pub path: String,
    /// Content size in bytes
    pub size_bytes: u64,
    /// Full or incremental content
    pub kind: ResourceKind,
}

/// Backend work to run after a successful upload of an incremental resource
///
/// Typically merges or releases intermediate backend state.
pub type PostUploadCallback =
    Box<dyn FnOnce(&StorageResource) -> Result<(), BackendError> + Send + 'static>;

/// Result of preparing an incremental upload
pub struct PreparedUpload {
    /// Resource to upload
    pub resource: StorageResource,
    /// Optional work to run once the upload succeeded
    pub callback: Option<PostUploadCallback>,
}

impl PreparedUpload {
    /// Resource without a post-upload callback
    pub fn new(resource: StorageResource) -> Self {
        Self {
            resource,
            callback: None,
        }
    }

    /// Attach a post-upload callback
    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&StorageResource) -> Result<(), BackendError> + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }
}

impl std::fmt::Debug for PreparedUpload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedUpload")
            .field("resource", &self.resource)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// Hypervisor/storage driver performing the actual snapshot I/O
pub trait BlockBackend: Send + Sync {
    /// Create the local snapshot of `volume_id`
    fn create_local_snapshot(
        &self,
        volume_id: &str,
        snapshot_id: &str,
        snap_point_id: Option<&str>,
    ) -> Result<(), BackendError>;

    /// Whether the backend can produce incremental upload resources
    fn supports_incremental_snapshots(&self) -> bool;

    /// Prepare the full snapshot content for upload
    ///
    /// `Ok(None)` means the backend had nothing to upload, which the
    /// pipeline treats as fatal.
    fn prepare_full_upload(
        &self,
        volume_id: &str,
        snapshot_id: &str,
        snap_point_id: Option<&str>,
    ) -> Result<Option<StorageResource>, BackendError>;

    /// Prepare the delta between `parent_snapshot_id` and `snapshot_id`
    fn prepare_incremental_upload(
        &self,
        volume_id: &str,
        snapshot_id: &str,
        snap_point_id: Option<&str>,
        parent_snapshot_id: &str,
        parent_snap_point_id: Option<&str>,
    ) -> Result<Option<PreparedUpload>, BackendError>;

    /// Release backend resources tied to the local snapshot
    fn finalize_local_snapshot(&self, snapshot_id: &str) -> Result<(), BackendError>;
}

// ============================================================================
// Transfer
// ============================================================================

/// Opaque handle returned by a successful upload (e.g. an etag)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentHandle(pub String);

impl ContentHandle {
    /// Get the handle string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Receives upload progress as a percentage of the resource (0..=100)
pub trait ProgressSink: Send + Sync {
    /// Report upload progress
    fn update(&self, percent: u8);
}

/// Moves prepared resources into object storage
pub trait SnapshotTransfer: Send + Sync {
    /// Prepare the destination (credentials, bucket) and return the bucket name
    fn prepare_destination(&self, snapshot_id: &str) -> Result<String, TransferError>;

    /// Upload `resource`, blocking until completion, failure or timeout
    fn upload(
        &self,
        snapshot_id: &str,
        resource: &StorageResource,
        progress: &dyn ProgressSink,
    ) -> Result<ContentHandle, TransferError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource() -> StorageResource {
        StorageResource {
            snapshot_id: "snap-2".into(),
            path: "/dev/snap-2".into(),
            size_bytes: 4096,
            kind: ResourceKind::Incremental {
                parent_snapshot_id: "snap-1".into(),
            },
        }
    }

    #[test]
    fn test_prepared_upload_callback_runs_once() {
        let prepared = PreparedUpload::new(resource()).with_callback(|r| {
            assert_eq!(r.snapshot_id, "snap-2");
            Ok(())
        });
        assert!(format!("{:?}", prepared).contains("callback: true"));

        let PreparedUpload { resource, callback } = prepared;
        let callback = callback.expect("callback attached");
        assert!(callback(&resource).is_ok());
    }

    #[test]
    fn test_content_handle_display() {
        let handle = ContentHandle("etag-1".into());
        assert_eq!(handle.to_string(), "etag-1");
        assert_eq!(handle.as_str(), "etag-1");
    }
}
