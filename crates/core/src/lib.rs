//! Core types and traits for SnapVault
//!
//! This crate defines the foundational pieces used throughout the system:
//! - SnapshotRecord / SnapshotStatus: the snapshot data model
//! - SnapshotQuery / StatusFilter: predicates over snapshot records
//! - Error: error hierarchy for the engine and its collaborators
//! - Traits: collaborator contracts (metadata store, block backend, transfer)
//! - Config: `snapvault.toml` settings and the shared runtime handle

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::{
    SharedConfig, SnapshotConfig, CONFIG_FILE_NAME, DEFAULT_DELTA_RESOLUTION_ATTEMPTS,
    DEFAULT_LOCATION_SCHEME,
};
pub use error::{
    BackendError, MetadataError, MetadataResult, SnapshotError, SnapshotResult, TransferError,
};
pub use traits::{
    BlockBackend, ContentHandle, MetadataTransaction, PostUploadCallback, PreparedUpload,
    ProgressSink, ResourceKind, SnapshotMetadataStore, SnapshotTransfer, StorageResource,
};
pub use types::{
    QueryOrder, SnapshotQuery, SnapshotRecord, SnapshotStatus, StatusFilter, MAX_PROGRESS,
};
