//! SnapVault - snapshot creation with incremental delta chains
//!
//! SnapVault turns pending snapshot records into uploaded snapshots: it
//! creates the local snapshot through a block backend, decides whether the
//! upload can be a delta of an earlier snapshot of the same volume, uploads
//! through a transfer layer and commits the terminal status.
//!
//! # Quick Start
//!
//! ```ignore
//! use snapvault::{CreateSnapshotRequest, SnapshotCreator, SharedConfig, LockRegistry};
//!
//! let creator = SnapshotCreator::new(store, backend, transfer, locks, config);
//! let outcome = creator.create_snapshot(&CreateSnapshotRequest::new("vol-1", "snap-1"));
//! ```
//!
//! # Architecture
//!
//! - `snapvault-core`: records, errors, collaborator traits, configuration
//! - `snapvault-concurrency`: per-identifier lock registry
//! - `snapvault-storage`: in-memory metadata store
//! - `snapvault-engine`: pipeline, delta resolver, scheduler

pub use snapvault_concurrency::{LockError, LockRegistry, ResourceGuard};
pub use snapvault_core::*;
pub use snapvault_engine::*;
pub use snapvault_storage::InMemoryMetadataStore;
