//! Snapshot creation engine for snapvault
//!
//! This crate orchestrates the lower layers:
//! - SnapshotCreator: the creation pipeline (local snapshot, delta
//!   resolution, upload, finalization, terminal commit)
//! - DeltaChainResolver: delta parent selection and chain depth
//! - transitions: transactional record updates
//! - ProgressTracker: progress checkpoints on the record
//! - SnapshotScheduler: worker pool running creation jobs
//!
//! The engine is the only component that talks to all three collaborators
//! (metadata store, block backend, transfer).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod background;
pub mod pipeline;
pub mod progress;
pub mod resolver;
pub mod testing;
pub mod transitions;

pub use background::{JobHandle, SchedulerError, SchedulerStats, SnapshotScheduler};
pub use pipeline::{
    CreateSnapshotRequest, CreatorMetrics, PipelineStage, SnapshotCreator, SnapshotOutcome,
    SnapshotSummary, UploadKind,
};
pub use progress::{ProgressTracker, LOCAL_SNAPSHOT_PROGRESS, UPLOAD_CEILING};
pub use resolver::{
    chain_depth, snapshot_chain, DeltaChainResolver, DeltaDecision, NoDeltaReason, ParentSearch,
};
pub use transitions::Assignment;
