//! Snapshot creation pipeline
//!
//! `SnapshotCreator::create_snapshot` drives one pending record through:
//!
//! ```text
//! Created -> LocalSnapshotting -> DeltaResolving -> Preparing -> Transferring
//!         -> Finalizing -> Available
//! ```
//!
//! with `Failed` reachable from every non-terminal stage. Delta resolution,
//! preparation and transfer only run when uploads are enabled.
//!
//! Errors from any stage are caught once, logged, and turned into the
//! failure commit. The entry point never panics and never returns `Err`;
//! the caller gets a `SnapshotOutcome`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use snapvault_concurrency::LockRegistry;
use snapvault_core::{
    BlockBackend, ContentHandle, MetadataError, PreparedUpload, SharedConfig, SnapshotConfig,
    SnapshotError, SnapshotMetadataStore, SnapshotRecord, SnapshotResult, SnapshotStatus,
    SnapshotTransfer, TransferError,
};
use tracing::{debug, error, info, trace, warn};

use crate::progress::ProgressTracker;
use crate::resolver::{DeltaChainResolver, DeltaDecision};
use crate::transitions;

/// Stages of one creation run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    /// Preflight and destination preparation
    Created,
    /// Creating the local snapshot under the volume lock
    LocalSnapshotting,
    /// Choosing and committing a delta parent
    DeltaResolving,
    /// Backend preparing the upload resource
    Preparing,
    /// Uploading to object storage
    Transferring,
    /// Releasing backend resources
    Finalizing,
    /// Committing the terminal status
    Committing,
}

impl PipelineStage {
    /// Stable stage name
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Created => "created",
            PipelineStage::LocalSnapshotting => "local_snapshotting",
            PipelineStage::DeltaResolving => "delta_resolving",
            PipelineStage::Preparing => "preparing",
            PipelineStage::Transferring => "transferring",
            PipelineStage::Finalizing => "finalizing",
            PipelineStage::Committing => "committing",
        }
    }
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request to turn a pending record into a snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSnapshotRequest {
    /// Volume to snapshot
    pub volume_id: String,
    /// Pre-existing pending record
    pub snapshot_id: String,
    /// Backend snap point, overriding the one stored on the record
    pub snap_point_id: Option<String>,
}

impl CreateSnapshotRequest {
    /// Request without a snap point
    pub fn new(volume_id: impl Into<String>, snapshot_id: impl Into<String>) -> Self {
        Self {
            volume_id: volume_id.into(),
            snapshot_id: snapshot_id.into(),
            snap_point_id: None,
        }
    }

    /// Set the snap point (builder style)
    pub fn with_snap_point(mut self, snap_point_id: impl Into<String>) -> Self {
        self.snap_point_id = Some(snap_point_id.into());
        self
    }
}

/// What a successful run uploaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadKind {
    /// Uploads disabled; the snapshot only exists locally
    LocalOnly,
    /// Full upload, new chain origin
    Full,
    /// Delta upload on top of `parent_snapshot_id`
    Incremental {
        /// Parent snapshot
        parent_snapshot_id: String,
        /// Chain depth behind the parent
        depth: usize,
    },
}

/// Summary of a successful run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotSummary {
    /// Record as committed `available`
    pub record: SnapshotRecord,
    /// Upload shape
    pub upload: UploadKind,
    /// Handle returned by the transfer, if one happened
    pub content: Option<ContentHandle>,
}

/// Result of `SnapshotCreator::create_snapshot`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotOutcome {
    /// Record committed `available`
    Available(SnapshotSummary),
    /// Run failed at `stage`; the record was marked `failed` (best effort)
    Failed {
        /// Stage that failed
        stage: PipelineStage,
        /// Cause
        error: SnapshotError,
    },
    /// Nothing was written; the record is as it was
    Aborted(SnapshotError),
}

impl SnapshotOutcome {
    /// True for `Available`
    pub fn is_available(&self) -> bool {
        matches!(self, SnapshotOutcome::Available(_))
    }

    /// True for `Failed`
    pub fn is_failed(&self) -> bool {
        matches!(self, SnapshotOutcome::Failed { .. })
    }

    /// True for `Aborted`
    pub fn is_aborted(&self) -> bool {
        matches!(self, SnapshotOutcome::Aborted(_))
    }

    /// Error behind a failed or aborted run
    pub fn error(&self) -> Option<&SnapshotError> {
        match self {
            SnapshotOutcome::Available(_) => None,
            SnapshotOutcome::Failed { error, .. } | SnapshotOutcome::Aborted(error) => Some(error),
        }
    }
}

/// Creation counters
///
/// Observational only, read with Relaxed ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CreatorMetrics {
    /// Runs started
    pub total_started: u64,
    /// Runs that committed `available`
    pub total_available: u64,
    /// Runs that failed
    pub total_failed: u64,
    /// Runs aborted without writing
    pub total_aborted: u64,
    /// Delta uploads
    pub delta_uploads: u64,
    /// Full uploads
    pub full_uploads: u64,
}

impl CreatorMetrics {
    /// Runs that reached a terminal outcome
    pub fn total_completed(&self) -> u64 {
        self.total_available + self.total_failed + self.total_aborted
    }
}

/// Stage failure, split by whether anything was written
enum StageError {
    /// Nothing happened yet; leave the record alone
    Abort(SnapshotError),
    /// Drive the record to `failed`
    Fail(SnapshotError),
}

impl From<SnapshotError> for StageError {
    fn from(e: SnapshotError) -> Self {
        StageError::Fail(e)
    }
}

/// Per-run bookkeeping
struct Run {
    stage: PipelineStage,
    local_created: bool,
    finalize_attempted: bool,
}

/// Drives snapshot creation
pub struct SnapshotCreator {
    store: Arc<dyn SnapshotMetadataStore>,
    backend: Arc<dyn BlockBackend>,
    transfer: Arc<dyn SnapshotTransfer>,
    locks: Arc<LockRegistry>,
    config: SharedConfig,
    resolver: DeltaChainResolver,
    total_started: AtomicU64,
    total_available: AtomicU64,
    total_failed: AtomicU64,
    total_aborted: AtomicU64,
    delta_uploads: AtomicU64,
    full_uploads: AtomicU64,
}

impl SnapshotCreator {
    /// Create a creator over its collaborators
    ///
    /// `locks` is shared by every creator that may touch the same volumes.
    pub fn new(
        store: Arc<dyn SnapshotMetadataStore>,
        backend: Arc<dyn BlockBackend>,
        transfer: Arc<dyn SnapshotTransfer>,
        locks: Arc<LockRegistry>,
        config: SharedConfig,
    ) -> Self {
        let resolver = DeltaChainResolver::new(Arc::clone(&store), Arc::clone(&locks));
        Self {
            store,
            backend,
            transfer,
            locks,
            config,
            resolver,
            total_started: AtomicU64::new(0),
            total_available: AtomicU64::new(0),
            total_failed: AtomicU64::new(0),
            total_aborted: AtomicU64::new(0),
            delta_uploads: AtomicU64::new(0),
            full_uploads: AtomicU64::new(0),
        }
    }

    /// Shared configuration handle
    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    /// Lock registry used for volume and parent locks
    pub fn locks(&self) -> &Arc<LockRegistry> {
        &self.locks
    }

    /// Counter snapshot
    pub fn metrics(&self) -> CreatorMetrics {
        CreatorMetrics {
            total_started: self.total_started.load(Ordering::Relaxed),
            total_available: self.total_available.load(Ordering::Relaxed),
            total_failed: self.total_failed.load(Ordering::Relaxed),
            total_aborted: self.total_aborted.load(Ordering::Relaxed),
            delta_uploads: self.delta_uploads.load(Ordering::Relaxed),
            full_uploads: self.full_uploads.load(Ordering::Relaxed),
        }
    }

    /// Run the pipeline for `request`
    ///
    /// The record must exist and be `pending`. Configuration is read once,
    /// at the start of the run.
    pub fn create_snapshot(&self, request: &CreateSnapshotRequest) -> SnapshotOutcome {
        self.total_started.fetch_add(1, Ordering::Relaxed);
        trace!(
            target: "snapvault::pipeline",
            snapshot_id = %request.snapshot_id,
            volume_id = %request.volume_id,
            "Starting snapshot creation task"
        );

        let config = self.config.current();
        let outcome = match self.preflight(request) {
            Err(e) => self.abort(request, e),
            Ok(record) => {
                let mut run = Run {
                    stage: PipelineStage::Created,
                    local_created: false,
                    finalize_attempted: false,
                };
                match self.run_stages(request, &record, &config, &mut run) {
                    Ok((upload, content)) => {
                        run.stage = PipelineStage::Committing;
                        self.commit_available(request, &mut run, upload, content)
                    }
                    Err(StageError::Abort(e)) => self.abort(request, e),
                    Err(StageError::Fail(e)) => self.fail(request, &mut run, e),
                }
            }
        };

        trace!(
            target: "snapvault::pipeline",
            snapshot_id = %request.snapshot_id,
            "Finished snapshot creation task"
        );
        outcome
    }

    /// Read the record; only `pending` records proceed
    fn preflight(&self, request: &CreateSnapshotRequest) -> SnapshotResult<SnapshotRecord> {
        let id = &request.snapshot_id;
        let record = self
            .store
            .get(id)
            .map_err(|e| SnapshotError::metadata(id.as_str(), e))?
            .ok_or_else(|| SnapshotError::SnapshotNotFound(id.clone()))?;

        match record.status {
            SnapshotStatus::Pending => Ok(record),
            SnapshotStatus::Failed => Err(SnapshotError::AlreadyFailed(id.clone())),
            status => Err(SnapshotError::NotPending {
                snapshot_id: id.clone(),
                status,
            }),
        }
    }

    fn run_stages(
        &self,
        request: &CreateSnapshotRequest,
        record: &SnapshotRecord,
        config: &SnapshotConfig,
        run: &mut Run,
    ) -> Result<(UploadKind, Option<ContentHandle>), StageError> {
        let id = request.snapshot_id.as_str();
        let snap_point = request
            .snap_point_id
            .clone()
            .or_else(|| record.snap_point_id.clone());
        let progress = ProgressTracker::new(Arc::clone(&self.store), id);

        let bucket = if config.should_transfer_snapshots {
            Some(self.prepare_destination(id)?)
        } else {
            None
        };

        run.stage = PipelineStage::LocalSnapshotting;
        self.create_local(request, snap_point.as_deref(), config, run)?;
        progress.local_snapshot_created();

        let (upload, content) = match bucket {
            Some(bucket) => {
                if self.marked_failed(id) {
                    return Err(StageError::Fail(SnapshotError::AlreadyFailed(id.to_string())));
                }

                run.stage = PipelineStage::DeltaResolving;
                let location = config.snapshot_location(&bucket, id);
                let decision = self.resolver.resolve(
                    id,
                    &location,
                    self.backend.supports_incremental_snapshots(),
                    config,
                )?;

                run.stage = PipelineStage::Preparing;
                let prepared = self.prepare_upload(request, snap_point.as_deref(), &decision)?;

                run.stage = PipelineStage::Transferring;
                let content = self.upload(id, prepared, &progress)?;

                let upload = match decision {
                    DeltaDecision::Delta { parent, depth, .. } => {
                        self.delta_uploads.fetch_add(1, Ordering::Relaxed);
                        UploadKind::Incremental {
                            parent_snapshot_id: parent.snapshot_id,
                            depth,
                        }
                    }
                    DeltaDecision::Full { .. } => {
                        self.full_uploads.fetch_add(1, Ordering::Relaxed);
                        UploadKind::Full
                    }
                };
                (upload, Some(content))
            }
            None => {
                debug!(
                    target: "snapvault::pipeline",
                    snapshot_id = %id,
                    "Snapshot uploads disabled, skipping transfer"
                );
                (UploadKind::LocalOnly, None)
            }
        };

        run.stage = PipelineStage::Finalizing;
        run.finalize_attempted = true;
        self.backend
            .finalize_local_snapshot(id)
            .map_err(|e| SnapshotError::backend("finalize_local_snapshot", id, e))?;
        progress.finalized();

        Ok((upload, content))
    }

    fn prepare_destination(&self, snapshot_id: &str) -> SnapshotResult<String> {
        let bucket = self
            .transfer
            .prepare_destination(snapshot_id)
            .map_err(|e| SnapshotError::transfer(snapshot_id, e))?;
        if bucket.trim().is_empty() {
            return Err(SnapshotError::transfer(
                snapshot_id,
                TransferError::InvalidDestination("empty bucket name".to_string()),
            ));
        }
        debug!(
            target: "snapvault::pipeline",
            snapshot_id = %snapshot_id,
            bucket = %bucket,
            "Prepared upload destination"
        );
        Ok(bucket)
    }

    /// Create the local snapshot with the volume lock held
    fn create_local(
        &self,
        request: &CreateSnapshotRequest,
        snap_point: Option<&str>,
        config: &SnapshotConfig,
        run: &mut Run,
    ) -> Result<(), StageError> {
        let id = request.snapshot_id.as_str();
        let _volume = self
            .locks
            .acquire_for(&request.volume_id, config.lock_wait_timeout())
            .map_err(|e| StageError::Abort(e.into()))?;

        if self.marked_failed(id) {
            return Err(StageError::Abort(SnapshotError::AlreadyFailed(id.to_string())));
        }

        debug!(
            target: "snapvault::pipeline",
            snapshot_id = %id,
            volume_id = %request.volume_id,
            "Creating local snapshot"
        );
        self.backend
            .create_local_snapshot(&request.volume_id, id, snap_point)
            .map_err(|e| SnapshotError::backend("create_local_snapshot", id, e))?;
        run.local_created = true;

        if let Some(snap_point) = request.snap_point_id.as_deref() {
            if let Err(e) = transitions::set_snap_point(self.store.as_ref(), id, snap_point) {
                warn!(
                    target: "snapvault::pipeline",
                    snapshot_id = %id,
                    error = %e,
                    "Failed to record snap point"
                );
            }
        }
        Ok(())
    }

    fn prepare_upload(
        &self,
        request: &CreateSnapshotRequest,
        snap_point: Option<&str>,
        decision: &DeltaDecision,
    ) -> SnapshotResult<PreparedUpload> {
        let id = request.snapshot_id.as_str();
        let prepared = match decision.parent() {
            Some(parent) => self
                .backend
                .prepare_incremental_upload(
                    &request.volume_id,
                    id,
                    snap_point,
                    &parent.snapshot_id,
                    parent.snap_point_id.as_deref(),
                )
                .map_err(|e| SnapshotError::backend("prepare_incremental_upload", id, e))?,
            None => self
                .backend
                .prepare_full_upload(&request.volume_id, id, snap_point)
                .map_err(|e| SnapshotError::backend("prepare_full_upload", id, e))?
                .map(PreparedUpload::new),
        };

        prepared.ok_or_else(|| {
            SnapshotError::backend("prepare_upload", id, "backend returned no resource to upload")
        })
    }

    fn upload(
        &self,
        snapshot_id: &str,
        prepared: PreparedUpload,
        progress: &ProgressTracker,
    ) -> SnapshotResult<ContentHandle> {
        let PreparedUpload { resource, callback } = prepared;
        debug!(
            target: "snapvault::pipeline",
            snapshot_id = %snapshot_id,
            path = %resource.path,
            size_bytes = resource.size_bytes,
            "Uploading snapshot"
        );
        let content = self
            .transfer
            .upload(snapshot_id, &resource, progress)
            .map_err(|e| SnapshotError::transfer(snapshot_id, e))?;

        if let Some(callback) = callback {
            callback(&resource)
                .map_err(|e| SnapshotError::backend("post_upload_callback", snapshot_id, e))?;
        }
        Ok(content)
    }

    /// Failed-flag re-check; a store error reads as "not failed"
    fn marked_failed(&self, snapshot_id: &str) -> bool {
        match transitions::is_marked_failed(self.store.as_ref(), snapshot_id) {
            Ok(failed) => {
                if failed {
                    info!(
                        target: "snapvault::pipeline",
                        snapshot_id = %snapshot_id,
                        "Snapshot was marked failed concurrently"
                    );
                }
                failed
            }
            Err(e) => {
                warn!(
                    target: "snapvault::pipeline",
                    snapshot_id = %snapshot_id,
                    error = %e,
                    "Could not check failed flag"
                );
                false
            }
        }
    }

    fn commit_available(
        &self,
        request: &CreateSnapshotRequest,
        run: &mut Run,
        upload: UploadKind,
        content: Option<ContentHandle>,
    ) -> SnapshotOutcome {
        let id = request.snapshot_id.as_str();
        match transitions::mark_available(self.store.as_ref(), id) {
            Ok(record) => {
                self.total_available.fetch_add(1, Ordering::Relaxed);
                info!(
                    target: "snapvault::pipeline",
                    snapshot_id = %id,
                    volume_id = %request.volume_id,
                    upload = ?upload,
                    "Snapshot available"
                );
                SnapshotOutcome::Available(SnapshotSummary {
                    record,
                    upload,
                    content,
                })
            }
            Err(MetadataError::InvalidTransition {
                from: SnapshotStatus::Failed,
                ..
            }) => {
                let error = SnapshotError::AlreadyFailed(id.to_string());
                self.fail(request, run, error)
            }
            Err(e) => self.fail(request, run, SnapshotError::metadata(id, e)),
        }
    }

    fn abort(&self, request: &CreateSnapshotRequest, error: SnapshotError) -> SnapshotOutcome {
        self.total_aborted.fetch_add(1, Ordering::Relaxed);
        info!(
            target: "snapvault::pipeline",
            snapshot_id = %request.snapshot_id,
            volume_id = %request.volume_id,
            kind = error.kind(),
            error = %error,
            "Snapshot creation aborted, record left unchanged"
        );
        SnapshotOutcome::Aborted(error)
    }

    /// Failure path: best-effort finalize, then `failed`
    fn fail(
        &self,
        request: &CreateSnapshotRequest,
        run: &mut Run,
        error: SnapshotError,
    ) -> SnapshotOutcome {
        let id = request.snapshot_id.as_str();
        self.total_failed.fetch_add(1, Ordering::Relaxed);
        error!(
            target: "snapvault::pipeline",
            snapshot_id = %id,
            volume_id = %request.volume_id,
            stage = %run.stage,
            kind = error.kind(),
            error = %error,
            "Failed to create snapshot"
        );

        if run.local_created && !run.finalize_attempted {
            run.finalize_attempted = true;
            if let Err(e) = self.backend.finalize_local_snapshot(id) {
                warn!(
                    target: "snapvault::pipeline",
                    snapshot_id = %id,
                    error = %e,
                    "Best-effort finalize after failure did not succeed"
                );
            }
        }

        if let Err(e) = transitions::mark_failed(self.store.as_ref(), id) {
            error!(
                target: "snapvault::pipeline",
                snapshot_id = %id,
                error = %e,
                "Failed to mark snapshot failed"
            );
        }

        SnapshotOutcome::Failed {
            stage: run.stage,
            error,
        }
    }
}

impl std::fmt::Debug for SnapshotCreator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotCreator")
            .field("config", &self.config.current())
            .field("metrics", &self.metrics())
            .finish()
    }
}
