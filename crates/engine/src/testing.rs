//! Scriptable collaborators for tests and embedders
//!
//! `MockBackend` and `MockTransfer` record every call, can be told to fail
//! specific operations, and the backend tracks how many local snapshot
//! creations run concurrently per volume.
//!
//! `InterleavedStore` wraps a metadata store and runs hooks between its
//! queries, standing in for a concurrent actor that writes after the engine
//! read and before it commits.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use snapvault_core::{
    BackendError, BlockBackend, ContentHandle, MetadataError, MetadataResult,
    MetadataTransaction, PreparedUpload, ProgressSink, ResourceKind, SnapshotMetadataStore,
    SnapshotQuery, SnapshotRecord, SnapshotStatus, SnapshotTransfer, StorageResource,
    TransferError,
};

/// Backend operations that can be scripted to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendOp {
    /// `create_local_snapshot`
    CreateLocal,
    /// `prepare_full_upload`
    PrepareFull,
    /// `prepare_incremental_upload`
    PrepareIncremental,
    /// The post-upload callback of an incremental resource
    PostUpload,
    /// `finalize_local_snapshot`
    Finalize,
}

/// One recorded backend call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    /// Local snapshot created
    CreateLocal {
        /// Volume
        volume_id: String,
        /// Snapshot
        snapshot_id: String,
        /// Snap point passed in
        snap_point_id: Option<String>,
    },
    /// Full resource prepared
    PrepareFull {
        /// Snapshot
        snapshot_id: String,
    },
    /// Incremental resource prepared
    PrepareIncremental {
        /// Snapshot
        snapshot_id: String,
        /// Parent snapshot
        parent_snapshot_id: String,
        /// Parent snap point passed in
        parent_snap_point_id: Option<String>,
    },
    /// Post-upload callback ran
    PostUpload {
        /// Snapshot
        snapshot_id: String,
    },
    /// Local snapshot finalized
    Finalize {
        /// Snapshot
        snapshot_id: String,
    },
}

impl BackendCall {
    /// Snapshot the call was made for
    pub fn snapshot_id(&self) -> &str {
        match self {
            BackendCall::CreateLocal { snapshot_id, .. }
            | BackendCall::PrepareFull { snapshot_id }
            | BackendCall::PrepareIncremental { snapshot_id, .. }
            | BackendCall::PostUpload { snapshot_id }
            | BackendCall::Finalize { snapshot_id } => snapshot_id,
        }
    }
}

/// In-memory `BlockBackend`
pub struct MockBackend {
    incremental: AtomicBool,
    calls: Arc<Mutex<Vec<BackendCall>>>,
    failures: Arc<Mutex<HashSet<BackendOp>>>,
    empty_resources: AtomicBool,
    create_delay: Mutex<Duration>,
    creating: Mutex<HashMap<String, usize>>,
    max_concurrent_creates: AtomicUsize,
}

impl MockBackend {
    /// Backend with incremental support
    pub fn new() -> Self {
        Self {
            incremental: AtomicBool::new(true),
            calls: Arc::new(Mutex::new(Vec::new())),
            failures: Arc::new(Mutex::new(HashSet::new())),
            empty_resources: AtomicBool::new(false),
            create_delay: Mutex::new(Duration::ZERO),
            creating: Mutex::new(HashMap::new()),
            max_concurrent_creates: AtomicUsize::new(0),
        }
    }

    /// Backend without incremental support
    pub fn full_only() -> Self {
        let backend = Self::new();
        backend.incremental.store(false, Ordering::SeqCst);
        backend
    }

    /// Make `op` fail from now on
    pub fn fail_on(&self, op: BackendOp) {
        self.failures.lock().insert(op);
    }

    /// Make `op` succeed again
    pub fn clear_failure(&self, op: BackendOp) {
        self.failures.lock().remove(&op);
    }

    /// Return no resource from the prepare operations
    pub fn return_no_resource(&self, empty: bool) {
        self.empty_resources.store(empty, Ordering::SeqCst);
    }

    /// Time each local creation spends inside the backend
    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock() = delay;
    }

    /// All calls so far, in order
    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().clone()
    }

    /// Calls made for `snapshot_id`
    pub fn calls_for(&self, snapshot_id: &str) -> Vec<BackendCall> {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.snapshot_id() == snapshot_id)
            .cloned()
            .collect()
    }

    /// Highest number of simultaneous creations seen on any one volume
    pub fn max_concurrent_creates(&self) -> usize {
        self.max_concurrent_creates.load(Ordering::SeqCst)
    }

    fn check(&self, op: BackendOp) -> Result<(), BackendError> {
        if self.failures.lock().contains(&op) {
            return Err(BackendError::Failed(format!("scripted failure of {:?}", op)));
        }
        Ok(())
    }

    fn record(&self, call: BackendCall) {
        self.calls.lock().push(call);
    }

    fn resource(&self, snapshot_id: &str, kind: ResourceKind) -> Option<StorageResource> {
        if self.empty_resources.load(Ordering::SeqCst) {
            return None;
        }
        Some(StorageResource {
            snapshot_id: snapshot_id.to_string(),
            path: format!("/dev/mock/{}", snapshot_id),
            size_bytes: 1 << 20,
            kind,
        })
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockBackend for MockBackend {
    fn create_local_snapshot(
        &self,
        volume_id: &str,
        snapshot_id: &str,
        snap_point_id: Option<&str>,
    ) -> Result<(), BackendError> {
        let inside = {
            let mut creating = self.creating.lock();
            let count = creating.entry(volume_id.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        self.max_concurrent_creates.fetch_max(inside, Ordering::SeqCst);

        let delay = *self.create_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        {
            let mut creating = self.creating.lock();
            if let Some(count) = creating.get_mut(volume_id) {
                *count -= 1;
                if *count == 0 {
                    creating.remove(volume_id);
                }
            }
        }

        self.record(BackendCall::CreateLocal {
            volume_id: volume_id.to_string(),
            snapshot_id: snapshot_id.to_string(),
            snap_point_id: snap_point_id.map(str::to_string),
        });
        self.check(BackendOp::CreateLocal)
    }

    fn supports_incremental_snapshots(&self) -> bool {
        self.incremental.load(Ordering::SeqCst)
    }

    fn prepare_full_upload(
        &self,
        _volume_id: &str,
        snapshot_id: &str,
        _snap_point_id: Option<&str>,
    ) -> Result<Option<StorageResource>, BackendError> {
        self.record(BackendCall::PrepareFull {
            snapshot_id: snapshot_id.to_string(),
        });
        self.check(BackendOp::PrepareFull)?;
        Ok(self.resource(snapshot_id, ResourceKind::Full))
    }

    fn prepare_incremental_upload(
        &self,
        _volume_id: &str,
        snapshot_id: &str,
        _snap_point_id: Option<&str>,
        parent_snapshot_id: &str,
        parent_snap_point_id: Option<&str>,
    ) -> Result<Option<PreparedUpload>, BackendError> {
        self.record(BackendCall::PrepareIncremental {
            snapshot_id: snapshot_id.to_string(),
            parent_snapshot_id: parent_snapshot_id.to_string(),
            parent_snap_point_id: parent_snap_point_id.map(str::to_string),
        });
        self.check(BackendOp::PrepareIncremental)?;

        let kind = ResourceKind::Incremental {
            parent_snapshot_id: parent_snapshot_id.to_string(),
        };
        let resource = match self.resource(snapshot_id, kind) {
            Some(resource) => resource,
            None => return Ok(None),
        };

        let calls = Arc::clone(&self.calls);
        let failures = Arc::clone(&self.failures);
        Ok(Some(PreparedUpload::new(resource).with_callback(
            move |resource: &StorageResource| {
                calls.lock().push(BackendCall::PostUpload {
                    snapshot_id: resource.snapshot_id.clone(),
                });
                if failures.lock().contains(&BackendOp::PostUpload) {
                    return Err(BackendError::Failed(
                        "scripted failure of PostUpload".to_string(),
                    ));
                }
                Ok(())
            },
        )))
    }

    fn finalize_local_snapshot(&self, snapshot_id: &str) -> Result<(), BackendError> {
        self.record(BackendCall::Finalize {
            snapshot_id: snapshot_id.to_string(),
        });
        self.check(BackendOp::Finalize)
    }
}

impl std::fmt::Debug for MockBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockBackend")
            .field("incremental", &self.supports_incremental_snapshots())
            .field("calls", &self.calls.lock().len())
            .finish()
    }
}

/// One recorded transfer call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferCall {
    /// Destination prepared
    PrepareDestination {
        /// Snapshot
        snapshot_id: String,
    },
    /// Resource uploaded (or attempted)
    Upload {
        /// Snapshot
        snapshot_id: String,
        /// Resource kind uploaded
        kind: ResourceKind,
    },
}

/// In-memory `SnapshotTransfer`
pub struct MockTransfer {
    bucket: Mutex<String>,
    calls: Mutex<Vec<TransferCall>>,
    destination_failure: Mutex<Option<TransferError>>,
    upload_failures: Mutex<HashMap<String, TransferError>>,
}

impl MockTransfer {
    /// Transfer into bucket `snapshots`
    pub fn new() -> Self {
        Self::with_bucket("snapshots")
    }

    /// Transfer into `bucket`
    pub fn with_bucket(bucket: impl Into<String>) -> Self {
        Self {
            bucket: Mutex::new(bucket.into()),
            calls: Mutex::new(Vec::new()),
            destination_failure: Mutex::new(None),
            upload_failures: Mutex::new(HashMap::new()),
        }
    }

    /// Fail every destination preparation with `error`
    pub fn fail_destination(&self, error: TransferError) {
        *self.destination_failure.lock() = Some(error);
    }

    /// Fail the upload of `snapshot_id` with `error`
    pub fn fail_upload(&self, snapshot_id: impl Into<String>, error: TransferError) {
        self.upload_failures.lock().insert(snapshot_id.into(), error);
    }

    /// All calls so far, in order
    pub fn calls(&self) -> Vec<TransferCall> {
        self.calls.lock().clone()
    }

    /// Uploaded snapshot ids, in order
    pub fn uploads(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                TransferCall::Upload { snapshot_id, .. } => Some(snapshot_id.clone()),
                TransferCall::PrepareDestination { .. } => None,
            })
            .collect()
    }
}

impl Default for MockTransfer {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotTransfer for MockTransfer {
    fn prepare_destination(&self, snapshot_id: &str) -> Result<String, TransferError> {
        self.calls.lock().push(TransferCall::PrepareDestination {
            snapshot_id: snapshot_id.to_string(),
        });
        if let Some(error) = self.destination_failure.lock().clone() {
            return Err(error);
        }
        Ok(self.bucket.lock().clone())
    }

    fn upload(
        &self,
        snapshot_id: &str,
        resource: &StorageResource,
        progress: &dyn ProgressSink,
    ) -> Result<ContentHandle, TransferError> {
        self.calls.lock().push(TransferCall::Upload {
            snapshot_id: snapshot_id.to_string(),
            kind: resource.kind.clone(),
        });
        let failure = self.upload_failures.lock().get(snapshot_id).cloned();
        if let Some(error) = failure {
            return Err(error);
        }
        for percent in [25, 50, 100] {
            progress.update(percent);
        }
        Ok(ContentHandle(format!("etag-{}", snapshot_id)))
    }
}

impl std::fmt::Debug for MockTransfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransfer")
            .field("bucket", &*self.bucket.lock())
            .field("calls", &self.calls.lock().len())
            .finish()
    }
}

// ============================================================================
// Interleaved metadata store
// ============================================================================

/// Hook run against the wrapped store between two queries
pub type InterleaveHook = Box<dyn FnOnce(&dyn SnapshotMetadataStore) + Send>;

/// `SnapshotMetadataStore` wrapper that runs hooks after chosen queries
///
/// `find_first` goes through `find`, so both count as one query.
pub struct InterleavedStore {
    inner: Arc<dyn SnapshotMetadataStore>,
    finds: AtomicUsize,
    hooks: Mutex<Vec<(usize, InterleaveHook)>>,
}

impl InterleavedStore {
    /// Wrap `inner`; with no hooks registered the wrapper is transparent
    pub fn new(inner: Arc<dyn SnapshotMetadataStore>) -> Self {
        Self {
            inner,
            finds: AtomicUsize::new(0),
            hooks: Mutex::new(Vec::new()),
        }
    }

    /// Run `hook` right after the `nth` query from now returns (1-based)
    pub fn after_find<F>(&self, nth: usize, hook: F)
    where
        F: FnOnce(&dyn SnapshotMetadataStore) + Send + 'static,
    {
        let at = self.finds.load(Ordering::SeqCst) + nth.max(1);
        self.hooks.lock().push((at, Box::new(hook)));
    }

    /// Queries served so far
    pub fn find_count(&self) -> usize {
        self.finds.load(Ordering::SeqCst)
    }
}

impl SnapshotMetadataStore for InterleavedStore {
    fn insert(&self, record: SnapshotRecord) -> MetadataResult<()> {
        self.inner.insert(record)
    }

    fn get(&self, snapshot_id: &str) -> MetadataResult<Option<SnapshotRecord>> {
        self.inner.get(snapshot_id)
    }

    fn transaction(
        &self,
        body: &mut dyn FnMut(&mut dyn MetadataTransaction) -> MetadataResult<()>,
    ) -> MetadataResult<()> {
        self.inner.transaction(body)
    }

    fn find(&self, query: &SnapshotQuery) -> MetadataResult<Vec<SnapshotRecord>> {
        let result = self.inner.find(query);
        let count = self.finds.fetch_add(1, Ordering::SeqCst) + 1;

        let due: Vec<InterleaveHook> = {
            let mut hooks = self.hooks.lock();
            let (due, pending): (Vec<_>, Vec<_>) =
                hooks.drain(..).partition(|(at, _)| *at == count);
            *hooks = pending;
            due.into_iter().map(|(_, hook)| hook).collect()
        };
        for hook in due {
            hook(self.inner.as_ref());
        }

        result
    }
}

impl std::fmt::Debug for InterleavedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterleavedStore")
            .field("finds", &self.find_count())
            .field("hooks", &self.hooks.lock().len())
            .finish()
    }
}

/// Overwrite the status of `snapshot_id`, bypassing the lifecycle rules
///
/// Stands in for an external actor (operator, cleanup job) changing a
/// record the engine does not own.
pub fn force_status(
    store: &dyn SnapshotMetadataStore,
    snapshot_id: &str,
    status: SnapshotStatus,
) -> MetadataResult<()> {
    store.transaction(&mut |txn| {
        let mut record = txn
            .get(snapshot_id)?
            .ok_or_else(|| MetadataError::NotFound(snapshot_id.to_string()))?;
        record.status = status;
        txn.put(record)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapvault_storage::InMemoryMetadataStore;
    use std::sync::atomic::AtomicU8;

    struct Recorder(AtomicU8);

    impl ProgressSink for Recorder {
        fn update(&self, percent: u8) {
            self.0.fetch_max(percent, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_backend_records_and_fails() {
        let backend = MockBackend::new();
        backend.create_local_snapshot("vol-1", "snap-1", None).unwrap();
        backend.fail_on(BackendOp::Finalize);
        assert!(backend.finalize_local_snapshot("snap-1").is_err());

        assert_eq!(backend.calls_for("snap-1").len(), 2);
        assert_eq!(backend.max_concurrent_creates(), 1);
    }

    #[test]
    fn test_incremental_callback_is_recorded() {
        let backend = MockBackend::new();
        let prepared = backend
            .prepare_incremental_upload("vol-1", "snap-2", None, "snap-1", Some("sp-1"))
            .unwrap()
            .unwrap();
        let callback = prepared.callback.unwrap();
        callback(&prepared.resource).unwrap();

        assert_eq!(
            backend.calls().last(),
            Some(&BackendCall::PostUpload {
                snapshot_id: "snap-2".to_string()
            })
        );
    }

    #[test]
    fn test_transfer_reports_progress() {
        let transfer = MockTransfer::new();
        let backend = MockBackend::new();
        let resource = backend
            .prepare_full_upload("vol-1", "snap-1", None)
            .unwrap()
            .unwrap();
        let recorder = Recorder(AtomicU8::new(0));

        let handle = transfer.upload("snap-1", &resource, &recorder).unwrap();
        assert_eq!(handle.as_str(), "etag-snap-1");
        assert_eq!(recorder.0.load(Ordering::SeqCst), 100);
        assert_eq!(transfer.uploads(), vec!["snap-1".to_string()]);
    }

    #[test]
    fn test_transfer_scripted_timeout() {
        let transfer = MockTransfer::new();
        transfer.fail_upload("snap-1", TransferError::Timeout { elapsed_ms: 5 });
        let resource = MockBackend::new()
            .prepare_full_upload("vol-1", "snap-1", None)
            .unwrap()
            .unwrap();
        let recorder = Recorder(AtomicU8::new(0));

        assert_eq!(
            transfer.upload("snap-1", &resource, &recorder),
            Err(TransferError::Timeout { elapsed_ms: 5 })
        );
    }

    #[test]
    fn test_interleaved_hook_runs_after_chosen_query() {
        let inner = Arc::new(InMemoryMetadataStore::with_records([SnapshotRecord::new(
            "snap-1", "vol-1",
        )]));
        let store = InterleavedStore::new(inner.clone());
        store.after_find(2, |store| {
            force_status(store, "snap-1", SnapshotStatus::Failed).unwrap();
        });
        let query = SnapshotQuery::for_volume("vol-1");

        let first = store.find(&query).unwrap();
        assert_eq!(first[0].status, SnapshotStatus::Pending);
        assert_eq!(inner.get("snap-1").unwrap().unwrap().status, SnapshotStatus::Pending);

        // The second query still reads the state from before the hook
        let second = store.find_first(&query).unwrap().unwrap();
        assert_eq!(second.status, SnapshotStatus::Pending);
        assert_eq!(inner.get("snap-1").unwrap().unwrap().status, SnapshotStatus::Failed);

        store.find(&query).unwrap();
        assert_eq!(store.find_count(), 3);
    }
}
