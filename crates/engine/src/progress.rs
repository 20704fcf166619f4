//! Progress reporting
//!
//! Progress is observable on the record and moves through fixed
//! checkpoints: 50 once the local snapshot exists, then upload progress
//! mapped into 50..=99, then 100 once the backend is finalized. Writes
//! are monotonic and failures to write are logged, never fatal.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use snapvault_core::{ProgressSink, SnapshotMetadataStore, MAX_PROGRESS};
use tracing::{trace, warn};

use crate::transitions;

/// Progress once the local snapshot is created
pub const LOCAL_SNAPSHOT_PROGRESS: u8 = 50;

/// Highest progress reachable while uploading
pub const UPLOAD_CEILING: u8 = 99;

/// Map upload progress (0..=100) into the 50..=99 window
pub fn upload_to_record_progress(upload_percent: u8) -> u8 {
    let upload = u32::from(upload_percent.min(MAX_PROGRESS));
    let window = u32::from(UPLOAD_CEILING - LOCAL_SNAPSHOT_PROGRESS);
    (u32::from(LOCAL_SNAPSHOT_PROGRESS) + upload * window / 100) as u8
}

/// Writes progress for one snapshot record
pub struct ProgressTracker {
    store: Arc<dyn SnapshotMetadataStore>,
    snapshot_id: String,
    reported: AtomicU8,
}

impl ProgressTracker {
    /// Tracker for `snapshot_id`, starting from 0
    pub fn new(store: Arc<dyn SnapshotMetadataStore>, snapshot_id: impl Into<String>) -> Self {
        Self {
            store,
            snapshot_id: snapshot_id.into(),
            reported: AtomicU8::new(0),
        }
    }

    /// Highest progress reported so far
    pub fn reported(&self) -> u8 {
        self.reported.load(Ordering::Acquire)
    }

    /// Report an absolute checkpoint
    pub fn checkpoint(&self, percent: u8) {
        let percent = percent.min(MAX_PROGRESS);
        let previous = self.reported.fetch_max(percent, Ordering::AcqRel);
        if percent <= previous {
            return;
        }
        match transitions::set_progress(self.store.as_ref(), &self.snapshot_id, percent) {
            Ok(_) => trace!(
                target: "snapvault::pipeline",
                snapshot_id = %self.snapshot_id,
                progress = percent,
                "Progress updated"
            ),
            Err(e) => warn!(
                target: "snapvault::pipeline",
                snapshot_id = %self.snapshot_id,
                progress = percent,
                error = %e,
                "Failed to update progress"
            ),
        }
    }

    /// Local snapshot created
    pub fn local_snapshot_created(&self) {
        self.checkpoint(LOCAL_SNAPSHOT_PROGRESS);
    }

    /// Backend finalized
    pub fn finalized(&self) {
        self.checkpoint(MAX_PROGRESS);
    }
}

impl ProgressSink for ProgressTracker {
    fn update(&self, percent: u8) {
        self.checkpoint(upload_to_record_progress(percent));
    }
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("snapshot_id", &self.snapshot_id)
            .field("reported", &self.reported())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapvault_core::{SnapshotRecord, SnapshotStatus};
    use snapvault_storage::InMemoryMetadataStore;

    fn tracker() -> (Arc<InMemoryMetadataStore>, ProgressTracker) {
        let store = Arc::new(InMemoryMetadataStore::with_records(vec![
            SnapshotRecord::new("snap-1", "vol-1"),
        ]));
        let tracker = ProgressTracker::new(store.clone(), "snap-1");
        (store, tracker)
    }

    fn progress(store: &InMemoryMetadataStore) -> u8 {
        store.get("snap-1").unwrap().unwrap().progress
    }

    #[test]
    fn test_upload_window() {
        assert_eq!(upload_to_record_progress(0), 50);
        assert_eq!(upload_to_record_progress(50), 74);
        assert_eq!(upload_to_record_progress(100), 99);
        assert_eq!(upload_to_record_progress(255), 99);
    }

    #[test]
    fn test_checkpoints() {
        let (store, tracker) = tracker();
        tracker.local_snapshot_created();
        assert_eq!(progress(&store), 50);

        tracker.update(100);
        assert_eq!(progress(&store), 99);

        tracker.finalized();
        assert_eq!(progress(&store), 100);
    }

    #[test]
    fn test_progress_never_decreases() {
        let (store, tracker) = tracker();
        tracker.update(80);
        let high = progress(&store);
        tracker.update(10);
        assert_eq!(progress(&store), high);
        assert_eq!(tracker.reported(), high);
    }

    #[test]
    fn test_failed_record_is_not_touched() {
        let (store, tracker) = tracker();
        transitions::mark_failed(store.as_ref(), "snap-1").unwrap();
        tracker.local_snapshot_created();

        let record = store.get("snap-1").unwrap().unwrap();
        assert_eq!(record.status, SnapshotStatus::Failed);
        assert_eq!(record.progress, 0);
    }

    #[test]
    fn test_missing_record_is_logged_not_fatal() {
        let store = Arc::new(InMemoryMetadataStore::new());
        let tracker = ProgressTracker::new(store, "missing");
        tracker.finalized();
        assert_eq!(tracker.reported(), 100);
    }
}
