//! Embedding tests for the `snapvault` facade crate
//!
//! Wires the full stack the way an embedder would: configuration file on
//! disk, shared lock registry, in-memory metadata store, background
//! scheduler.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use snapvault::testing::{MockBackend, MockTransfer};
use snapvault::{
    CreateSnapshotRequest, InMemoryMetadataStore, LockRegistry, SharedConfig, SnapshotConfig,
    SnapshotCreator, SnapshotMetadataStore, SnapshotRecord, SnapshotScheduler, SnapshotStatus,
    CONFIG_FILE_NAME,
};

fn build(config: SnapshotConfig) -> (Arc<InMemoryMetadataStore>, Arc<SnapshotCreator>) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let store = Arc::new(InMemoryMetadataStore::new());
    let creator = SnapshotCreator::new(
        store.clone(),
        Arc::new(MockBackend::new()),
        Arc::new(MockTransfer::with_bucket("backups")),
        Arc::new(LockRegistry::new()),
        SharedConfig::new(config),
    );
    (store, Arc::new(creator))
}

#[test]
fn test_default_config_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(CONFIG_FILE_NAME);

    SnapshotConfig::write_default_if_missing(&path).unwrap();
    let config = SnapshotConfig::from_file(&path).unwrap();
    assert_eq!(config, SnapshotConfig::default());
}

#[test]
fn test_scheduled_chain_on_one_volume() {
    let (store, creator) = build(SnapshotConfig::default().with_max_deltas(5));
    let base = Utc::now() - ChronoDuration::hours(1);
    for i in 0..4 {
        store
            .insert(SnapshotRecord::with_start_time(
                format!("snap-{}", i),
                "vol-1",
                base + ChronoDuration::minutes(i),
            ))
            .unwrap();
    }

    // One worker runs the jobs in submission order
    let scheduler = SnapshotScheduler::new(Arc::clone(&creator), 1, 16).unwrap();
    let handles: Vec<_> = (0..4)
        .map(|i| {
            scheduler
                .submit(CreateSnapshotRequest::new("vol-1", format!("snap-{}", i)))
                .unwrap()
        })
        .collect();
    for handle in handles {
        assert!(handle.wait().unwrap().is_available());
    }
    scheduler.shutdown();

    let origin = store.get("snap-0").unwrap().unwrap();
    assert!(origin.is_origin());
    assert_eq!(
        origin.snapshot_location.as_deref(),
        Some("objectstorage://backups/snap-0")
    );
    for i in 1..4 {
        let record = store.get(&format!("snap-{}", i)).unwrap().unwrap();
        assert_eq!(record.status, SnapshotStatus::Available);
        assert_eq!(
            record.previous_snapshot_id,
            Some(format!("snap-{}", i - 1))
        );
    }

    let metrics = creator.metrics();
    assert_eq!(metrics.total_available, 4);
    assert_eq!(metrics.delta_uploads, 3);
}
