//! Record transitions
//!
//! Every write the engine makes to a snapshot record goes through this
//! module. Each helper re-reads the record inside a store transaction,
//! applies a pure transform, and writes it back; nothing is cached across
//! calls.
//!
//! Status changes are one-way: `pending -> available` and
//! `pending -> failed`. A transform that would move a record backwards
//! fails with `MetadataError::InvalidTransition` and the transaction rolls
//! back. A record that left `pending` is frozen: location, parent, origin
//! flag and snap point are only written while it is still `pending`.

use snapvault_core::{
    MetadataError, MetadataResult, SnapshotConfig, SnapshotMetadataStore, SnapshotRecord,
    SnapshotStatus, MAX_PROGRESS,
};
use tracing::{debug, warn};

/// Result of a location assignment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assignment {
    /// Location (and parent, for deltas) written; carries the updated record
    Assigned(SnapshotRecord),
    /// The chosen parent is gone or no longer eligible; nothing was written
    ParentIneligible {
        /// Parent that was rejected
        parent_snapshot_id: String,
        /// Parent status at commit time, `None` if the record disappeared
        status: Option<SnapshotStatus>,
    },
}

/// Apply `transform` to the record `snapshot_id` inside one transaction
///
/// The transform sees the freshly read record and may veto the write by
/// returning an error, which rolls the transaction back.
///
/// # Errors
///
/// `MetadataError::NotFound` if the record does not exist, any error the
/// transform returns, or any store error.
pub fn update_record<F>(
    store: &dyn SnapshotMetadataStore,
    snapshot_id: &str,
    mut transform: F,
) -> MetadataResult<SnapshotRecord>
where
    F: FnMut(&mut SnapshotRecord) -> MetadataResult<()>,
{
    let mut updated = None;
    store.transaction(&mut |txn| {
        let mut record = txn
            .get(snapshot_id)?
            .ok_or_else(|| MetadataError::NotFound(snapshot_id.to_string()))?;
        transform(&mut record)?;
        txn.put(record.clone())?;
        updated = Some(record);
        Ok(())
    })?;
    updated.ok_or_else(|| MetadataError::NotFound(snapshot_id.to_string()))
}

fn transition(record: &mut SnapshotRecord, next: SnapshotStatus) -> MetadataResult<()> {
    if !record.status.can_transition_to(next) {
        return Err(MetadataError::InvalidTransition {
            snapshot_id: record.snapshot_id.clone(),
            from: record.status,
            to: next,
        });
    }
    record.status = next;
    Ok(())
}

/// Refuse the write unless the record is still `pending`
///
/// `to` is the status the write would leave the record in.
fn ensure_pending(record: &SnapshotRecord, to: SnapshotStatus) -> MetadataResult<()> {
    if record.status != SnapshotStatus::Pending {
        return Err(MetadataError::InvalidTransition {
            snapshot_id: record.snapshot_id.clone(),
            from: record.status,
            to,
        });
    }
    Ok(())
}

/// Commit the success terminal state: `available`, progress 100
///
/// Refused unless the record is still `pending`.
pub fn mark_available(
    store: &dyn SnapshotMetadataStore,
    snapshot_id: &str,
) -> MetadataResult<SnapshotRecord> {
    update_record(store, snapshot_id, |record| {
        ensure_pending(record, SnapshotStatus::Available)?;
        transition(record, SnapshotStatus::Available)?;
        record.progress = MAX_PROGRESS;
        Ok(())
    })
}

/// Commit the failure terminal state: `failed`, progress 0
///
/// Idempotent on records that are already `failed`.
pub fn mark_failed(
    store: &dyn SnapshotMetadataStore,
    snapshot_id: &str,
) -> MetadataResult<SnapshotRecord> {
    update_record(store, snapshot_id, |record| {
        transition(record, SnapshotStatus::Failed)?;
        record.progress = 0;
        Ok(())
    })
}

/// Raise the progress of a pending record
///
/// Progress never decreases and is only written while the record is
/// `pending`; otherwise the record is returned unchanged.
pub fn set_progress(
    store: &dyn SnapshotMetadataStore,
    snapshot_id: &str,
    percent: u8,
) -> MetadataResult<SnapshotRecord> {
    let percent = percent.min(MAX_PROGRESS);
    update_record(store, snapshot_id, |record| {
        if record.status == SnapshotStatus::Pending && percent > record.progress {
            record.progress = percent;
        }
        Ok(())
    })
}

/// Remember the backend snap point of a freshly created local snapshot
pub fn set_snap_point(
    store: &dyn SnapshotMetadataStore,
    snapshot_id: &str,
    snap_point_id: &str,
) -> MetadataResult<SnapshotRecord> {
    update_record(store, snapshot_id, |record| {
        ensure_pending(record, SnapshotStatus::Pending)?;
        record.snap_point_id = Some(snap_point_id.to_string());
        Ok(())
    })
}

/// Check whether `snapshot_id` has been marked failed
pub fn is_marked_failed(
    store: &dyn SnapshotMetadataStore,
    snapshot_id: &str,
) -> MetadataResult<bool> {
    Ok(store
        .get(snapshot_id)?
        .map(|record| record.status.is_failed())
        .unwrap_or(false))
}

fn ensure_location_unset(record: &SnapshotRecord) -> MetadataResult<()> {
    match &record.snapshot_location {
        Some(existing) => Err(MetadataError::RolledBack(format!(
            "snapshot {} already has location {}",
            record.snapshot_id, existing
        ))),
        None => Ok(()),
    }
}

/// Record a full upload: fresh location, `is_origin = true`, no parent
///
/// Refused unless the record is still `pending`.
pub fn commit_full_location(
    store: &dyn SnapshotMetadataStore,
    snapshot_id: &str,
    location: &str,
) -> MetadataResult<SnapshotRecord> {
    let record = update_record(store, snapshot_id, |record| {
        ensure_pending(record, SnapshotStatus::Pending)?;
        ensure_location_unset(record)?;
        record.snapshot_location = Some(location.to_string());
        record.previous_snapshot_id = None;
        record.is_origin = Some(true);
        Ok(())
    })?;
    debug!(
        target: "snapvault::store",
        snapshot_id = %snapshot_id,
        location = %location,
        "Recorded full upload location"
    );
    Ok(record)
}

/// Record a delta upload on top of `parent_snapshot_id`
///
/// The target must still be `pending`. Inside the same transaction, the
/// parent is re-read and must still exist, still be outside the generation
/// exclusion set and still be delta capable. Otherwise nothing is written
/// and `Assignment::ParentIneligible` is returned.
pub fn commit_delta_parent(
    store: &dyn SnapshotMetadataStore,
    snapshot_id: &str,
    parent_snapshot_id: &str,
    location: &str,
    config: &SnapshotConfig,
) -> MetadataResult<Assignment> {
    let mut outcome = None;
    store.transaction(&mut |txn| {
        let mut record = txn
            .get(snapshot_id)?
            .ok_or_else(|| MetadataError::NotFound(snapshot_id.to_string()))?;
        ensure_pending(&record, SnapshotStatus::Pending)?;

        let parent = txn.get(parent_snapshot_id)?;
        let eligible = parent.as_ref().map_or(false, |p| {
            !config.is_generation_excluded(p.status) && p.is_delta_capable()
        });
        if !eligible {
            outcome = Some(Assignment::ParentIneligible {
                parent_snapshot_id: parent_snapshot_id.to_string(),
                status: parent.map(|p| p.status),
            });
            return Ok(());
        }

        ensure_location_unset(&record)?;
        record.snapshot_location = Some(location.to_string());
        record.previous_snapshot_id = Some(parent_snapshot_id.to_string());
        record.is_origin = Some(false);
        txn.put(record.clone())?;
        outcome = Some(Assignment::Assigned(record));
        Ok(())
    })?;

    match outcome {
        Some(Assignment::ParentIneligible {
            parent_snapshot_id,
            status,
        }) => {
            warn!(
                target: "snapvault::store",
                snapshot_id = %snapshot_id,
                parent_snapshot_id = %parent_snapshot_id,
                parent_status = ?status,
                "Delta parent no longer eligible, nothing written"
            );
            Ok(Assignment::ParentIneligible {
                parent_snapshot_id,
                status,
            })
        }
        Some(assigned) => Ok(assigned),
        None => Err(MetadataError::NotFound(snapshot_id.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapvault_storage::InMemoryMetadataStore;

    fn store_with(records: Vec<SnapshotRecord>) -> InMemoryMetadataStore {
        InMemoryMetadataStore::with_records(records)
    }

    fn uploaded_origin(id: &str) -> SnapshotRecord {
        let mut record = SnapshotRecord::new(id, "vol-1");
        record.status = SnapshotStatus::Available;
        record.progress = 100;
        record.snapshot_location = Some(format!("objectstorage://bucket/{}", id));
        record.is_origin = Some(true);
        record
    }

    #[test]
    fn test_update_record_missing() {
        let store = store_with(vec![]);
        let result = update_record(&store, "snap-x", |_| Ok(()));
        assert_eq!(result, Err(MetadataError::NotFound("snap-x".to_string())));
    }

    #[test]
    fn test_transform_error_rolls_back() {
        let store = store_with(vec![SnapshotRecord::new("snap-1", "vol-1")]);
        let result = update_record(&store, "snap-1", |record| {
            record.progress = 42;
            Err(MetadataError::RolledBack("veto".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(store.get("snap-1").unwrap().unwrap().progress, 0);
    }

    #[test]
    fn test_mark_available_sets_full_progress() {
        let store = store_with(vec![SnapshotRecord::new("snap-1", "vol-1")]);
        let record = mark_available(&store, "snap-1").unwrap();
        assert_eq!(record.status, SnapshotStatus::Available);
        assert_eq!(record.progress, 100);
    }

    #[test]
    fn test_mark_available_refused_after_failure() {
        let store = store_with(vec![SnapshotRecord::new("snap-1", "vol-1")]);
        mark_failed(&store, "snap-1").unwrap();

        let result = mark_available(&store, "snap-1");
        assert!(matches!(
            result,
            Err(MetadataError::InvalidTransition {
                from: SnapshotStatus::Failed,
                to: SnapshotStatus::Available,
                ..
            })
        ));
        assert_eq!(
            store.get("snap-1").unwrap().unwrap().status,
            SnapshotStatus::Failed
        );
    }

    #[test]
    fn test_mark_failed_is_idempotent_and_resets_progress() {
        let store = store_with(vec![SnapshotRecord::new("snap-1", "vol-1")]);
        set_progress(&store, "snap-1", 50).unwrap();

        let record = mark_failed(&store, "snap-1").unwrap();
        assert_eq!(record.progress, 0);
        assert!(mark_failed(&store, "snap-1").is_ok());
        assert!(is_marked_failed(&store, "snap-1").unwrap());
    }

    #[test]
    fn test_mark_failed_refused_on_available() {
        let store = store_with(vec![uploaded_origin("snap-1")]);
        assert!(mark_failed(&store, "snap-1").is_err());
    }

    #[test]
    fn test_progress_is_monotonic() {
        let store = store_with(vec![SnapshotRecord::new("snap-1", "vol-1")]);
        set_progress(&store, "snap-1", 70).unwrap();
        set_progress(&store, "snap-1", 50).unwrap();
        assert_eq!(store.get("snap-1").unwrap().unwrap().progress, 70);

        set_progress(&store, "snap-1", 250).unwrap();
        assert_eq!(store.get("snap-1").unwrap().unwrap().progress, 100);
    }

    #[test]
    fn test_full_location_marks_origin() {
        let store = store_with(vec![SnapshotRecord::new("snap-1", "vol-1")]);
        let record = commit_full_location(&store, "snap-1", "objectstorage://b/snap-1").unwrap();
        assert!(record.is_origin());
        assert_eq!(record.previous_snapshot_id, None);
        assert_eq!(
            record.snapshot_location.as_deref(),
            Some("objectstorage://b/snap-1")
        );
    }

    #[test]
    fn test_location_is_set_once() {
        let store = store_with(vec![SnapshotRecord::new("snap-1", "vol-1")]);
        commit_full_location(&store, "snap-1", "objectstorage://b/snap-1").unwrap();
        let second = commit_full_location(&store, "snap-1", "objectstorage://b/other");
        assert!(matches!(second, Err(MetadataError::RolledBack(_))));
    }

    #[test]
    fn test_delta_parent_assigned() {
        let store = store_with(vec![
            uploaded_origin("snap-1"),
            SnapshotRecord::new("snap-2", "vol-1"),
        ]);
        let config = SnapshotConfig::default().with_max_deltas(3);

        let outcome =
            commit_delta_parent(&store, "snap-2", "snap-1", "objectstorage://b/snap-2", &config)
                .unwrap();
        match outcome {
            Assignment::Assigned(record) => {
                assert_eq!(record.previous_snapshot_id.as_deref(), Some("snap-1"));
                assert_eq!(record.is_origin, Some(false));
            }
            other => panic!("expected assignment, got {:?}", other),
        }
    }

    #[test]
    fn test_delta_parent_rechecked_in_transaction() {
        let mut failed_parent = uploaded_origin("snap-1");
        failed_parent.status = SnapshotStatus::Failed;
        let store = store_with(vec![failed_parent, SnapshotRecord::new("snap-2", "vol-1")]);
        let config = SnapshotConfig::default().with_max_deltas(3);

        let outcome =
            commit_delta_parent(&store, "snap-2", "snap-1", "objectstorage://b/snap-2", &config)
                .unwrap();
        assert_eq!(
            outcome,
            Assignment::ParentIneligible {
                parent_snapshot_id: "snap-1".to_string(),
                status: Some(SnapshotStatus::Failed),
            }
        );
        let record = store.get("snap-2").unwrap().unwrap();
        assert_eq!(record.snapshot_location, None);
        assert_eq!(record.is_origin, None);
    }

    #[test]
    fn test_failed_record_location_is_frozen() {
        let mut failed = SnapshotRecord::new("snap-2", "vol-1");
        failed.status = SnapshotStatus::Failed;
        let store = store_with(vec![uploaded_origin("snap-1"), failed]);
        let config = SnapshotConfig::default().with_max_deltas(3);

        let full = commit_full_location(&store, "snap-2", "objectstorage://b/snap-2");
        assert!(matches!(
            full,
            Err(MetadataError::InvalidTransition {
                from: SnapshotStatus::Failed,
                ..
            })
        ));
        let delta =
            commit_delta_parent(&store, "snap-2", "snap-1", "objectstorage://b/snap-2", &config);
        assert!(matches!(
            delta,
            Err(MetadataError::InvalidTransition {
                from: SnapshotStatus::Failed,
                ..
            })
        ));
        assert!(set_snap_point(&store, "snap-2", "sp-2").is_err());

        let record = store.get("snap-2").unwrap().unwrap();
        assert_eq!(record.snapshot_location, None);
        assert_eq!(record.previous_snapshot_id, None);
        assert_eq!(record.is_origin, None);
        assert_eq!(record.snap_point_id, None);
    }

    #[test]
    fn test_delta_parent_missing() {
        let store = store_with(vec![SnapshotRecord::new("snap-2", "vol-1")]);
        let config = SnapshotConfig::default().with_max_deltas(3);
        let outcome =
            commit_delta_parent(&store, "snap-2", "snap-1", "objectstorage://b/snap-2", &config)
                .unwrap();
        assert!(matches!(
            outcome,
            Assignment::ParentIneligible { status: None, .. }
        ));
    }
}
