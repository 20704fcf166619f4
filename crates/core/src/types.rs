//! Snapshot record types
//!
//! This module defines the data model shared by every layer:
//! - `SnapshotStatus`: lifecycle status with a one-way transition table
//! - `SnapshotRecord`: the persisted metadata row for one snapshot
//! - `SnapshotQuery`: predicate + ordering used to search records of a volume
//!
//! ## Status Transitions
//!
//! ```text
//! Pending ──► Available ──► Deleting ──► Deleted
//!    │
//!    └──────► Failed
//! ```
//!
//! The creation engine only ever performs `Pending -> Available` and
//! `Pending -> Failed`. Nothing re-enters `Pending`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Highest value `SnapshotRecord::progress` can hold.
pub const MAX_PROGRESS: u8 = 100;

/// Lifecycle status of a snapshot record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotStatus {
    /// Created by the caller, pipeline not finished
    Pending,
    /// Local snapshot finalized (and uploaded, if transfer is enabled)
    Available,
    /// Terminally failed
    Failed,
    /// Deletion in progress (deletion workflow, outside the creation engine)
    Deleting,
    /// Deleted
    Deleted,
}

impl SnapshotStatus {
    /// All statuses, in declaration order
    pub const ALL: [SnapshotStatus; 5] = [
        SnapshotStatus::Pending,
        SnapshotStatus::Available,
        SnapshotStatus::Failed,
        SnapshotStatus::Deleting,
        SnapshotStatus::Deleted,
    ];

    /// Check if no further creation work can change this status
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SnapshotStatus::Pending)
    }

    /// Check if the status is failed
    pub fn is_failed(&self) -> bool {
        matches!(self, SnapshotStatus::Failed)
    }

    /// Check whether `self -> next` is a legal transition
    ///
    /// Transitions are monotonic: writing the same status again is allowed
    /// (idempotent terminal writes), moving backwards is not.
    pub fn can_transition_to(&self, next: SnapshotStatus) -> bool {
        use SnapshotStatus::*;
        if *self == next {
            return true;
        }
        matches!(
            (self, next),
            (Pending, Available)
                | (Pending, Failed)
                | (Available, Deleting)
                | (Failed, Deleting)
                | (Deleting, Deleted)
        )
    }

    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotStatus::Pending => "pending",
            SnapshotStatus::Available => "available",
            SnapshotStatus::Failed => "failed",
            SnapshotStatus::Deleting => "deleting",
            SnapshotStatus::Deleted => "deleted",
        }
    }

    /// Parse from the lowercase string form
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == s)
    }
}

impl std::fmt::Display for SnapshotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Persisted metadata for one snapshot
///
/// Owned by the metadata store. The creation engine reads it and updates it
/// only inside store transactions, re-reading before every write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Snapshot identifier (record identity)
    pub snapshot_id: String,
    /// Volume the snapshot was taken from
    pub volume_id: String,
    /// Current lifecycle status
    pub status: SnapshotStatus,
    /// Progress percentage, 0..=100
    pub progress: u8,
    /// Upload location URI, `None` until the delta-vs-full decision commits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_location: Option<String>,
    /// Delta parent, `None` for full uploads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_snapshot_id: Option<String>,
    /// `Some(true)` for a full upload, `Some(false)` for a delta.
    ///
    /// `None` marks a record that was never classified (taken before the
    /// volume ever went through delta resolution). Such records are never
    /// used as delta parents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_origin: Option<bool>,
    /// Backend-side identifier of the local snapshot, if the backend uses one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snap_point_id: Option<String>,
    /// Creation time, used for strict chronological ordering
    pub start_time: DateTime<Utc>,
}

impl SnapshotRecord {
    /// Create a new pending record starting now
    pub fn new(snapshot_id: impl Into<String>, volume_id: impl Into<String>) -> Self {
        Self::with_start_time(snapshot_id, volume_id, Utc::now())
    }

    /// Create a new pending record with an explicit start time
    pub fn with_start_time(
        snapshot_id: impl Into<String>,
        volume_id: impl Into<String>,
        start_time: DateTime<Utc>,
    ) -> Self {
        SnapshotRecord {
            snapshot_id: snapshot_id.into(),
            volume_id: volume_id.into(),
            status: SnapshotStatus::Pending,
            progress: 0,
            snapshot_location: None,
            previous_snapshot_id: None,
            is_origin: None,
            snap_point_id: None,
            start_time,
        }
    }

    /// Set the backend snap point id (builder style)
    pub fn with_snap_point(mut self, snap_point_id: impl Into<String>) -> Self {
        self.snap_point_id = Some(snap_point_id.into());
        self
    }

    /// True if this record is the root of a delta chain
    pub fn is_origin(&self) -> bool {
        self.is_origin == Some(true)
    }

    /// True if the record was uploaded after incremental support existed
    ///
    /// Only such records can anchor a new delta.
    pub fn is_delta_capable(&self) -> bool {
        self.snapshot_location.is_some() && self.is_origin.is_some()
    }
}

/// Set of statuses used as a query predicate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusFilter {
    /// Match every status
    Any,
    /// Match only the listed statuses
    In(BTreeSet<SnapshotStatus>),
    /// Match every status except the listed ones
    NotIn(BTreeSet<SnapshotStatus>),
}

impl StatusFilter {
    /// Build an inclusion filter
    pub fn only<I: IntoIterator<Item = SnapshotStatus>>(statuses: I) -> Self {
        StatusFilter::In(statuses.into_iter().collect())
    }

    /// Build an exclusion filter
    pub fn excluding<I: IntoIterator<Item = SnapshotStatus>>(statuses: I) -> Self {
        StatusFilter::NotIn(statuses.into_iter().collect())
    }

    /// Check whether a status passes the filter
    pub fn matches(&self, status: SnapshotStatus) -> bool {
        match self {
            StatusFilter::Any => true,
            StatusFilter::In(set) => set.contains(&status),
            StatusFilter::NotIn(set) => !set.contains(&status),
        }
    }
}

/// Ordering applied to query results, always by `start_time`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryOrder {
    /// Oldest first
    OldestFirst,
    /// Newest first
    NewestFirst,
}

/// Predicate, ordering and limit for searching snapshot records
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotQuery {
    /// Only records of this volume
    pub volume_id: String,
    /// Status predicate
    pub status: StatusFilter,
    /// Only records with `start_time` strictly earlier than this
    pub started_before: Option<DateTime<Utc>>,
    /// Result ordering
    pub order: QueryOrder,
    /// Maximum number of results (None = all)
    pub limit: Option<usize>,
}

impl SnapshotQuery {
    /// Query every record of a volume, oldest first
    pub fn for_volume(volume_id: impl Into<String>) -> Self {
        SnapshotQuery {
            volume_id: volume_id.into(),
            status: StatusFilter::Any,
            started_before: None,
            order: QueryOrder::OldestFirst,
            limit: None,
        }
    }

    /// Restrict statuses
    pub fn with_status(mut self, status: StatusFilter) -> Self {
        self.status = status;
        self
    }

    /// Restrict to records started strictly before `time`
    pub fn started_before(mut self, time: DateTime<Utc>) -> Self {
        self.started_before = Some(time);
        self
    }

    /// Newest first
    pub fn newest_first(mut self) -> Self {
        self.order = QueryOrder::NewestFirst;
        self
    }

    /// Limit result count
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Check whether a record satisfies the predicate (ignores ordering/limit)
    pub fn matches(&self, record: &SnapshotRecord) -> bool {
        record.volume_id == self.volume_id
            && self.status.matches(record.status)
            && self
                .started_before
                .map_or(true, |bound| record.start_time < bound)
    }
}
