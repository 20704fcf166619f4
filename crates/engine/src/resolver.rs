//! Delta chain resolution
//!
//! Decides whether a new snapshot can be uploaded as a delta against the
//! most recent prior snapshot of its volume, and commits that decision to
//! the record.
//!
//! ## Eligibility
//!
//! Two status predicates are involved and they are deliberately distinct:
//!
//! - *generation*: which prior snapshots may anchor a new delta
//!   (`delta_generation_excluded`, default failed/deleting/deleted)
//! - *restoration*: which snapshots take part in a restorable chain
//!   (`delta_restoration_eligible`, default pending/available)
//!
//! A candidate must also be delta capable: it has a location and has been
//! classified as origin or delta. Records taken before the volume ever went
//! through resolution are never parents.
//!
//! ## Chain depth
//!
//! Depth is the number of `previous_snapshot_id` edges between the
//! candidate and its origin, walking only through restoration-eligible
//! records. A new delta is allowed while `depth < max_snapshot_deltas`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use snapvault_concurrency::LockRegistry;
use snapvault_core::{
    MetadataError, MetadataResult, SnapshotConfig, SnapshotError, SnapshotMetadataStore,
    SnapshotQuery, SnapshotRecord, SnapshotResult, SnapshotStatus,
};
use tracing::{debug, error, info, warn};

use crate::transitions::{self, Assignment};

/// Why a snapshot is uploaded in full
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoDeltaReason {
    /// The backend cannot produce incremental resources
    IncrementalUnsupported,
    /// `max_snapshot_deltas <= 0`
    DeltasDisabled,
    /// No earlier snapshot passes the generation predicate
    NoPriorSnapshot,
    /// The most recent snapshot has no location or was never classified
    NeverUploaded {
        /// Rejected candidate
        candidate_id: String,
    },
    /// The chain behind the candidate is already at the limit
    ChainLimitReached {
        /// Candidate chain depth
        depth: usize,
        /// Configured limit
        limit: i32,
    },
    /// Candidate is missing from the restorable set (data inconsistency)
    ChainInconsistent {
        /// Rejected candidate
        candidate_id: String,
    },
    /// The chosen parent stopped being eligible before the commit
    ParentInvalidated {
        /// Rejected parent
        candidate_id: String,
        /// Parent status at commit time, `None` if the record disappeared
        status: Option<SnapshotStatus>,
    },
    /// A metadata query failed; resolution treats it as "no parent"
    LookupFailed(String),
}

impl std::fmt::Display for NoDeltaReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NoDeltaReason::IncrementalUnsupported => write!(f, "backend has no incremental support"),
            NoDeltaReason::DeltasDisabled => write!(f, "deltas disabled"),
            NoDeltaReason::NoPriorSnapshot => write!(f, "no prior snapshot"),
            NoDeltaReason::NeverUploaded { candidate_id } => {
                write!(f, "{} was never uploaded with delta support", candidate_id)
            }
            NoDeltaReason::ChainLimitReached { depth, limit } => {
                write!(f, "chain depth {} reached limit {}", depth, limit)
            }
            NoDeltaReason::ChainInconsistent { candidate_id } => {
                write!(f, "{} is not in the restorable chain", candidate_id)
            }
            NoDeltaReason::ParentInvalidated { candidate_id, status } => match status {
                Some(status) => write!(f, "parent {} became {}", candidate_id, status),
                None => write!(f, "parent {} disappeared", candidate_id),
            },
            NoDeltaReason::LookupFailed(reason) => write!(f, "lookup failed: {}", reason),
        }
    }
}

/// Result of one parent search
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParentSearch {
    /// Candidate may be used as the delta parent
    Parent {
        /// Parent record as read
        record: SnapshotRecord,
        /// Chain depth behind the parent
        depth: usize,
    },
    /// Upload in full
    NoDelta(NoDeltaReason),
}

/// Decision committed to the record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaDecision {
    /// Uploaded as a delta of `parent`
    Delta {
        /// Parent record as read at resolution time
        parent: SnapshotRecord,
        /// Chain depth behind the parent
        depth: usize,
        /// Target record after the commit
        record: SnapshotRecord,
    },
    /// Uploaded in full, as a new origin
    Full {
        /// Why no parent was used
        reason: NoDeltaReason,
        /// Target record after the commit
        record: SnapshotRecord,
    },
}

impl DeltaDecision {
    /// Committed target record
    pub fn record(&self) -> &SnapshotRecord {
        match self {
            DeltaDecision::Delta { record, .. } | DeltaDecision::Full { record, .. } => record,
        }
    }

    /// Parent record, if the snapshot is a delta
    pub fn parent(&self) -> Option<&SnapshotRecord> {
        match self {
            DeltaDecision::Delta { parent, .. } => Some(parent),
            DeltaDecision::Full { .. } => None,
        }
    }

    /// True for delta uploads
    pub fn is_delta(&self) -> bool {
        matches!(self, DeltaDecision::Delta { .. })
    }
}

/// Walk the chain backwards from `from` through `restorable`
///
/// Returns the chain starting at `from` and ending at an origin, at a record
/// without parent, or at the last record whose parent is not restorable.
/// Returns `None` if `from` itself is not restorable. A cycle ends the walk
/// at the record that closes it.
pub fn snapshot_chain(restorable: &[SnapshotRecord], from: &str) -> Option<Vec<SnapshotRecord>> {
    let by_id: HashMap<&str, &SnapshotRecord> = restorable
        .iter()
        .map(|record| (record.snapshot_id.as_str(), record))
        .collect();

    let mut current = *by_id.get(from)?;
    let mut visited: HashSet<&str> = HashSet::new();
    visited.insert(current.snapshot_id.as_str());
    let mut chain = vec![current.clone()];

    while !current.is_origin() {
        let parent = match current
            .previous_snapshot_id
            .as_deref()
            .and_then(|id| by_id.get(id))
        {
            Some(parent) => *parent,
            None => break,
        };
        if !visited.insert(parent.snapshot_id.as_str()) {
            error!(
                target: "snapvault::resolver",
                snapshot_id = %from,
                repeated = %parent.snapshot_id,
                "Cycle in snapshot chain"
            );
            break;
        }
        chain.push(parent.clone());
        current = parent;
    }

    Some(chain)
}

/// Number of edges between `from` and the end of its chain
pub fn chain_depth(restorable: &[SnapshotRecord], from: &str) -> Option<usize> {
    snapshot_chain(restorable, from).map(|chain| chain.len() - 1)
}

/// Finds and commits delta parents
pub struct DeltaChainResolver {
    store: Arc<dyn SnapshotMetadataStore>,
    locks: Arc<LockRegistry>,
}

impl DeltaChainResolver {
    /// Create a resolver over `store`, serializing parent commits on `locks`
    pub fn new(store: Arc<dyn SnapshotMetadataStore>, locks: Arc<LockRegistry>) -> Self {
        Self { store, locks }
    }

    /// Search for a delta parent for `target`, without writing anything
    ///
    /// # Errors
    ///
    /// Any metadata error from the underlying queries.
    pub fn find_parent(
        &self,
        target: &SnapshotRecord,
        config: &SnapshotConfig,
    ) -> MetadataResult<ParentSearch> {
        if !config.deltas_enabled() {
            return Ok(ParentSearch::NoDelta(NoDeltaReason::DeltasDisabled));
        }

        let generation = SnapshotQuery::for_volume(&target.volume_id)
            .with_status(config.generation_filter())
            .started_before(target.start_time)
            .newest_first()
            .limit(1);
        let candidate = match self.store.find_first(&generation)? {
            Some(candidate) => candidate,
            None => return Ok(ParentSearch::NoDelta(NoDeltaReason::NoPriorSnapshot)),
        };

        if !candidate.is_delta_capable() {
            debug!(
                target: "snapvault::resolver",
                snapshot_id = %target.snapshot_id,
                candidate = %candidate.snapshot_id,
                "Previous snapshot was never uploaded with delta support"
            );
            return Ok(ParentSearch::NoDelta(NoDeltaReason::NeverUploaded {
                candidate_id: candidate.snapshot_id,
            }));
        }

        let restoration = SnapshotQuery::for_volume(&target.volume_id)
            .with_status(config.restoration_filter())
            .started_before(target.start_time)
            .newest_first();
        let restorable = self.store.find(&restoration)?;

        let depth = match chain_depth(&restorable, &candidate.snapshot_id) {
            Some(depth) => depth,
            None => {
                error!(
                    target: "snapvault::resolver",
                    snapshot_id = %target.snapshot_id,
                    candidate = %candidate.snapshot_id,
                    status = %candidate.status,
                    "Delta candidate is not part of the restorable chain"
                );
                return Ok(ParentSearch::NoDelta(NoDeltaReason::ChainInconsistent {
                    candidate_id: candidate.snapshot_id,
                }));
            }
        };

        let limit = config.max_snapshot_deltas;
        if (depth as i64) < i64::from(limit) {
            debug!(
                target: "snapvault::resolver",
                snapshot_id = %target.snapshot_id,
                parent = %candidate.snapshot_id,
                depth,
                "Found delta parent"
            );
            Ok(ParentSearch::Parent {
                record: candidate,
                depth,
            })
        } else {
            Ok(ParentSearch::NoDelta(NoDeltaReason::ChainLimitReached {
                depth,
                limit,
            }))
        }
    }

    /// Resolve the delta parent of `snapshot_id` and commit the decision
    ///
    /// Each attempt re-reads the target, searches for a parent and, with the
    /// parent's lock held, commits location, parent and origin flag in one
    /// transaction that re-checks the parent. Without a parent, or when the
    /// parent became ineligible before the commit, the fresh location is
    /// committed with `is_origin = true` and no parent. A contended parent
    /// lock or a transient store error costs one attempt.
    ///
    /// # Errors
    ///
    /// `AlreadyFailed` if the target left `pending` meanwhile.
    /// `MetadataUpdateFailed` when no decision could be committed within
    /// `delta_resolution_attempts`, or on a non-transient store error.
    pub fn resolve(
        &self,
        snapshot_id: &str,
        location: &str,
        backend_supports_incremental: bool,
        config: &SnapshotConfig,
    ) -> SnapshotResult<DeltaDecision> {
        let attempts = config.delta_resolution_attempts.max(1);
        let mut last_error =
            MetadataError::Conflict(format!("no delta decision committed for {}", snapshot_id));

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = config.resolution_delay(attempt - 1);
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
            }

            let target = self
                .store
                .get(snapshot_id)
                .map_err(|e| SnapshotError::metadata(snapshot_id, e))?
                .ok_or_else(|| SnapshotError::SnapshotNotFound(snapshot_id.to_string()))?;

            let search = if !backend_supports_incremental {
                ParentSearch::NoDelta(NoDeltaReason::IncrementalUnsupported)
            } else {
                match self.find_parent(&target, config) {
                    Ok(search) => search,
                    Err(e) => {
                        warn!(
                            target: "snapvault::resolver",
                            snapshot_id = %snapshot_id,
                            error = %e,
                            "Parent lookup failed, uploading in full"
                        );
                        ParentSearch::NoDelta(NoDeltaReason::LookupFailed(e.to_string()))
                    }
                }
            };

            let committed = match search {
                ParentSearch::Parent { record, depth } => {
                    self.commit_parent(snapshot_id, location, record, depth, config)
                }
                ParentSearch::NoDelta(reason) => self.commit_full(snapshot_id, location, reason),
            };

            match committed {
                Ok(decision) => {
                    match &decision {
                        DeltaDecision::Delta { parent, depth, .. } => info!(
                            target: "snapvault::resolver",
                            snapshot_id = %snapshot_id,
                            parent = %parent.snapshot_id,
                            depth,
                            attempt,
                            "Uploading as delta"
                        ),
                        DeltaDecision::Full { reason, .. } => info!(
                            target: "snapvault::resolver",
                            snapshot_id = %snapshot_id,
                            reason = %reason,
                            attempt,
                            "Uploading in full"
                        ),
                    }
                    return Ok(decision);
                }
                Err(MetadataError::InvalidTransition {
                    from: SnapshotStatus::Failed,
                    ..
                }) => {
                    info!(
                        target: "snapvault::resolver",
                        snapshot_id = %snapshot_id,
                        "Snapshot was marked failed during resolution, nothing written"
                    );
                    return Err(SnapshotError::AlreadyFailed(snapshot_id.to_string()));
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        target: "snapvault::resolver",
                        snapshot_id = %snapshot_id,
                        attempt,
                        error = %e,
                        "Delta decision not committed, retrying"
                    );
                    last_error = e;
                }
                Err(e) => return Err(SnapshotError::metadata(snapshot_id, e)),
            }
        }

        error!(
            target: "snapvault::resolver",
            snapshot_id = %snapshot_id,
            attempts,
            error = %last_error,
            "Exhausted delta resolution attempts"
        );
        Err(SnapshotError::metadata(snapshot_id, last_error))
    }

    fn commit_full(
        &self,
        snapshot_id: &str,
        location: &str,
        reason: NoDeltaReason,
    ) -> MetadataResult<DeltaDecision> {
        transitions::commit_full_location(self.store.as_ref(), snapshot_id, location)
            .map(|record| DeltaDecision::Full { reason, record })
    }

    /// Commit `parent` under its lock
    ///
    /// A contended lock is reported as `MetadataError::Conflict` so the
    /// attempt is retried.
    fn commit_parent(
        &self,
        snapshot_id: &str,
        location: &str,
        parent: SnapshotRecord,
        depth: usize,
        config: &SnapshotConfig,
    ) -> MetadataResult<DeltaDecision> {
        let _guard = self
            .locks
            .acquire_for(&parent.snapshot_id, config.lock_wait_timeout())
            .map_err(|e| {
                warn!(
                    target: "snapvault::resolver",
                    snapshot_id = %snapshot_id,
                    parent = %parent.snapshot_id,
                    error = %e,
                    "Could not lock delta parent"
                );
                MetadataError::Conflict(format!(
                    "delta parent {} is locked: {}",
                    parent.snapshot_id, e
                ))
            })?;

        match transitions::commit_delta_parent(
            self.store.as_ref(),
            snapshot_id,
            &parent.snapshot_id,
            location,
            config,
        )? {
            Assignment::Assigned(record) => Ok(DeltaDecision::Delta {
                parent,
                depth,
                record,
            }),
            Assignment::ParentIneligible {
                parent_snapshot_id,
                status,
            } => self.commit_full(
                snapshot_id,
                location,
                NoDeltaReason::ParentInvalidated {
                    candidate_id: parent_snapshot_id,
                    status,
                },
            ),
        }
    }
}

impl std::fmt::Debug for DeltaChainResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaChainResolver")
            .field("locks", &self.locks)
            .finish()
    }
}
