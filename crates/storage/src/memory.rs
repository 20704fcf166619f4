//! InMemoryMetadataStore: transactional snapshot-record store
//!
//! This module implements `SnapshotMetadataStore` using:
//! - `BTreeMap<SnapshotId, SnapshotRecord>` for the committed records
//! - `VolumeIndex` for volume-scoped queries
//! - one `parking_lot::RwLock` over both, so a commit updates records and
//!   index together
//!
//! # Transactions
//!
//! A transaction holds the write lock for its whole body. Writes are staged
//! in a private map and applied only when the body returns `Ok`, which gives
//! serializable, all-or-nothing semantics. Reads inside the body see the
//! staged writes first.
//!
//! # Fault injection
//!
//! Tests can queue errors for upcoming transactions (`fail_next_transaction`).
//! Interleaving concurrent writers between queries is done by wrapping the
//! store (see `snapvault_engine::testing::InterleavedStore`).

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use snapvault_core::{
    MetadataError, MetadataResult, MetadataTransaction, QueryOrder, SnapshotMetadataStore,
    SnapshotQuery, SnapshotRecord,
};

use crate::index::VolumeIndex;

#[derive(Debug, Default)]
struct StoreState {
    records: BTreeMap<String, SnapshotRecord>,
    volumes: VolumeIndex,
}

impl StoreState {
    fn apply(&mut self, record: SnapshotRecord) {
        if let Some(old) = self.records.get(&record.snapshot_id) {
            if old.volume_id != record.volume_id {
                let old_volume = old.volume_id.clone();
                self.volumes.remove(&old_volume, &record.snapshot_id);
            }
        }
        self.volumes.insert(&record.volume_id, &record.snapshot_id);
        self.records.insert(record.snapshot_id.clone(), record);
    }
}

/// Writes staged by one transaction body
struct StagedTransaction<'a> {
    committed: &'a BTreeMap<String, SnapshotRecord>,
    writes: BTreeMap<String, SnapshotRecord>,
}

impl MetadataTransaction for StagedTransaction<'_> {
    fn get(&self, snapshot_id: &str) -> MetadataResult<Option<SnapshotRecord>> {
        Ok(self
            .writes
            .get(snapshot_id)
            .or_else(|| self.committed.get(snapshot_id))
            .cloned())
    }

    fn put(&mut self, record: SnapshotRecord) -> MetadataResult<()> {
        if record.snapshot_id.is_empty() {
            return Err(MetadataError::RolledBack(
                "record without snapshot id".to_string(),
            ));
        }
        self.writes.insert(record.snapshot_id.clone(), record);
        Ok(())
    }
}

/// In-memory, thread-safe snapshot metadata store
#[derive(Default)]
pub struct InMemoryMetadataStore {
    state: RwLock<StoreState>,
    injected_failures: Mutex<VecDeque<MetadataError>>,
    committed: AtomicU64,
    rolled_back: AtomicU64,
}

impl InMemoryMetadataStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with records
    pub fn with_records<I: IntoIterator<Item = SnapshotRecord>>(records: I) -> Self {
        let store = Self::new();
        {
            let mut state = store.state.write();
            for record in records {
                state.apply(record);
            }
        }
        store
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.state.read().records.len()
    }

    /// Check if the store has no records
    pub fn is_empty(&self) -> bool {
        self.state.read().records.is_empty()
    }

    /// All records, ordered by snapshot id
    pub fn records(&self) -> Vec<SnapshotRecord> {
        self.state.read().records.values().cloned().collect()
    }

    /// Make the next transaction fail with `error` before its body runs
    ///
    /// Calls queue up: each transaction consumes one injected failure.
    pub fn fail_next_transaction(&self, error: MetadataError) {
        self.injected_failures.lock().push_back(error);
    }

    /// Number of committed transactions
    pub fn committed_transactions(&self) -> u64 {
        self.committed.load(Ordering::Relaxed)
    }

    /// Number of transactions that ended without applying writes
    pub fn rolled_back_transactions(&self) -> u64 {
        self.rolled_back.load(Ordering::Relaxed)
    }

    fn sort_and_limit(query: &SnapshotQuery, mut matches: Vec<SnapshotRecord>) -> Vec<SnapshotRecord> {
        matches.sort_by(|a, b| {
            a.start_time
                .cmp(&b.start_time)
                .then_with(|| a.snapshot_id.cmp(&b.snapshot_id))
        });
        if query.order == QueryOrder::NewestFirst {
            matches.reverse();
        }
        if let Some(limit) = query.limit {
            matches.truncate(limit);
        }
        matches
    }
}

impl SnapshotMetadataStore for InMemoryMetadataStore {
    fn insert(&self, record: SnapshotRecord) -> MetadataResult<()> {
        let mut state = self.state.write();
        if state.records.contains_key(&record.snapshot_id) {
            return Err(MetadataError::AlreadyExists(record.snapshot_id));
        }
        trace!(target: "snapvault::store", snapshot_id = %record.snapshot_id, "Record inserted");
        state.apply(record);
        Ok(())
    }

    fn get(&self, snapshot_id: &str) -> MetadataResult<Option<SnapshotRecord>> {
        Ok(self.state.read().records.get(snapshot_id).cloned())
    }

    fn transaction(
        &self,
        body: &mut dyn FnMut(&mut dyn MetadataTransaction) -> MetadataResult<()>,
    ) -> MetadataResult<()> {
        if let Some(error) = self.injected_failures.lock().pop_front() {
            debug!(target: "snapvault::store", error = %error, "Injected transaction failure");
            self.rolled_back.fetch_add(1, Ordering::Relaxed);
            return Err(error);
        }

        let mut state = self.state.write();
        let mut staged = StagedTransaction {
            committed: &state.records,
            writes: BTreeMap::new(),
        };

        match body(&mut staged) {
            Ok(()) => {
                let writes = staged.writes;
                let count = writes.len();
                for record in writes.into_values() {
                    state.apply(record);
                }
                self.committed.fetch_add(1, Ordering::Relaxed);
                trace!(target: "snapvault::store", writes = count, "Transaction committed");
                Ok(())
            }
            Err(e) => {
                self.rolled_back.fetch_add(1, Ordering::Relaxed);
                trace!(target: "snapvault::store", error = %e, "Transaction rolled back");
                Err(e)
            }
        }
    }

    fn find(&self, query: &SnapshotQuery) -> MetadataResult<Vec<SnapshotRecord>> {
        let state = self.state.read();
        let matches: Vec<SnapshotRecord> = state
            .volumes
            .get(&query.volume_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.records.get(id))
                    .filter(|record| query.matches(record))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self::sort_and_limit(query, matches))
    }
}

impl std::fmt::Debug for InMemoryMetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryMetadataStore")
            .field("records", &self.len())
            .field("committed", &self.committed_transactions())
            .field("rolled_back", &self.rolled_back_transactions())
            .finish()
    }
}
