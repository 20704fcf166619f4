//! Secondary index for volume-scoped queries
//!
//! Maps VolumeId → Set<SnapshotId> so that searching the snapshots of one
//! volume is O(volume size) instead of O(total records).

use std::collections::{BTreeSet, HashMap};

/// Secondary index: volume id → snapshot ids
#[derive(Debug, Default)]
pub struct VolumeIndex {
    index: HashMap<String, BTreeSet<String>>,
}

impl VolumeIndex {
    /// Create a new empty VolumeIndex
    pub fn new() -> Self {
        Self {
            index: HashMap::new(),
        }
    }

    /// Add a snapshot to its volume's set
    pub fn insert(&mut self, volume_id: &str, snapshot_id: &str) {
        self.index
            .entry(volume_id.to_string())
            .or_default()
            .insert(snapshot_id.to_string());
    }

    /// Remove a snapshot from its volume's set
    ///
    /// Empty sets are dropped so the index does not accumulate them.
    pub fn remove(&mut self, volume_id: &str, snapshot_id: &str) {
        if let Some(ids) = self.index.get_mut(volume_id) {
            ids.remove(snapshot_id);
            if ids.is_empty() {
                self.index.remove(volume_id);
            }
        }
    }

    /// Snapshot ids of a volume
    pub fn get(&self, volume_id: &str) -> Option<&BTreeSet<String>> {
        self.index.get(volume_id)
    }

    /// Check if the index is empty
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Number of volumes in the index
    pub fn len(&self) -> usize {
        self.index.len()
    }
}
