//! Engine configuration via `snapvault.toml`
//!
//! Platform-level snapshot settings (transfer on/off, delta limits, retry
//! bounds) live in a small TOML file. On first start a commented default is
//! written; edit it and reload to change behavior.
//!
//! Running pipelines read configuration through a `SharedConfig` handle.
//! Each run copies the settings once at its start, so an update never
//! changes the behavior of a run already in flight.

use crate::error::{SnapshotError, SnapshotResult};
use crate::types::{SnapshotStatus, StatusFilter};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Config file name placed in the service data directory.
pub const CONFIG_FILE_NAME: &str = "snapvault.toml";

/// Default bound on delta-resolution attempts.
pub const DEFAULT_DELTA_RESOLUTION_ATTEMPTS: usize = 10;

/// Default URI scheme of generated snapshot locations.
pub const DEFAULT_LOCATION_SCHEME: &str = "objectstorage";

fn default_true() -> bool {
    true
}

fn default_attempts() -> usize {
    DEFAULT_DELTA_RESOLUTION_ATTEMPTS
}

fn default_scheme() -> String {
    DEFAULT_LOCATION_SCHEME.to_string()
}

fn default_generation_excluded() -> Vec<SnapshotStatus> {
    vec![
        SnapshotStatus::Failed,
        SnapshotStatus::Deleting,
        SnapshotStatus::Deleted,
    ]
}

fn default_restoration_eligible() -> Vec<SnapshotStatus> {
    vec![SnapshotStatus::Pending, SnapshotStatus::Available]
}

/// Snapshot engine configuration loaded from `snapvault.toml`.
///
/// # Example
///
/// ```toml
/// should_transfer_snapshots = true
/// max_snapshot_deltas = 3
/// delta_resolution_attempts = 10
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Upload snapshots to object storage after local creation.
    #[serde(default = "default_true")]
    pub should_transfer_snapshots: bool,
    /// Maximum number of deltas since the last full snapshot. `<= 0` disables deltas.
    #[serde(default)]
    pub max_snapshot_deltas: i32,
    /// Bound on delta-resolution attempts.
    #[serde(default = "default_attempts")]
    pub delta_resolution_attempts: usize,
    /// Base backoff between resolution attempts (exponential). 0 = retry immediately.
    #[serde(default)]
    pub delta_retry_base_delay_ms: u64,
    /// Cap on the backoff between resolution attempts.
    #[serde(default)]
    pub delta_retry_max_delay_ms: u64,
    /// Bound on waiting for a volume or parent lock. Unset waits indefinitely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_wait_timeout_ms: Option<u64>,
    /// URI scheme used when generating snapshot locations.
    #[serde(default = "default_scheme")]
    pub location_scheme: String,
    /// Statuses that make a prior snapshot ineligible as a delta parent.
    #[serde(default = "default_generation_excluded")]
    pub delta_generation_excluded: Vec<SnapshotStatus>,
    /// Statuses of snapshots that may take part in a restorable delta chain.
    #[serde(default = "default_restoration_eligible")]
    pub delta_restoration_eligible: Vec<SnapshotStatus>,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            should_transfer_snapshots: true,
            max_snapshot_deltas: 0,
            delta_resolution_attempts: DEFAULT_DELTA_RESOLUTION_ATTEMPTS,
            delta_retry_base_delay_ms: 0,
            delta_retry_max_delay_ms: 0,
            lock_wait_timeout_ms: None,
            location_scheme: default_scheme(),
            delta_generation_excluded: default_generation_excluded(),
            delta_restoration_eligible: default_restoration_eligible(),
        }
    }
}

impl SnapshotConfig {
    /// Set the max-delta limit (builder style)
    pub fn with_max_deltas(mut self, max: i32) -> Self {
        self.max_snapshot_deltas = max;
        self
    }

    /// Enable or disable uploads (builder style)
    pub fn with_transfer(mut self, enabled: bool) -> Self {
        self.should_transfer_snapshots = enabled;
        self
    }

    /// Set the resolution attempt bound (builder style)
    pub fn with_resolution_attempts(mut self, attempts: usize) -> Self {
        self.delta_resolution_attempts = attempts;
        self
    }

    /// Set the lock wait bound (builder style)
    pub fn with_lock_wait_timeout(mut self, timeout: Duration) -> Self {
        self.lock_wait_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// True if delta uploads are allowed at all
    pub fn deltas_enabled(&self) -> bool {
        self.max_snapshot_deltas > 0
    }

    /// Predicate selecting snapshots eligible as a delta parent
    pub fn generation_filter(&self) -> StatusFilter {
        StatusFilter::excluding(self.delta_generation_excluded.iter().copied())
    }

    /// Predicate selecting snapshots that may be part of a restorable chain
    pub fn restoration_filter(&self) -> StatusFilter {
        StatusFilter::only(self.delta_restoration_eligible.iter().copied())
    }

    /// True if `status` disqualifies a snapshot as delta parent
    pub fn is_generation_excluded(&self, status: SnapshotStatus) -> bool {
        self.delta_generation_excluded.contains(&status)
    }

    /// Lock wait bound as a `Duration`
    pub fn lock_wait_timeout(&self) -> Option<Duration> {
        self.lock_wait_timeout_ms.map(Duration::from_millis)
    }

    /// Backoff before resolution attempt number `attempt` (0-based)
    pub fn resolution_delay(&self, attempt: usize) -> Duration {
        // Cap the shift to prevent overflow (1 << 63 is the max for u64)
        let shift = attempt.min(63);
        let multiplier = 1u64 << shift;
        let delay_ms = self.delta_retry_base_delay_ms.saturating_mul(multiplier);
        Duration::from_millis(delay_ms.min(self.delta_retry_max_delay_ms))
    }

    /// Build the location URI for an uploaded snapshot
    pub fn snapshot_location(&self, bucket: &str, snapshot_id: &str) -> String {
        format!("{}://{}/{}", self.location_scheme, bucket, snapshot_id)
    }

    /// Check settings for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns `SnapshotError::Config` describing the first problem found.
    pub fn validate(&self) -> SnapshotResult<()> {
        if self.delta_resolution_attempts == 0 {
            return Err(SnapshotError::config(
                "delta_resolution_attempts must be at least 1",
            ));
        }
        if self.location_scheme.trim().is_empty() {
            return Err(SnapshotError::config("location_scheme must not be empty"));
        }
        if self.delta_retry_max_delay_ms < self.delta_retry_base_delay_ms {
            return Err(SnapshotError::config(format!(
                "delta_retry_max_delay_ms ({}) is lower than delta_retry_base_delay_ms ({})",
                self.delta_retry_max_delay_ms, self.delta_retry_base_delay_ms
            )));
        }
        if self.delta_restoration_eligible.is_empty() {
            return Err(SnapshotError::config(
                "delta_restoration_eligible must list at least one status",
            ));
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# SnapVault snapshot engine configuration

# Upload snapshots to object storage after the local snapshot is created.
should_transfer_snapshots = true

# Maximum deltas since the last full snapshot before a new full upload is forced.
# 0 (default) disables incremental uploads.
max_snapshot_deltas = 0

# Bound on delta-resolution attempts when parents are contended (default 10).
delta_resolution_attempts = 10

# Exponential backoff between resolution attempts, in milliseconds (0 = none).
delta_retry_base_delay_ms = 0
delta_retry_max_delay_ms = 0

# Bound on waiting for a volume or parent lock (unset = wait indefinitely).
# lock_wait_timeout_ms = 30000

# URI scheme of generated snapshot locations.
location_scheme = "objectstorage"

# Statuses disqualifying a prior snapshot as delta parent.
delta_generation_excluded = ["failed", "deleting", "deleted"]

# Statuses of snapshots allowed in a restorable delta chain.
delta_restoration_eligible = ["pending", "available"]
"#
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> SnapshotResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SnapshotError::config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: SnapshotConfig = toml::from_str(&content).map_err(|e| {
            SnapshotError::config(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> SnapshotResult<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                SnapshotError::config(format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> SnapshotResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| SnapshotError::config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            SnapshotError::config(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }
}

/// Shared, updatable configuration handle
#[derive(Debug, Clone, Default)]
pub struct SharedConfig {
    inner: Arc<RwLock<SnapshotConfig>>,
}

impl SharedConfig {
    /// Wrap a config
    pub fn new(config: SnapshotConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Copy of the current settings
    pub fn current(&self) -> SnapshotConfig {
        self.inner.read().clone()
    }

    /// Replace the settings after validating them
    pub fn replace(&self, config: SnapshotConfig) -> SnapshotResult<()> {
        config.validate()?;
        *self.inner.write() = config;
        Ok(())
    }

    /// Mutate the settings in place
    pub fn update<F: FnOnce(&mut SnapshotConfig)>(&self, f: F) -> SnapshotResult<()> {
        let mut next = self.current();
        f(&mut next);
        self.replace(next)
    }

    /// Reload settings from a file
    pub fn reload_from(&self, path: &Path) -> SnapshotResult<()> {
        let config = SnapshotConfig::from_file(path)?;
        *self.inner.write() = config;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config_transfers_without_deltas() {
        let config = SnapshotConfig::default();
        assert!(config.should_transfer_snapshots);
        assert!(!config.deltas_enabled());
        assert_eq!(config.delta_resolution_attempts, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn default_toml_parses_to_default() {
        let config: SnapshotConfig = toml::from_str(SnapshotConfig::default_toml()).unwrap();
        assert_eq!(config, SnapshotConfig::default());
    }

    #[test]
    fn empty_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "").unwrap();

        let config = SnapshotConfig::from_file(&path).unwrap();
        assert_eq!(config, SnapshotConfig::default());
    }

    #[test]
    fn parse_status_lists() {
        let config: SnapshotConfig = toml::from_str(
            r#"
max_snapshot_deltas = 3
delta_generation_excluded = ["failed"]
"#,
        )
        .unwrap();
        assert_eq!(config.max_snapshot_deltas, 3);
        assert!(config.is_generation_excluded(SnapshotStatus::Failed));
        assert!(!config.is_generation_excluded(SnapshotStatus::Deleted));
    }

    #[test]
    fn unknown_status_is_rejected() {
        let parsed: Result<SnapshotConfig, _> =
            toml::from_str("delta_generation_excluded = [\"creating\"]");
        assert!(parsed.is_err());
    }

    #[test]
    fn zero_attempts_fails_validation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "delta_resolution_attempts = 0\n").unwrap();

        let err = SnapshotConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, SnapshotError::Config(_)));
    }

    #[test]
    fn inverted_backoff_fails_validation() {
        let config = SnapshotConfig {
            delta_retry_base_delay_ms: 50,
            delta_retry_max_delay_ms: 10,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn write_default_does_not_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "should_transfer_snapshots = false\n").unwrap();

        SnapshotConfig::write_default_if_missing(&path).unwrap();

        let config = SnapshotConfig::from_file(&path).unwrap();
        assert!(!config.should_transfer_snapshots);
    }

    #[test]
    fn write_to_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let config = SnapshotConfig::default()
            .with_max_deltas(5)
            .with_lock_wait_timeout(Duration::from_secs(2));

        config.write_to_file(&path).unwrap();
        let loaded = SnapshotConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.lock_wait_timeout(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn lock_wait_timeout_saturates() {
        let config = SnapshotConfig::default().with_lock_wait_timeout(Duration::MAX);
        assert_eq!(config.lock_wait_timeout_ms, Some(u64::MAX));
    }

    #[test]
    fn resolution_delay_is_capped() {
        let config = SnapshotConfig {
            delta_retry_base_delay_ms: 10,
            delta_retry_max_delay_ms: 100,
            ..Default::default()
        };
        assert_eq!(config.resolution_delay(0), Duration::from_millis(10));
        assert_eq!(config.resolution_delay(2), Duration::from_millis(40));
        assert_eq!(config.resolution_delay(10), Duration::from_millis(100));
        assert_eq!(
            SnapshotConfig::default().resolution_delay(5),
            Duration::ZERO
        );
    }

    #[test]
    fn snapshot_location_format() {
        let config = SnapshotConfig::default();
        assert_eq!(
            config.snapshot_location("snapshots", "snap-1"),
            "objectstorage://snapshots/snap-1"
        );
    }

    #[test]
    fn shared_config_rejects_invalid_update() {
        let shared = SharedConfig::new(SnapshotConfig::default());
        assert!(shared.update(|c| c.delta_resolution_attempts = 0).is_err());
        assert_eq!(shared.current().delta_resolution_attempts, 10);

        shared.update(|c| c.should_transfer_snapshots = false).unwrap();
        assert!(!shared.current().should_transfer_snapshots);
    }
}
