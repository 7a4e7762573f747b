//! Per-mirror request statistics used to rank mirrors for load balancing.
//!
//! Two quantities are tracked per upstream host: how many requests are
//! currently in flight against it (in-memory only, reset on restart) and how
//! many cumulative seconds requests against it have spent in flight (durable,
//! reloaded from `statistics.json` on startup). Both feed the ranking tuple
//! a load balancer sorts mirrors by.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use mahoraga_lock::{LockRegistry, STATISTICS_KEY};
use serde::{Deserialize, Serialize};

/// On-disk schema version. Bumped whenever the persisted shape changes in a
/// way that makes older files unreadable; a file carrying a different value
/// is treated the same as a missing one rather than rejected outright.
const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedStatistics {
    version: u32,
    #[serde(default)]
    total_seconds: HashMap<String, f64>,
}

/// A ranking key for a single host: lower sorts first. Backup mirrors always
/// rank after non-backup ones regardless of load; among peers in the same
/// tier, fewer concurrent requests and fewer cumulative seconds win.
pub type RankKey = (bool, i64, f64);

/// Durable, concurrency-safe scoreboard of per-host request statistics.
pub struct StatisticsLedger {
    path: PathBuf,
    locks: Arc<LockRegistry>,
    backup_servers: HashSet<String>,
    concurrent_requests: DashMap<String, i64>,
    total_seconds: DashMap<String, f64>,
}

impl StatisticsLedger {
    /// Loads `statistics.json` from `path`, treating a missing file, an
    /// unreadable one, or one whose `version` doesn't match the current
    /// schema as an empty ledger rather than a startup failure.
    pub async fn load(path: impl Into<PathBuf>, backup_servers: HashSet<String>, locks: Arc<LockRegistry>) -> Self {
        let path = path.into();
        let persisted = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<PersistedStatistics>(&bytes) {
                Ok(stats) if stats.version == SCHEMA_VERSION => stats,
                Ok(_) => {
                    tracing::warn!(path = %path.display(), "statistics file has an unrecognized version, starting empty");
                    PersistedStatistics::default()
                }
                Err(error) => {
                    tracing::warn!(path = %path.display(), %error, "statistics file is not valid JSON, starting empty");
                    PersistedStatistics::default()
                }
            },
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => PersistedStatistics::default(),
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "failed to read statistics file, starting empty");
                PersistedStatistics::default()
            }
        };

        let total_seconds = DashMap::new();
        for (host, seconds) in persisted.total_seconds {
            total_seconds.insert(host, seconds);
        }

        Self {
            path,
            locks,
            backup_servers,
            concurrent_requests: DashMap::new(),
            total_seconds,
        }
    }

    /// The ranking key for `host`: `(is_backup, concurrency, total_seconds)`.
    /// Hosts never seen before rank as having zero concurrency and zero
    /// accumulated seconds, i.e. as the most attractive mirror in their tier.
    pub fn key(&self, host: &str) -> RankKey {
        let is_backup = self.backup_servers.contains(host);
        let concurrency = self.concurrent_requests.get(host).map(|v| *v).unwrap_or(0);
        let seconds = self.total_seconds.get(host).map(|v| *v).unwrap_or(0.0);
        (is_backup, concurrency, seconds)
    }

    /// Records that a request against `host` has started. Purely in-memory;
    /// never persisted and never survives a restart.
    pub fn on_open(&self, host: &str) {
        *self.concurrent_requests.entry(host.to_string()).or_insert(0) += 1;
    }

    /// Records that a request against `host` has finished. Saturates at zero
    /// so a mismatched `on_close` without a prior `on_open` can't underflow
    /// the counter negative.
    pub fn on_close(&self, host: &str) {
        if let Some(mut entry) = self.concurrent_requests.get_mut(host) {
            *entry = (*entry - 1).max(0);
        }
    }

    /// Adds `delta_seconds` to `host`'s cumulative total and persists the
    /// updated ledger to disk, serialized against every other writer via the
    /// shared [`LockRegistry`]. Only deltas of at least one second are
    /// recorded at all — shorter requests never touch disk, matching
    /// spec.md §4.1 ("Only deltas ≥ 1 second are recorded").
    /// I/O failures are logged and swallowed: a failed write only costs
    /// ranking accuracy, never correctness.
    pub async fn update(&self, host: &str, delta_seconds: f64) {
        if delta_seconds < 1.0 {
            return;
        }

        let _guard = self.locks.lock(STATISTICS_KEY).await;

        let updated = {
            let mut entry = self.total_seconds.entry(host.to_string()).or_insert(0.0);
            *entry += delta_seconds;
            *entry
        };
        tracing::trace!(host, total_seconds = updated, "updated mirror statistics");

        if let Err(error) = self.persist().await {
            tracing::warn!(path = %self.path.display(), %error, "failed to persist statistics");
        }
    }

    async fn persist(&self) -> std::io::Result<()> {
        let snapshot = PersistedStatistics {
            version: SCHEMA_VERSION,
            total_seconds: self
                .total_seconds
                .iter()
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect(),
        };
        let bytes = serde_json::to_vec_pretty(&snapshot).expect("statistics serialize to JSON");
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, bytes).await
    }
}
