//! Builds the shared [`mahoraga_routes::RouteState`] every route handler is
//! extracted against: the singletons spec.md §9's design notes insist on
//! constructing once at startup and passing explicitly, never reaching for
//! a hidden global.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use mahoraga_client::UpstreamClient;
use mahoraga_config::Config;
use mahoraga_ledger::StatisticsLedger;
use mahoraga_lock::LockRegistry;
use mahoraga_routes::RouteState;
use mahoraga_stream::StreamEngine;

/// Assembles the [`RouteState`] for `config`, rooted at `cache_root`.
/// `statistics.json` always lives directly under the cache root, per
/// spec.md §6's on-disk layout.
pub async fn build(config: Config, cache_root: impl Into<PathBuf>) -> anyhow::Result<Arc<RouteState>> {
    let cache_root = cache_root.into();
    tokio::fs::create_dir_all(&cache_root).await?;

    let locks = Arc::new(LockRegistry::new());
    let backup: HashSet<String> = config.backup.clone();
    let ledger = Arc::new(StatisticsLedger::load(statistics_path(&cache_root), backup, locks.clone()).await);
    let client = Arc::new(UpstreamClient::new()?);
    let engine = StreamEngine::new(client, ledger, locks.clone());

    Ok(Arc::new(RouteState::new(engine, config, locks, cache_root)))
}

pub fn statistics_path(cache_root: &Path) -> PathBuf {
    cache_root.join("statistics.json")
}
