//! Per-family axum route adapters (spec.md §4.6/§6): thin HTTP-shaped
//! wrappers around [`mahoraga_stream::StreamEngine`] that know, for one
//! upstream family, how to validate a request path, build the candidate
//! mirror list, and (where the family supports it) derive the integrity
//! tuple that makes a cached response verifiable.
//!
//! None of these modules talks to the network or the filesystem directly
//! except where a family's caching trick requires it (npm's resolved-version
//! JSON, the pyodide tarball extraction, the `.sha256` sidecar lookup) —
//! everything else goes through [`RouteState::engine`].

pub mod conda;
pub mod error;
pub mod npm;
pub mod passthrough;
pub mod paths;
pub mod pyodide;
pub mod pypi;
pub mod python;
pub mod response;
pub mod shards;
pub mod uv;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use mahoraga_config::Config;
use mahoraga_lock::LockRegistry;
use mahoraga_stream::StreamEngine;

/// Shared state every route handler is extracted against. Cheap to clone
/// (every field is an `Arc` or a config snapshot), so it is stored behind
/// `axum::extract::State<Arc<RouteState>>` rather than cloned per request.
pub struct RouteState {
    pub engine: StreamEngine,
    pub config: Config,
    /// Used only by adapters that need a lock on something other than a
    /// `StreamEngine::stream` cache path: npm's resolved-version/metadata
    /// JSON files and the pyodide tarball extraction, neither of which the
    /// engine knows about. Sharing the same registry the engine uses means
    /// a route handler must never hold one of these locks while also
    /// calling `engine.stream()` with the *same* key — see
    /// [`npm::dispatch`] for how that's avoided.
    pub locks: Arc<LockRegistry>,
    cache_root: PathBuf,
}

impl RouteState {
    pub fn new(engine: StreamEngine, config: Config, locks: Arc<LockRegistry>, cache_root: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            config,
            locks,
            cache_root: cache_root.into(),
        }
    }

    /// Resolves a cache-relative path against the cache root. Every route
    /// adapter's `cache_location` goes through this rather than joining
    /// `cache_root` itself, so the root is never duplicated or hardcoded
    /// in a handler module.
    pub fn cache_path(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.cache_root.join(relative)
    }
}

/// True if `path` is a regular file with nonzero length. Mirrors
/// `mahoraga_stream`'s own cache-hit check so a route adapter's
/// pre-engine-call short circuit agrees with the engine's definition of
/// "already cached".
pub(crate) async fn is_present(path: &Path) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata.is_file() && metadata.len() > 0,
        Err(_) => false,
    }
}
