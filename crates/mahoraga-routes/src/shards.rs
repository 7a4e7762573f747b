//! Direct file responses for the sharded conda repodata `mahoraga-shards`
//! writes (spec.md §4.6/§4.7). These four routes never touch
//! `StreamEngine` or any upstream: the file is either already on disk
//! under the cache root or it isn't, full stop — there is no "fetch it
//! now" fallback for a shard that hasn't been built yet.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::Response;

use mahoraga_core::headers::{IMMUTABLE_CACHE_CONTROL, SHARD_INDEX_CACHE_CONTROL};

use crate::error::RouteError;
use crate::response::serve_shard_file;
use crate::RouteState;

pub async fn index(State(state): State<Arc<RouteState>>, Path((channel, platform)): Path<(String, String)>) -> Result<Response, RouteError> {
    let path = state.cache_path(format!("channels/{channel}/{platform}/repodata_shards.msgpack.zst"));
    serve_shard_file(&path, SHARD_INDEX_CACHE_CONTROL).await
}

pub async fn index_with_label(
    State(state): State<Arc<RouteState>>,
    Path((channel, label, platform)): Path<(String, String, String)>,
) -> Result<Response, RouteError> {
    let path = state.cache_path(format!("channels/{channel}/label/{label}/{platform}/repodata_shards.msgpack.zst"));
    serve_shard_file(&path, SHARD_INDEX_CACHE_CONTROL).await
}

pub async fn shard(State(state): State<Arc<RouteState>>, Path((channel, platform, name)): Path<(String, String, String)>) -> Result<Response, RouteError> {
    if !is_shard_name(&name) {
        return Err(RouteError::NotFound);
    }
    let path = state.cache_path(format!("channels/{channel}/{platform}/shards/{name}"));
    serve_shard_file(&path, IMMUTABLE_CACHE_CONTROL).await
}

pub async fn shard_with_label(
    State(state): State<Arc<RouteState>>,
    Path((channel, label, platform, name)): Path<(String, String, String, String)>,
) -> Result<Response, RouteError> {
    if !is_shard_name(&name) {
        return Err(RouteError::NotFound);
    }
    let path = state.cache_path(format!("channels/{channel}/label/{label}/{platform}/shards/{name}"));
    serve_shard_file(&path, IMMUTABLE_CACHE_CONTROL).await
}

/// A shard filename is `<sha256hex>.msgpack.zst` — 64 lowercase hex
/// characters plus the fixed suffix. Axum's single-segment `{name}` can't
/// contain a `/`, so this is the only validation the name needs.
fn is_shard_name(name: &str) -> bool {
    name.strip_suffix(".msgpack.zst")
        .is_some_and(|hex| hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_hexdigit()))
}
