//! Generic conda channel proxy (spec.md §6's `/conda/{channel}/{*rest}`).
//!
//! Unlike every other family, no `original_source/` file covers this route
//! directly — the filtered source tree only carries the sharded-repodata
//! side of the conda integration (`_sharded_repodata.py`, re-expressed in
//! `mahoraga-shards`). The caching strategy below is therefore an original
//! design, not a port: see `DESIGN.md` for the rationale. It reuses a fact
//! `mahoraga-shards` already established — a package's declared `sha256`
//! and `size` live in the shard file for its package name, keyed by its
//! exact filename — to opportunistically verify conda artifacts the shard
//! job has already indexed, while everything else (repodata.json,
//! channeldata.json, packages the shard job hasn't seen) still passes
//! through with a cache location but no integrity tuple, same as the
//! engine's documented degraded mode.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::Response;
use http::HeaderMap;
use mahoraga_core::{mirror, PathValidationError};
use mahoraga_shards::{load_index, load_shard};
use mahoraga_stream::StreamOptions;
use url::Url;

use crate::error::RouteError;
use crate::paths::reject_traversal;
use crate::response::into_response;
use crate::RouteState;

pub async fn proxy_channel(
    State(state): State<Arc<RouteState>>,
    Path((channel, rest)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, RouteError> {
    reject_traversal(&channel)?;
    if channel.contains('/') {
        return Err(PathValidationError::new(format!("invalid channel: {channel}")).into());
    }
    reject_traversal(&rest)?;

    let urls = candidate_urls(&state, &channel, &rest)?;
    let cache_location = state.cache_path(PathBuf::from("conda").join(&channel).join(&rest));
    let media_type = mime_guess::from_path(&rest).first_raw().map(str::to_owned);

    let integrity = shard_integrity(&state, &channel, &rest).await;
    let opts = StreamOptions {
        headers: mahoraga_core::headers::forward_request_headers(&headers),
        media_type,
        cache_location: Some(cache_location),
        sha256: integrity.map(|(sha256, _)| sha256),
        size: integrity.map(|(_, size)| size),
    };
    let outcome = state.engine.stream(urls, opts).await?;
    into_response(outcome).await
}

fn candidate_urls(state: &RouteState, channel: &str, rest: &str) -> Result<Vec<Url>, RouteError> {
    let mut tokens = HashMap::new();
    tokens.insert("channel", channel);
    let bases = mirror::expand_all(state.config.conda_mirrors_for(channel).iter().map(String::as_str), &tokens);
    bases
        .into_iter()
        .map(|base| {
            let base = base.trim_end_matches('/');
            Url::parse(&format!("{base}/{rest}")).map_err(|_| RouteError::from(PathValidationError::new(format!("invalid conda mirror URL for {channel}/{rest}"))))
        })
        .collect()
}

/// Looks up `rest`'s declared `sha256`/`size` in the shard data already
/// built for this channel, if any exists. Returns `None` whenever shard
/// data is unavailable or simply doesn't mention this file — both treated
/// identically, as "proxy it uncached-but-verified" degrading to "proxy it
/// unverified" rather than as an error.
async fn shard_integrity(state: &RouteState, channel: &str, rest: &str) -> Option<([u8; 32], u64)> {
    let segments: Vec<&str> = rest.split('/').collect();
    let filename = *segments.last()?;

    let (label, platform) = if segments.first() == Some(&"label") && segments.len() >= 4 {
        (Some(segments[1]), segments[2])
    } else if segments.len() >= 2 {
        (None, segments[segments.len() - 2])
    } else {
        return None;
    };

    let package_name = package_name_from_filename(filename)?;

    let index_relative = match label {
        Some(label) => format!("channels/{channel}/label/{label}/{platform}/repodata_shards.msgpack.zst"),
        None => format!("channels/{channel}/{platform}/repodata_shards.msgpack.zst"),
    };
    let index = load_index(&state.cache_path(index_relative)).await.ok()?;
    let shard_hash = index.shards.get(package_name)?;

    let shard_relative = match label {
        Some(label) => format!("channels/{channel}/label/{label}/{platform}/shards/{shard_hash}.msgpack.zst"),
        None => format!("channels/{channel}/{platform}/shards/{shard_hash}.msgpack.zst"),
    };
    let shard = load_shard(&state.cache_path(shard_relative)).await.ok()?;
    let record = shard.records.get(filename)?;

    let sha256_hex = record.get("sha256")?.as_str()?;
    let mut sha256 = [0u8; 32];
    hex::decode_to_slice(sha256_hex, &mut sha256).ok()?;
    let size = record.get("size")?.as_u64()?;
    Some((sha256, size))
}

/// Splits a conda artifact filename into its package name, the way every
/// `.tar.bz2`/`.conda` filename is built: `<name>-<version>-<build>.<ext>`,
/// where neither the version nor the build string ever contains a `-`.
fn package_name_from_filename(filename: &str) -> Option<&str> {
    let stem = filename.strip_suffix(".conda").or_else(|| filename.strip_suffix(".tar.bz2"))?;
    let (name, _version_build) = stem.rsplit_once('-')?;
    let (name, _version) = name.rsplit_once('-')?;
    Some(name)
}
