//! Embedded CPython distributions and `python-build-standalone` releases
//! (spec.md §4.6/§6). Grounded on `original_source/src/mahoraga/_python.py`:
//! embedded CPython validates the version floor and exact asset name but
//! never caches ("a system integrator already pins an exact interpreter
//! build into their own image, so there is nothing worth keeping warm");
//! `python-build-standalone` validates only the release tag, then fetches
//! a `.sha256` sidecar from the same mirror before streaming the artifact
//! with a verified integrity tuple.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::Response;
use http::HeaderMap;
use mahoraga_core::{mirror, PathValidationError};
use mahoraga_stream::StreamOptions;
use url::Url;

use crate::error::RouteError;
use crate::response::into_response;
use crate::RouteState;

/// Minimum embedded-CPython version the original ever published a build
/// for. Anything older, or anything carrying a prerelease/build suffix
/// (`3.12.0rc1`, `3.12.0+local`), is rejected before any network access.
fn version_floor() -> semver::Version {
    semver::Version::new(3, 5, 0)
}

pub async fn get_embedded_python(
    State(state): State<Arc<RouteState>>,
    Path((version, name)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, RouteError> {
    let parsed = semver::Version::parse(&version).map_err(|_| PathValidationError::new(format!("invalid Python version: {version}")))?;
    if parsed < version_floor() || !parsed.pre.is_empty() || !parsed.build.is_empty() {
        return Err(PathValidationError::new(format!("Python version rejected: {version}")).into());
    }
    let expected_names = [
        format!("python-{version}-embed-amd64.zip"),
        format!("python-{version}-embed-arm64.zip"),
        format!("python-{version}-embed-win32.zip"),
    ];
    if !expected_names.contains(&name) {
        return Err(PathValidationError::new(format!("unrecognized embedded Python asset: {name}")).into());
    }

    let mut tokens = HashMap::new();
    tokens.insert("version", version.as_str());
    tokens.insert("name", name.as_str());
    let urls = mirror::expand_all(state.config.mirrors.python_embed.iter().map(String::as_str), &tokens)
        .into_iter()
        .map(|url| Url::parse(&url).map_err(|_| RouteError::from(PathValidationError::new(format!("invalid embedded Python mirror URL for {name}")))))
        .collect::<Result<Vec<_>, RouteError>>()?;

    let media_type = mime_guess::from_path(&name).first_raw().map(str::to_owned);
    let opts = StreamOptions {
        headers: mahoraga_core::headers::forward_request_headers(&headers),
        media_type,
        ..Default::default()
    };
    let outcome = state.engine.stream(urls, opts).await?;
    into_response(outcome).await
}

pub async fn get_standalone_python(
    State(state): State<Arc<RouteState>>,
    Path((tag, name)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, RouteError> {
    if tag.len() != 8 || !tag.bytes().all(|b| b.is_ascii_digit()) {
        return Err(PathValidationError::new(format!("invalid python-build-standalone release tag: {tag}")).into());
    }

    let mut tokens = HashMap::new();
    tokens.insert("tag", tag.as_str());
    tokens.insert("name", name.as_str());
    let urls = mirror::expand_all(state.config.mirrors.python_build_standalone.iter().map(String::as_str), &tokens)
        .into_iter()
        .map(|url| Url::parse(&url).map_err(|_| RouteError::from(PathValidationError::new(format!("invalid python-build-standalone mirror URL for {name}")))))
        .collect::<Result<Vec<_>, RouteError>>()?;

    // An unlocked peek, purely to skip the `.sha256` sidecar round trip when
    // the artifact is already cached. Not load-bearing for correctness —
    // `engine.stream` below acquires its own lock on this same path and
    // short-circuits identically if we lose a race here.
    let cache_location = state.cache_path(PathBuf::from("python-build-standalone").join(&tag).join(&name));
    if crate::is_present(&cache_location).await {
        return crate::response::serve_cached_file(&cache_location, Some(mahoraga_core::headers::IMMUTABLE_CACHE_CONTROL)).await;
    }

    let sidecar_urls = urls
        .iter()
        .map(|url| {
            let mut url = url.clone();
            url.set_path(&format!("{}.sha256", url.path()));
            url
        })
        .collect::<Vec<_>>();
    let digest_bytes = state.engine.get(sidecar_urls, HeaderMap::new()).await?;
    let digest_text = std::str::from_utf8(&digest_bytes).map_err(|_| PathValidationError::new("non-UTF8 .sha256 sidecar"))?;
    let mut sha256 = [0u8; 32];
    hex::decode_to_slice(digest_text.trim(), &mut sha256).map_err(|_| PathValidationError::new("malformed .sha256 sidecar"))?;

    let media_type = mime_guess::from_path(&name).first_raw().map(str::to_owned);
    let opts = StreamOptions {
        headers: mahoraga_core::headers::forward_request_headers(&headers),
        media_type,
        cache_location: Some(cache_location),
        sha256: Some(sha256),
        size: None,
    };
    let outcome = state.engine.stream(urls, opts).await?;
    into_response(outcome).await
}
