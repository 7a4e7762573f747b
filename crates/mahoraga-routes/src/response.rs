//! Turns a [`StreamResponse`] or an on-disk path into an axum [`Response`].
//! Every route adapter funnels its success path through one of these two
//! functions so the response-header policy is applied exactly once, in
//! exactly one place.

use std::path::Path;

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use http::{header::CONTENT_TYPE, HeaderValue, StatusCode};

use crate::error::RouteError;

/// Converts a [`StreamResponse`] into the response a route handler returns.
/// `StreamEngine` has already applied the header policy and media-type
/// override; this only picks the right axum body representation per
/// variant.
pub async fn into_response(outcome: mahoraga_stream::StreamResponse) -> Result<Response, RouteError> {
    match outcome {
        mahoraga_stream::StreamResponse::CachedFile(path) => {
            serve_cached_file(&path, Some(mahoraga_core::headers::IMMUTABLE_CACHE_CONTROL)).await
        }
        mahoraga_stream::StreamResponse::NotModified { headers } => {
            let mut response = StatusCode::NOT_MODIFIED.into_response();
            *response.headers_mut() = headers;
            Ok(response)
        }
        mahoraga_stream::StreamResponse::Body { status, headers, body } => {
            let mut response = Response::builder().status(status).body(Body::from_stream(body)).expect("status and headers are well-formed");
            *response.headers_mut() = headers;
            Ok(response)
        }
    }
}

/// Serves a file already known to exist on disk straight from the
/// filesystem, with a caller-supplied `Cache-Control` override, or `None`
/// for callers that set their own header afterward.
pub async fn serve_cached_file(path: &Path, cache_control: Option<&'static str>) -> Result<Response, RouteError> {
    let bytes = tokio::fs::read(path).await.map_err(RouteError::CacheIo)?;
    let mut response = bytes.into_response();
    if let Some(media_type) = mime_guess::from_path(path).first_raw() {
        if let Ok(value) = HeaderValue::from_str(media_type) {
            response.headers_mut().insert(CONTENT_TYPE, value);
        }
    }
    if let Some(cache_control) = cache_control {
        response.headers_mut().insert(http::header::CACHE_CONTROL, HeaderValue::from_static(cache_control));
    }
    Ok(response)
}

/// Serves a sharded-repodata file (the shard index or one shard) with the
/// fixed `Cache-Control` its route family always uses. A missing file is
/// `404`, not `502` — these routes never fall back to an upstream fetch.
pub async fn serve_shard_file(path: &Path, cache_control: &'static str) -> Result<Response, RouteError> {
    if tokio::fs::metadata(path).await.is_err() {
        return Err(RouteError::NotFound);
    }
    serve_cached_file(path, Some(cache_control)).await
}
