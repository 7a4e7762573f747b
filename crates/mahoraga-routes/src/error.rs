//! Maps every failure a route adapter can produce onto an HTTP response,
//! per spec.md §7's error table.

use axum::response::{IntoResponse, Response};
use http::StatusCode;
use mahoraga_core::PathValidationError;
use mahoraga_stream::StreamError;

/// The union of everything a route handler can fail with. Each variant
/// already knows its own status code, so `IntoResponse` never needs route
/// context.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    /// A path parameter failed syntactic validation (bad version string,
    /// traversal attempt, disallowed scope). Always `404`, never `400`:
    /// from the client's perspective an invalid path and a nonexistent one
    /// are indistinguishable.
    #[error(transparent)]
    InvalidPath(#[from] PathValidationError),

    /// Nothing upstream or in the cache matched a fully-valid path.
    #[error("not found")]
    NotFound,

    /// The `StreamEngine` exhausted every candidate mirror.
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// A cached file on disk vanished or became unreadable between the
    /// existence check and the serve attempt (a concurrent eviction or a
    /// filesystem error) — reported to the client as an upstream failure
    /// rather than our own configuration being wrong.
    #[error("failed to read cached file: {0}")]
    CacheIo(#[source] std::io::Error),
}

impl IntoResponse for RouteError {
    fn into_response(self) -> Response {
        match &self {
            RouteError::InvalidPath(_) | RouteError::NotFound => StatusCode::NOT_FOUND.into_response(),
            RouteError::Stream(error) => error.status().into_response(),
            RouteError::CacheIo(error) => {
                tracing::warn!(%error, "cached file became unreadable after its existence check");
                StatusCode::BAD_GATEWAY.into_response()
            }
        }
    }
}
