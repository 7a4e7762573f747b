//! PyPI simple-index and package-file proxy (spec.md §6): a pure
//! passthrough, since pip/uv already validate package hashes themselves
//! against the simple-index metadata they just fetched through us.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::Response;
use http::HeaderMap;

use crate::error::RouteError;
use crate::passthrough;
use crate::RouteState;

pub async fn proxy(State(state): State<Arc<RouteState>>, Path(rest): Path<String>, headers: HeaderMap) -> Result<Response, RouteError> {
    passthrough::proxy(&state, &state.config.mirrors.pypi, &rest, &headers).await
}
