//! `uv` release-asset proxy (spec.md §6): another pure passthrough, same
//! shape as [`crate::pypi`]. Must be mounted after the `python`/
//! `python-build-standalone` routes on the server side — both families
//! can plausibly claim a `/uv`-adjacent path once `uv` starts vendoring
//! its own Python builds, and the more specific routes should win ties.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::Response;
use http::HeaderMap;

use crate::error::RouteError;
use crate::passthrough;
use crate::RouteState;

pub async fn proxy(State(state): State<Arc<RouteState>>, Path(rest): Path<String>, headers: HeaderMap) -> Result<Response, RouteError> {
    passthrough::proxy(&state, &state.config.mirrors.uv, &rest, &headers).await
}
