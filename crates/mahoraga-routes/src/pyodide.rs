//! jsDelivr pyodide CDN proxy (spec.md §6), distinct from the npm-scoped
//! `pyodide` package the `npm` route opportunistically extracts from a
//! local tarball: this route serves `/pyodide/<version>/full/<asset>`
//! straight from jsDelivr with no local cache.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::Response;
use http::HeaderMap;

use crate::error::RouteError;
use crate::passthrough;
use crate::RouteState;

pub async fn proxy(State(state): State<Arc<RouteState>>, Path(rest): Path<String>, headers: HeaderMap) -> Result<Response, RouteError> {
    passthrough::proxy(&state, &state.config.mirrors.jsdelivr_pyodide, &rest, &headers).await
}
