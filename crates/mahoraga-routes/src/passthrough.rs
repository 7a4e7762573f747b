//! Plain mirror-failover passthrough: no cache location, no integrity
//! tuple, just a request against the next-ranked mirror. Shared by the
//! PyPI index proxy, the jsDelivr pyodide proxy, and the `uv` release
//! proxy (spec.md §6) — the three families the route table never asks for
//! an integrity tuple on.

use axum::response::Response;
use http::HeaderMap;
use mahoraga_core::PathValidationError;
use mahoraga_stream::StreamOptions;
use url::Url;

use crate::error::RouteError;
use crate::paths::reject_traversal;
use crate::response::into_response;
use crate::RouteState;

/// Proxies `rest` against every mirror in `mirror_bases`, in order, with no
/// local caching.
pub async fn proxy(state: &RouteState, mirror_bases: &[String], rest: &str, headers: &HeaderMap) -> Result<Response, RouteError> {
    reject_traversal(rest)?;

    let urls = mirror_bases
        .iter()
        .map(|base| {
            let base = base.trim_end_matches('/');
            Url::parse(&format!("{base}/{rest}")).map_err(|_| RouteError::from(PathValidationError::new(format!("invalid mirror URL for {rest}"))))
        })
        .collect::<Result<Vec<_>, RouteError>>()?;

    let media_type = mime_guess::from_path(rest).first_raw().map(str::to_owned);
    let opts = StreamOptions {
        headers: mahoraga_core::headers::forward_request_headers(headers),
        media_type,
        ..Default::default()
    };
    let outcome = state.engine.stream(urls, opts).await?;
    into_response(outcome).await
}
