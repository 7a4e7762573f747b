//! Response-header policy enforced on every proxied response: upstream
//! framing headers are stripped unconditionally, and `Content-Type` is
//! replaced or dropped when a route adapter declares its own media type.

use http::HeaderMap;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE, DATE, IF_MODIFIED_SINCE, IF_NONE_MATCH, SERVER};

/// Strips `Date` and `Server` from an upstream response's headers before
/// they are forwarded to the client. Applied to every response path:
/// successful bodies, `304 Not Modified`, and propagated error statuses.
pub fn strip_always(headers: &mut HeaderMap) {
    headers.remove(DATE);
    headers.remove(SERVER);
}

/// Strips `Content-Encoding` in addition to the always-stripped headers.
/// The engine decodes the upstream body itself (see
/// `mahoraga_stream::decode`), so a client-facing `Content-Encoding` would
/// be a lie about the bytes actually being served.
pub fn strip_for_decoded_body(headers: &mut HeaderMap) {
    strip_always(headers);
    headers.remove(CONTENT_ENCODING);
}

/// Applies the full header policy for a body-less `304 Not Modified`
/// response: strips `Date`, `Server`, `Content-Encoding`, and replaces
/// `Content-Type` with the adapter-supplied `media_type`, dropping the
/// header entirely when the adapter declares none.
pub fn apply_not_modified_policy(headers: &mut HeaderMap, media_type: Option<&str>) {
    strip_for_decoded_body(headers);
    match media_type {
        Some(media_type) => {
            if let Ok(value) = http::HeaderValue::from_str(media_type) {
                headers.insert(CONTENT_TYPE, value);
            } else {
                headers.remove(CONTENT_TYPE);
            }
        }
        None => {
            headers.remove(CONTENT_TYPE);
        }
    }
}

/// `Cache-Control` value applied to every file served straight from the
/// on-disk cache: the content is addressed by a verified digest, so it
/// never needs revalidation.
pub const IMMUTABLE_CACHE_CONTROL: &str = "public, max-age=31536000, immutable";

/// `Cache-Control` value applied to the shard index, which is rebuilt
/// periodically and therefore only safe to cache briefly.
pub const SHARD_INDEX_CACHE_CONTROL: &str = "public, max-age=3600";

/// Extracts the conditional-request validators worth forwarding upstream
/// from an inbound client request. Nothing else from the client's request
/// headers is trusted verbatim: no `Host`, no `Authorization`, no
/// hop-by-hop header.
pub fn forward_request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = HeaderMap::new();
    for name in [IF_NONE_MATCH, IF_MODIFIED_SINCE] {
        if let Some(value) = headers.get(&name) {
            forwarded.insert(name, value.clone());
        }
    }
    forwarded
}
