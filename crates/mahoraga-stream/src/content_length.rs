//! `Content-Length` reconciliation, per spec.md §4.5.
//!
//! Kept as a pure function over headers so the four-way decision table is
//! unit-testable without any network or filesystem involvement.

use http::{HeaderMap, HeaderValue};
use reqwest::header::{CONTENT_ENCODING, CONTENT_LENGTH};

/// The caller's declared size (`size`) disagreed with a *non-encoded*
/// response's `Content-Length`. A hard failure for this attempt; the
/// engine tries the next mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentLengthMismatch {
    pub header: u64,
    pub caller: u64,
}

/// The outcome of reconciling a response's framing headers against a
/// caller-supplied expected size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciled {
    /// The size the *decoded* body is expected to have, if known.
    pub expected_size: Option<u64>,
    /// Whether the response carries a `Content-Encoding` the engine must
    /// decode before the bytes reach the client or the cache.
    pub is_encoded: bool,
}

/// Reconciles `headers`' `Content-Length`/`Content-Encoding` against
/// `caller_size` (the `size` integrity-tuple field, if the route adapter
/// supplied one).
///
/// - If the response is encoded, its `Content-Length` describes the
///   *encoded* byte count and is useless for decoded-size validation; the
///   caller's `size` (if any) is trusted instead and the header is dropped
///   otherwise.
/// - If the response is not encoded and both a header value and a caller
///   value are present, they must match exactly.
/// - If only one of the two is known, that one becomes the expected size.
pub fn reconcile(headers: &HeaderMap, caller_size: Option<u64>) -> Result<Reconciled, ContentLengthMismatch> {
    let is_encoded = headers.get(CONTENT_ENCODING).is_some();
    let header_len = parse_content_length(headers);

    if is_encoded {
        return Ok(Reconciled {
            expected_size: caller_size,
            is_encoded: true,
        });
    }

    match (header_len, caller_size) {
        (Some(header), Some(caller)) if header != caller => Err(ContentLengthMismatch { header, caller }),
        (Some(header), _) => Ok(Reconciled {
            expected_size: Some(header),
            is_encoded: false,
        }),
        (None, Some(caller)) => Ok(Reconciled {
            expected_size: Some(caller),
            is_encoded: false,
        }),
        (None, None) => Ok(Reconciled {
            expected_size: None,
            is_encoded: false,
        }),
    }
}

fn parse_content_length(headers: &HeaderMap) -> Option<u64> {
    headers.get(CONTENT_LENGTH).and_then(|v: &HeaderValue| v.to_str().ok()).and_then(|s| s.parse().ok())
}
