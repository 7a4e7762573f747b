//! Errors the engine can return once every candidate mirror has been tried.
//!
//! Per-attempt failures (a transport error, a 4xx/5xx status, a
//! `Content-Length` mismatch) never surface directly: they advance the
//! [`mahoraga_balancer::LoadBalancer`] to the next candidate. Only total
//! exhaustion produces a [`StreamError`], matching spec.md §7's rule that
//! "nothing is retried silently by the client's single attempt; only
//! upstream fallback is retried."

use http::{HeaderMap, StatusCode};

/// Returned by [`crate::StreamEngine::get`] and [`crate::StreamEngine::stream`]
/// once the candidate list is exhausted without a usable response.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// No candidate ever produced a response at all (every attempt failed
    /// at the transport layer). Surfaced to the client as `504 Gateway
    /// Timeout`.
    #[error("no upstream mirror responded")]
    GatewayTimeout,

    /// At least one candidate was reached but returned a non-2xx status
    /// (other than `304`, which is handled separately). The *last* such
    /// response's status and headers are propagated verbatim, minus `Date`
    /// and `Server`.
    #[error("upstream returned {status}")]
    UpstreamStatus { status: StatusCode, headers: HeaderMap },
}

impl StreamError {
    /// The status this error should be reported to the client as.
    pub fn status(&self) -> StatusCode {
        match self {
            StreamError::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
            StreamError::UpstreamStatus { status, .. } => *status,
        }
    }
}
