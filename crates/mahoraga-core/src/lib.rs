//! Shared types used by every layer of the mahoraga caching reverse proxy.
//!
//! This crate sits at the bottom of the dependency graph (mirroring the role
//! `rattler_redaction`/`rattler_digest` play in the teacher workspace): it
//! has no dependency on any other `mahoraga-*` crate, only on `http`,
//! `reqwest`, `url`, and `thiserror`.

pub mod cache_action;
pub mod headers;
pub mod mirror;
pub mod redact;

pub use cache_action::CacheAction;

/// A path parameter failed a route adapter's syntactic validation before
/// any filesystem or network access was attempted. Always surfaced to the
/// client as `404 Not Found`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid request path: {0}")]
pub struct PathValidationError(pub String);

impl PathValidationError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}
