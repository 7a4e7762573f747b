//! The shape of a successful [`crate::StreamEngine::stream`] outcome.

use std::path::PathBuf;

use http::{HeaderMap, StatusCode};

use crate::body::BodyStream;

/// What [`crate::StreamEngine::stream`] hands back to a route adapter on
/// success. All three variants correspond to named outcomes in spec.md
/// §4.5: a cache hit short-circuit, a body-less `304`, and a streamed body.
pub enum StreamResponse {
    /// The cache path already held a complete file — either before the
    /// call (the adapter's own pre-attempt check) or because a concurrent
    /// writer finished first while this caller waited on the cache-path
    /// lock (`CacheHitRace`, spec.md §7).
    CachedFile(PathBuf),

    /// Upstream reported `304 Not Modified`. Headers have already had the
    /// §6 response-header policy applied.
    NotModified { headers: HeaderMap },

    /// A streamed, already-decoded body. If the request carried a
    /// cache/integrity tuple, the body is concurrently written to a temp
    /// file and promoted on success — see [`crate::body::spawn`].
    Body {
        status: StatusCode,
        headers: HeaderMap,
        body: BodyStream,
    },
}
