//! Manual `Content-Encoding` decoding.
//!
//! [`mahoraga_client::UpstreamClient`] deliberately disables `reqwest`'s
//! automatic decompression (no `gzip`/`brotli`/`deflate`/`zstd` cargo
//! features are enabled) so the engine can see the true wire-level
//! `Content-Encoding` and `Content-Length` for the reconciliation in
//! [`crate::content_length`]. That means the engine is responsible for
//! decoding the body itself before it reaches the client or the cache —
//! "the engine always serves decoded bytes" (spec.md §4.5).

use std::pin::Pin;

use async_compression::tokio::bufread::{BzDecoder, GzipDecoder, ZstdDecoder};
use tokio::io::{AsyncRead, BufReader};

/// The content codings the upstream families in spec.md §1 are known to
/// use. Anything else is treated as [`ContentCoding::Identity`] — the
/// engine forwards it undecoded, matching the Content-Length reconciliation
/// rule that only triggers decoding for a *recognized* encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentCoding {
    Identity,
    Gzip,
    Bzip2,
    Zstd,
}

impl ContentCoding {
    /// Parses a `Content-Encoding` header value. Returns `None` for an
    /// absent header (the caller should treat this as non-encoded, not as
    /// [`ContentCoding::Identity`] — the distinction matters for
    /// [`crate::content_length::reconcile`]).
    pub fn from_header_value(value: Option<&str>) -> Option<Self> {
        match value?.trim().to_ascii_lowercase().as_str() {
            "gzip" | "x-gzip" => Some(ContentCoding::Gzip),
            "bzip2" | "x-bzip2" => Some(ContentCoding::Bzip2),
            "zstd" => Some(ContentCoding::Zstd),
            "identity" | "" => Some(ContentCoding::Identity),
            _ => None,
        }
    }
}

/// Wraps a raw byte reader with the decoder matching `coding`. `Identity`
/// (or an unrecognized encoding, treated as identity by the caller) passes
/// bytes through unchanged.
pub fn wrap(coding: ContentCoding, reader: impl AsyncRead + Unpin + Send + 'static) -> Pin<Box<dyn AsyncRead + Send>> {
    match coding {
        ContentCoding::Identity => Box::pin(reader),
        ContentCoding::Gzip => Box::pin(GzipDecoder::new(BufReader::new(reader))),
        ContentCoding::Bzip2 => Box::pin(BzDecoder::new(BufReader::new(reader))),
        ContentCoding::Zstd => Box::pin(ZstdDecoder::new(BufReader::new(reader))),
    }
}
