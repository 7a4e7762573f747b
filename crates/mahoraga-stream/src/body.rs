//! Streams an already-committed upstream response to the client while
//! concurrently validating and (optionally) promoting it into the on-disk
//! cache.
//!
//! This is the part of spec.md §4.5 that runs *after* the engine has
//! decided to commit to a mirror: headers have validated, so whatever
//! happens to the body from here on, the client already gets the bytes.
//! Integrity protects the cache, never the in-flight response.

use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use mahoraga_client::RequestScope;
use mahoraga_lock::LockGuard;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_stream::wrappers::ReceiverStream;

use crate::decode::{self, ContentCoding};

/// The client-facing body: a stream of already-decoded chunks. Forwarded to
/// whatever HTTP body type the server crate uses (`axum::body::Body`
/// accepts any `Stream<Item = Result<Bytes, E>>`).
pub type BodyStream = std::pin::Pin<Box<dyn Stream<Item = Result<Bytes, io::Error>> + Send>>;

/// The integrity tuple a streamed body must satisfy to be promoted into the
/// cache. Absent entirely when the adapter didn't ask for caching (e.g. the
/// embedded-CPython route, which has no local cache per spec.md §4.6).
#[derive(Debug, Clone)]
pub struct CacheIntegrity {
    pub cache_location: PathBuf,
    pub sha256: [u8; 32],
}

/// Parameters for [`spawn`].
pub struct BodyOptions {
    pub coding: ContentCoding,
    /// The decoded byte count the body is expected to have, if known (see
    /// [`crate::content_length::reconcile`]).
    pub expected_size: Option<u64>,
    pub cache: Option<CacheIntegrity>,
}

/// Channel depth for the client-forwarding stream. Small: this is purely a
/// handoff between the background task and whatever is draining the HTTP
/// response, not a general-purpose buffer.
const CHANNEL_DEPTH: usize = 4;

/// Drives `response`'s body to completion on a detached background task:
/// decodes it, hashes it, optionally writes it to a temp file alongside
/// forwarding each chunk to the caller, and on completion either promotes
/// the temp file or discards it. Returns the forwarding half as a boxed
/// stream.
///
/// `scope` is closed (reporting elapsed time into the ledger) once the body
/// finishes, whether that's success, a read error, or early client
/// disconnect — this is the `schedule_exit` detachment from spec.md §5: the
/// caller that invoked [`crate::StreamEngine::stream`] gets its `Response`
/// back immediately and never awaits this task.
///
/// `cache_lock`, when present, is the cache-path lock acquired by the
/// engine before the attempt loop started. It is held for the lifetime of
/// this task and only released once the temp file has been promoted or
/// discarded, so a concurrent requester for the same path always either
/// sees no file (and becomes the writer itself) or a fully-promoted one —
/// never a partial write.
pub fn spawn(response: reqwest::Response, opts: BodyOptions, scope: RequestScope, cache_lock: Option<LockGuard>) -> BodyStream {
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, io::Error>>(CHANNEL_DEPTH);

    tokio::spawn(async move {
        let _cache_lock = cache_lock;
        // Force headers to flush before any byte-range loss risk (step 3).
        if tx.send(Ok(Bytes::new())).await.is_err() {
            scope.close().await;
            return;
        }

        let byte_stream = response
            .bytes_stream()
            .map(|result| result.map_err(|error| io::Error::new(io::ErrorKind::Other, error)));
        let reader = tokio_util::io::StreamReader::new(byte_stream);
        let mut decoded = decode::wrap(opts.coding, reader);

        let mut hasher = Sha256::new();
        let mut downloaded: u64 = 0;
        let mut temp = match &opts.cache {
            Some(cache) => open_temp_file(&cache.cache_location, opts.expected_size).await,
            None => None,
        };

        let mut buffer = vec![0u8; 64 * 1024];
        let mut read_failed = false;
        let mut client_gone = false;

        loop {
            let read = decoded.read(&mut buffer).await;
            let n = match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(error) => {
                    tracing::debug!(%error, "upstream body read failed mid-stream");
                    read_failed = true;
                    break;
                }
            };
            let chunk = Bytes::copy_from_slice(&buffer[..n]);
            hasher.update(&chunk);
            downloaded += chunk.len() as u64;

            // Write to the temp file and forward to the client concurrently;
            // both complete before the next chunk is read.
            let write_fut = async {
                match temp.as_mut() {
                    Some((file, _)) => file.write_all(&chunk).await,
                    None => Ok(()),
                }
            };
            let send_fut = async {
                if client_gone {
                    return true;
                }
                tx.send(Ok(chunk.clone())).await.is_err()
            };
            let (write_result, send_failed) = tokio::join!(write_fut, send_fut);
            if let Err(error) = write_result {
                tracing::warn!(%error, "cache write failed, discarding cache entry for this attempt");
                temp = None;
            }
            if send_failed {
                client_gone = true;
            }
        }

        scope.close().await;

        if read_failed || client_gone {
            // Body never completed: cache write (if any) is abandoned and
            // the dropped `TempPath` removes the partial file.
            return;
        }

        let (Some(cache), Some((file, temp_path))) = (opts.cache, temp) else {
            return;
        };

        let digest: [u8; 32] = hasher.finalize().into();
        let size_matches = opts.expected_size.is_none_or(|expected| downloaded == expected);
        if digest != cache.sha256 || !size_matches {
            // IntegrityFailure: the client already has its bytes; the cache
            // just never gets this entry. `temp_path`'s drop removes the file.
            return;
        }

        let named = tempfile::NamedTempFile::from_parts(file.into_std().await, temp_path);
        if let Err(error) = named.persist(&cache.cache_location) {
            tracing::warn!(path = %cache.cache_location.display(), %error, "failed to promote cache file");
        }
    });

    Box::pin(ReceiverStream::new(rx))
}

/// Creates a uniquely named temporary file in the same directory as
/// `cache_location` (so the final rename is atomic) and, if `expected_size`
/// is known, pre-truncates it to that exact length so a short read leaves a
/// visibly wrong-sized file rather than a silently truncated one.
async fn open_temp_file(cache_location: &Path, expected_size: Option<u64>) -> Option<(tokio::fs::File, tempfile::TempPath)> {
    let dir = cache_location.parent()?;
    if let Err(error) = tokio::fs::create_dir_all(dir).await {
        tracing::warn!(path = %dir.display(), %error, "failed to create cache directory");
        return None;
    }
    let named = match tempfile::Builder::new().prefix(".mahoraga-").tempfile_in(dir) {
        Ok(named) => named,
        Err(error) => {
            tracing::warn!(path = %dir.display(), %error, "failed to create temp cache file");
            return None;
        }
    };
    let (std_file, temp_path) = named.into_parts();
    let file = tokio::fs::File::from_std(std_file);
    if let Some(size) = expected_size {
        if let Err(error) = file.set_len(size).await {
            tracing::warn!(%error, "failed to pre-truncate temp cache file");
        }
    }
    Some((file, temp_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mahoraga_ledger::StatisticsLedger;
    use mahoraga_lock::LockRegistry;
    use std::collections::HashSet;
    use std::sync::Arc;

    async fn ledger() -> Arc<StatisticsLedger> {
        Arc::new(StatisticsLedger::load("/nonexistent/statistics.json", HashSet::new(), Arc::new(LockRegistry::new())).await)
    }

    async fn mock_response(body: &'static [u8]) -> reqwest::Response {
        use axum::response::IntoResponse;
        use axum::routing::get;
        let app = axum::Router::new().route("/body", get(move || async move { body.into_response() }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        reqwest::get(format!("http://{addr}/body")).await.unwrap()
    }

    #[tokio::test]
    async fn valid_digest_promotes_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache_location = dir.path().join("pkg").join("artifact.bin");
        let body = b"hello, cache!";
        let sha256 = {
            let mut hasher = Sha256::new();
            hasher.update(body);
            hasher.finalize().into()
        };

        let response = mock_response(body).await;
        let scope = RequestScope::open(ledger().await, "example.org");
        let mut stream = spawn(
            response,
            BodyOptions {
                coding: ContentCoding::Identity,
                expected_size: Some(body.len() as u64),
                cache: Some(CacheIntegrity {
                    cache_location: cache_location.clone(),
                    sha256,
                }),
            },
            scope,
            None,
        );

        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, body);

        // give the background promotion a moment to land.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(tokio::fs::read(&cache_location).await.unwrap(), body);
    }

    #[tokio::test]
    async fn digest_mismatch_leaves_cache_absent() {
        let dir = tempfile::tempdir().unwrap();
        let cache_location = dir.path().join("pkg").join("artifact.bin");
        let body = b"hello, cache!";
        let wrong_digest = [0u8; 32];

        let response = mock_response(body).await;
        let scope = RequestScope::open(ledger().await, "example.org");
        let mut stream = spawn(
            response,
            BodyOptions {
                coding: ContentCoding::Identity,
                expected_size: Some(body.len() as u64),
                cache: Some(CacheIntegrity {
                    cache_location: cache_location.clone(),
                    sha256: wrong_digest,
                }),
            },
            scope,
            None,
        );

        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        // the client still gets every byte even though the cache write is rejected.
        assert_eq!(collected, body);

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!cache_location.exists());
    }

    #[tokio::test]
    async fn size_mismatch_leaves_cache_absent() {
        let dir = tempfile::tempdir().unwrap();
        let cache_location = dir.path().join("pkg").join("artifact.bin");
        let body = b"hello, cache!";
        let sha256 = {
            let mut hasher = Sha256::new();
            hasher.update(body);
            hasher.finalize().into()
        };

        let response = mock_response(body).await;
        let scope = RequestScope::open(ledger().await, "example.org");
        let mut stream = spawn(
            response,
            BodyOptions {
                coding: ContentCoding::Identity,
                expected_size: Some(body.len() as u64 + 1),
                cache: Some(CacheIntegrity {
                    cache_location: cache_location.clone(),
                    sha256,
                }),
            },
            scope,
            None,
        );
        while stream.next().await.is_some() {}

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!cache_location.exists());
    }

    #[tokio::test]
    async fn no_cache_integrity_just_forwards() {
        let body = b"no caching here";
        let response = mock_response(body).await;
        let scope = RequestScope::open(ledger().await, "example.org");
        let mut stream = spawn(
            response,
            BodyOptions {
                coding: ContentCoding::Identity,
                expected_size: None,
                cache: None,
            },
            scope,
            None,
        );
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, body);
    }
}
