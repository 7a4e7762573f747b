//! The load-balancing stream-and-cache engine (spec.md §4.5), the ~40%
//! budget core of the system: consumes the [`mahoraga_balancer::LoadBalancer`]
//! sequence, opens a streamed upstream response, validates headers, and
//! either returns bytes to the caller directly or streams to the caller and
//! a temporary on-disk file in parallel, atomically promoting the file to
//! its final cache path only after digest and size both match.

pub mod body;
pub mod content_length;
pub mod decode;
pub mod error;
pub mod response;

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use mahoraga_balancer::LoadBalancer;
use mahoraga_client::{ClientError, RequestScope, UpstreamClient};
use mahoraga_core::headers::{apply_not_modified_policy, strip_always, strip_for_decoded_body};
use mahoraga_ledger::StatisticsLedger;
use mahoraga_lock::LockRegistry;
use reqwest::header::CONTENT_TYPE;
use url::Url;

pub use crate::error::StreamError;
pub use crate::response::StreamResponse;

use crate::body::CacheIntegrity;
use crate::decode::ContentCoding;

/// Parameters for [`StreamEngine::stream`], corresponding to spec.md §4.5's
/// `stream(urls, headers?, media_type?, cache_location?, sha256?, size?)`.
#[derive(Default)]
pub struct StreamOptions {
    pub headers: HeaderMap,
    pub media_type: Option<String>,
    /// Final cache path. When present, a streamed body is concurrently
    /// written to a temp file alongside this path and promoted on success.
    pub cache_location: Option<PathBuf>,
    /// Expected digest of the cache entry. Required for a cache write to
    /// ever be attempted — a `cache_location` without a `sha256` is treated
    /// as "don't cache" (the adapter asked for a path but supplied no
    /// integrity tuple, which spec.md never does, but the engine degrades
    /// rather than panics).
    pub sha256: Option<[u8; 32]>,
    pub size: Option<u64>,
}

/// The central algorithm described in spec.md §4.5/§2(5): a thin façade
/// over [`UpstreamClient`], [`StatisticsLedger`], and [`LockRegistry`] that
/// route adapters call once they've derived a candidate URL list and
/// (optionally) an integrity tuple.
pub struct StreamEngine {
    client: Arc<UpstreamClient>,
    ledger: Arc<StatisticsLedger>,
    locks: Arc<LockRegistry>,
}

/// The last non-2xx/non-304 response observed across an attempt loop, kept
/// around so that total exhaustion can propagate it instead of a bare
/// `GatewayTimeout` (spec.md §4.5 step 6 / §7).
struct LastStatus {
    status: StatusCode,
    headers: HeaderMap,
}

impl StreamEngine {
    pub fn new(client: Arc<UpstreamClient>, ledger: Arc<StatisticsLedger>, locks: Arc<LockRegistry>) -> Self {
        Self { client, ledger, locks }
    }

    /// `StreamEngine.get(urls)`: fully buffers the first successful
    /// response's body and returns it. Used for small metadata calls
    /// (jsDelivr resolved-version JSON, `.sha256` sidecars).
    pub async fn get(&self, urls: impl IntoIterator<Item = Url>, headers: HeaderMap) -> Result<Bytes, StreamError> {
        let mut balancer = LoadBalancer::new(urls);
        let mut last_status: Option<LastStatus> = None;
        let mut ever_responded = false;

        while let Some(url) = balancer.next(|host| self.ledger.key(host)) {
            let Some(host) = url.host_str().map(str::to_owned) else {
                continue;
            };
            let scope = RequestScope::open(self.ledger.clone(), host);

            let response = match self.client.stream(&url, headers.clone()).await {
                Ok(response) => response,
                Err(ClientError::Request { .. }) | Err(ClientError::CacheMissRequired { .. }) => {
                    // Transport error: `scope` drops un-closed here, which
                    // schedules its ledger report on a detached task rather
                    // than blocking this attempt loop on it.
                    continue;
                }
            };

            ever_responded = true;
            let status = response.status();
            if !status.is_success() {
                last_status = Some(LastStatus {
                    status,
                    headers: response.headers().clone(),
                });
                continue;
            }

            match response.bytes().await {
                Ok(body) => {
                    scope.close().await;
                    return Ok(body);
                }
                Err(_) => continue,
            }
        }

        match last_status {
            Some(last) if ever_responded => {
                let mut headers = last.headers;
                strip_always(&mut headers);
                Err(StreamError::UpstreamStatus {
                    status: last.status,
                    headers,
                })
            }
            _ => Err(StreamError::GatewayTimeout),
        }
    }

    /// `StreamEngine.stream(urls, ...)`: the central passthrough-and-cache
    /// algorithm. See the module docs and spec.md §4.5 for the full
    /// decision table.
    pub async fn stream(&self, urls: impl IntoIterator<Item = Url>, opts: StreamOptions) -> Result<StreamResponse, StreamError> {
        // Pre-attempt rule: acquire the cache-path lock up front so the
        // engine is idempotent even if a route adapter didn't already do
        // its own check-then-call. If the file now exists — because we won
        // the race, or another writer promoted it while we waited on the
        // lock — short-circuit immediately.
        let mut cache_lock = None;
        if let Some(cache_location) = &opts.cache_location {
            let key = cache_location.to_string_lossy().into_owned();
            let guard = self.locks.lock(&key).await;
            if is_present(cache_location).await {
                return Ok(StreamResponse::CachedFile(cache_location.clone()));
            }
            cache_lock = Some(guard);
        }

        let mut balancer = LoadBalancer::new(urls);
        let mut last_status: Option<LastStatus> = None;
        let mut ever_responded = false;

        while let Some(url) = balancer.next(|host| self.ledger.key(host)) {
            let Some(host) = url.host_str().map(str::to_owned) else {
                continue;
            };
            let scope = RequestScope::open(self.ledger.clone(), host);

            let response = match self.client.stream(&url, opts.headers.clone()).await {
                Ok(response) => response,
                Err(_) => continue,
            };

            ever_responded = true;
            let status = response.status();

            if status == StatusCode::NOT_MODIFIED {
                let mut headers = response.headers().clone();
                apply_not_modified_policy(&mut headers, opts.media_type.as_deref());
                scope.close().await;
                return Ok(StreamResponse::NotModified { headers });
            }

            if !status.is_success() {
                last_status = Some(LastStatus {
                    status,
                    headers: response.headers().clone(),
                });
                continue;
            }

            let reconciled = match content_length::reconcile(response.headers(), opts.size) {
                Ok(reconciled) => reconciled,
                Err(mismatch) => {
                    tracing::warn!(
                        url = %url,
                        header = mismatch.header,
                        caller = mismatch.caller,
                        "Content-Length disagreed with expected size, trying next mirror"
                    );
                    continue;
                }
            };

            // Commit: from here on the client gets whatever bytes arrive,
            // success or failure — only the cache's fate is still pending.
            let coding = ContentCoding::from_header_value(
                response.headers().get(reqwest::header::CONTENT_ENCODING).and_then(|v| v.to_str().ok()),
            )
            .unwrap_or(ContentCoding::Identity);

            let mut headers = response.headers().clone();
            if reconciled.is_encoded {
                strip_for_decoded_body(&mut headers);
            } else {
                strip_always(&mut headers);
            }
            if let Some(media_type) = &opts.media_type {
                if let Ok(value) = http::HeaderValue::from_str(media_type) {
                    headers.insert(CONTENT_TYPE, value);
                }
            }
            if reconciled.is_encoded {
                match reconciled.expected_size {
                    Some(size) => {
                        headers.insert(reqwest::header::CONTENT_LENGTH, http::HeaderValue::from(size));
                    }
                    None => {
                        headers.remove(reqwest::header::CONTENT_LENGTH);
                    }
                }
            }

            let cache = match (&opts.cache_location, opts.sha256) {
                (Some(cache_location), Some(sha256)) => Some(CacheIntegrity {
                    cache_location: cache_location.clone(),
                    sha256,
                }),
                _ => None,
            };

            let body = body::spawn(
                response,
                body::BodyOptions {
                    coding,
                    expected_size: reconciled.expected_size,
                    cache,
                },
                scope,
                cache_lock.take(),
            );

            return Ok(StreamResponse::Body {
                status: StatusCode::OK,
                headers,
                body,
            });
        }

        match last_status {
            Some(last) if ever_responded => {
                let mut headers = last.headers;
                strip_always(&mut headers);
                Err(StreamError::UpstreamStatus {
                    status: last.status,
                    headers,
                })
            }
            _ => Err(StreamError::GatewayTimeout),
        }
    }
}

async fn is_present(path: &std::path::Path) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata.is_file() && metadata.len() > 0,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::extract::State;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use futures::StreamExt;

    async fn engine() -> StreamEngine {
        let locks = Arc::new(LockRegistry::new());
        let ledger = Arc::new(StatisticsLedger::load("/nonexistent/statistics.json", HashSet::new(), locks.clone()).await);
        let client = Arc::new(UpstreamClient::new().unwrap());
        StreamEngine::new(client, ledger, locks)
    }

    async fn spawn_server(app: axum::Router) -> Url {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Url::parse(&format!("http://{addr}")).unwrap()
    }

    #[tokio::test]
    async fn get_returns_body_on_first_success() {
        let app = axum::Router::new().route("/x", get(|| async { "hello" }));
        let base = spawn_server(app).await;
        let url = base.join("/x").unwrap();

        let engine = engine().await;
        let body = engine.get([url], HeaderMap::new()).await.unwrap();
        assert_eq!(body, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn get_falls_through_failing_mirror_to_succeeding_one() {
        let failing = axum::Router::new().route("/x", get(|| async { StatusCode::BAD_GATEWAY }));
        let succeeding = axum::Router::new().route("/x", get(|| async { "ok" }));
        let failing_base = spawn_server(failing).await;
        let succeeding_base = spawn_server(succeeding).await;

        let engine = engine().await;
        let body = engine
            .get([failing_base.join("/x").unwrap(), succeeding_base.join("/x").unwrap()], HeaderMap::new())
            .await
            .unwrap();
        assert_eq!(body, Bytes::from_static(b"ok"));
    }

    #[tokio::test]
    async fn get_exhausted_with_no_response_is_gateway_timeout() {
        // Port 1 on loopback is reserved and nothing listens there, so the
        // connection attempt fails at the transport layer every time.
        let url = Url::parse("http://127.0.0.1:1/x").unwrap();
        let engine = engine().await;
        let error = engine.get([url], HeaderMap::new()).await.unwrap_err();
        assert_eq!(error.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn get_exhausted_with_responses_propagates_last_status() {
        let app = axum::Router::new().route("/x", get(|| async { StatusCode::BAD_GATEWAY }));
        let base = spawn_server(app).await;
        let engine = engine().await;
        let error = engine.get([base.join("/x").unwrap()], HeaderMap::new()).await.unwrap_err();
        match error {
            StreamError::UpstreamStatus { status, .. } => assert_eq!(status, StatusCode::BAD_GATEWAY),
            other => panic!("expected UpstreamStatus, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_promotes_valid_body_and_sets_headers() {
        let body = b"a streamed body";
        let app = axum::Router::new().route("/x", get(move || async move { body.into_response() }));
        let base = spawn_server(app).await;

        let dir = tempfile::tempdir().unwrap();
        let cache_location = dir.path().join("pkg").join("artifact.bin");
        let sha256 = {
            use sha2::{Digest, Sha256};
            let mut hasher = Sha256::new();
            hasher.update(body);
            hasher.finalize().into()
        };

        let engine = engine().await;
        let response = engine
            .stream(
                [base.join("/x").unwrap()],
                StreamOptions {
                    cache_location: Some(cache_location.clone()),
                    sha256: Some(sha256),
                    size: Some(body.len() as u64),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let StreamResponse::Body { status, body: mut stream, .. } = response else {
            panic!("expected a streamed body");
        };
        assert_eq!(status, StatusCode::OK);
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, body);

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(tokio::fs::read(&cache_location).await.unwrap(), body);
    }

    #[tokio::test]
    async fn stream_short_circuits_when_cache_already_present() {
        let dir = tempfile::tempdir().unwrap();
        let cache_location = dir.path().join("artifact.bin");
        tokio::fs::write(&cache_location, b"already cached").await.unwrap();

        // No mirror is ever reachable; if the engine tried the network it
        // would hang or fail instead of returning the cached file.
        let engine = engine().await;
        let response = engine
            .stream(
                [Url::parse("http://127.0.0.1:1/x").unwrap()],
                StreamOptions {
                    cache_location: Some(cache_location.clone()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        match response {
            StreamResponse::CachedFile(path) => assert_eq!(path, cache_location),
            _ => panic!("expected a cached file short-circuit"),
        }
    }

    #[tokio::test]
    async fn stream_exhausted_all_bad_gateway_propagates_502() {
        let app = axum::Router::new().route("/x", get(|| async { StatusCode::BAD_GATEWAY }));
        let base = spawn_server(app).await;
        let engine = engine().await;
        let error = engine.stream([base.join("/x").unwrap()], StreamOptions::default()).await.unwrap_err();
        assert_eq!(error.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn stream_invalid_digest_still_responds_200_but_no_cache_file() {
        let body = b"wrong digest body";
        let app = axum::Router::new().route("/x", get(move || async move { body.into_response() }));
        let base = spawn_server(app).await;

        let dir = tempfile::tempdir().unwrap();
        let cache_location = dir.path().join("artifact.bin");

        let engine = engine().await;
        let response = engine
            .stream(
                [base.join("/x").unwrap()],
                StreamOptions {
                    cache_location: Some(cache_location.clone()),
                    sha256: Some([0u8; 32]),
                    size: Some(body.len() as u64),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let StreamResponse::Body { body: mut stream, .. } = response else {
            panic!("expected a streamed body");
        };
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, body);

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!cache_location.exists());
    }

    #[tokio::test]
    async fn concurrent_requests_for_same_path_promote_exactly_once() {
        // A counting middle layer makes sure only one request ever reaches
        // the upstream handler for the racing requests sharing a cache path
        // — the rest should observe the file once the writer finishes.
        let calls = Arc::new(AtomicUsize::new(0));
        let body = b"race body";
        let app = axum::Router::new().route(
            "/x",
            get({
                let calls = calls.clone();
                move |State(_): State<()>| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        body.into_response()
                    }
                }
            }),
        );
        let base = spawn_server(app.with_state(())).await;

        let dir = tempfile::tempdir().unwrap();
        let cache_location = dir.path().join("artifact.bin");
        let sha256 = {
            use sha2::{Digest, Sha256};
            let mut hasher = Sha256::new();
            hasher.update(body);
            hasher.finalize().into()
        };

        let engine = Arc::new(engine().await);
        let mut handles = Vec::new();
        for _ in 0..5 {
            let engine = engine.clone();
            let url = base.join("/x").unwrap();
            let cache_location = cache_location.clone();
            handles.push(tokio::spawn(async move {
                let response = engine
                    .stream(
                        [url],
                        StreamOptions {
                            cache_location: Some(cache_location),
                            sha256: Some(sha256),
                            size: Some(body.len() as u64),
                            ..Default::default()
                        },
                    )
                    .await
                    .unwrap();
                match response {
                    StreamResponse::Body { mut body, .. } => {
                        let mut collected = Vec::new();
                        while let Some(chunk) = body.next().await {
                            collected.extend_from_slice(&chunk.unwrap());
                        }
                        collected
                    }
                    StreamResponse::CachedFile(path) => tokio::fs::read(path).await.unwrap(),
                    StreamResponse::NotModified { .. } => Vec::new(),
                }
            }));
        }

        for handle in handles {
            let collected = handle.await.unwrap();
            assert_eq!(collected, body);
        }

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert_eq!(tokio::fs::read(&cache_location).await.unwrap(), body);
    }
}
