//! The single outbound HTTP client shared by every route adapter.
//!
//! Built the way `rattler-bin` assembles its download client: a plain
//! [`reqwest::Client`] with automatic response decompression disabled (the
//! engine decodes bodies itself so it can see the true `Content-Encoding`
//! and `Content-Length`), wrapped in [`reqwest_middleware::ClientWithMiddleware`]
//! for redaction-aware logging. On top of that sits a small heuristic
//! in-memory cache for plain `get` calls, and a [`RequestScope`] guard that
//! reports per-mirror timing into a [`mahoraga_ledger::StatisticsLedger`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use http::{HeaderMap, StatusCode};
use mahoraga_core::redact::Redact;
use mahoraga_core::CacheAction;
use mahoraga_ledger::StatisticsLedger;
use reqwest_middleware::ClientWithMiddleware;
use url::Url;

/// Hosts the client follows redirects for. Every other host's redirects are
/// treated as a failed request, since an unexpected redirect chain to a
/// mirror we don't recognize is far more likely to be a misconfiguration or
/// a captive portal than a legitimate response.
const REDIRECT_ALLOW_LIST: &[&str] = &["anaconda.org", "github.com", "prefix.dev", "pypi.org"];

/// How long a cached `get` response is considered fresh. Conservative: this
/// cache exists to absorb bursts of identical metadata lookups within a
/// single request wave, not to replace conditional revalidation.
const HEURISTIC_CACHE_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest_middleware::Error,
    },

    #[error("{url} returned a cache miss but the request requires a cached entry")]
    CacheMissRequired { url: String },
}

/// A response captured for the in-memory `get` cache.
#[derive(Clone)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

struct CacheEntry {
    fetched_at: Instant,
    response: CachedResponse,
}

/// The shared outbound client: connection pooling, redirect policy, and a
/// heuristic response cache for non-streaming requests.
pub struct UpstreamClient {
    inner: ClientWithMiddleware,
    cache: DashMap<Url, CacheEntry>,
}

impl UpstreamClient {
    /// Builds the client with automatic decompression disabled and a
    /// redirect policy restricted to [`REDIRECT_ALLOW_LIST`].
    pub fn new() -> reqwest::Result<Self> {
        let redirect_policy = reqwest::redirect::Policy::custom(|attempt| {
            let allowed = attempt
                .url()
                .host_str()
                .is_some_and(|host| REDIRECT_ALLOW_LIST.iter().any(|allowed| host_matches(host, allowed)));
            if allowed {
                attempt.follow()
            } else {
                attempt.stop()
            }
        });

        // No gzip/brotli/deflate/zstd cargo features are enabled for `reqwest`,
        // so no automatic decompression ever happens here: the stream engine
        // decodes bodies itself so the raw `Content-Encoding`/`Content-Length`
        // stay inspectable for integrity checks.
        let base = reqwest::Client::builder().redirect(redirect_policy).build()?;

        let inner = reqwest_middleware::ClientBuilder::new(base).build();

        Ok(Self {
            inner,
            cache: DashMap::new(),
        })
    }

    /// Builds a client wrapping an already-constructed middleware chain.
    /// Used by `mahoraga-server` when additional middleware (auth, mirror
    /// rewriting) needs to sit between this crate and the wire.
    pub fn from_middleware_client(inner: ClientWithMiddleware) -> Self {
        Self {
            inner,
            cache: DashMap::new(),
        }
    }

    pub fn inner(&self) -> &ClientWithMiddleware {
        &self.inner
    }

    /// Performs a buffered GET, consulting and populating the heuristic
    /// cache according to `action`. Never used for the large-body passthrough
    /// path, only for small metadata lookups (jsDelivr listings, `.sha256`
    /// sidecars, `run_exports.json` fetches).
    pub async fn get(&self, url: &Url, action: CacheAction) -> Result<CachedResponse, ClientError> {
        if action.allows_cache_read() {
            if let Some(entry) = self.cache.get(url) {
                if entry.fetched_at.elapsed() < HEURISTIC_CACHE_TTL {
                    return Ok(entry.response.clone());
                }
            }
        }

        if !action.allows_network() {
            return Err(ClientError::CacheMissRequired { url: url.to_string() });
        }

        let response = self
            .inner
            .get(url.clone())
            .send()
            .await
            .map_err(|source| request_error(url, source))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|source| request_error(url, reqwest_middleware::Error::Reqwest(source)))?;

        let cached = CachedResponse { status, headers, body };
        self.cache.insert(
            url.clone(),
            CacheEntry {
                fetched_at: Instant::now(),
                response: cached.clone(),
            },
        );
        Ok(cached)
    }

    /// Issues a streaming GET, forwarding `headers` verbatim. Never
    /// consults or populates the `get` cache: large bodies are addressed by
    /// the on-disk cache instead.
    pub async fn stream(&self, url: &Url, headers: HeaderMap) -> Result<reqwest::Response, ClientError> {
        self.inner
            .get(url.clone())
            .headers(headers)
            .send()
            .await
            .map_err(|source| request_error(url, source))
    }
}

fn request_error(url: &Url, source: reqwest_middleware::Error) -> ClientError {
    let redacted = url.clone().redact();
    tracing::debug!(url = %redacted, %source, "upstream request failed");
    ClientError::Request {
        url: redacted.to_string(),
        source,
    }
}

fn host_matches(host: &str, allowed: &str) -> bool {
    host == allowed || host.ends_with(&format!(".{allowed}"))
}

/// Tracks a single mirror attempt's wall-clock duration and reports it into
/// the statistics ledger when dropped. The reporting itself is dispatched as
/// a detached task so a caller that is about to try the next mirror never
/// blocks waiting for the ledger's file write to finish.
pub struct RequestScope {
    host: String,
    started_at: Instant,
    ledger: Arc<StatisticsLedger>,
    finished: bool,
}

impl RequestScope {
    pub fn open(ledger: Arc<StatisticsLedger>, host: impl Into<String>) -> Self {
        let host = host.into();
        ledger.on_open(&host);
        Self {
            host,
            started_at: Instant::now(),
            ledger,
            finished: false,
        }
    }

    /// Ends the scope and reports its elapsed time immediately, awaiting the
    /// ledger write. Prefer this over letting the guard drop when the caller
    /// can afford to wait (e.g. a successful response already fully served).
    pub async fn close(mut self) {
        self.finished = true;
        let elapsed = self.started_at.elapsed().as_secs_f64();
        self.ledger.on_close(&self.host);
        self.ledger.update(&self.host, elapsed).await;
    }
}

impl Drop for RequestScope {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let elapsed = self.started_at.elapsed().as_secs_f64();
        let ledger = self.ledger.clone();
        let host = std::mem::take(&mut self.host);
        tokio::spawn(async move {
            ledger.on_close(&host);
            ledger.update(&host, elapsed).await;
        });
    }
}
