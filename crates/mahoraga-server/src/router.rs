//! Assembles the `axum::Router` for every route in spec.md §6's table,
//! plus the `tower-http` tracing/CORS layers. Socket-level serving detail
//! (TLS, HTTP/1 vs HTTP/2 negotiation) is left to `axum::serve`'s defaults —
//! a non-goal per spec.md §1.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use mahoraga_routes::{conda, npm, pyodide, pypi, python, shards, uv, RouteState};
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

/// Directory the `/static/*` route serves verbatim, relative to the
/// process's current working directory — matching the cache root and
/// config file's own convention of being resolved against the cwd rather
/// than the binary's install location.
const STATIC_DIR: &str = "static";

pub fn build(state: Arc<RouteState>) -> Router {
    let router = Router::new()
        // Sharded repodata routes carry a literal suffix after `{channel}`,
        // so matchit resolves them ahead of the catch-all conda proxy below
        // regardless of registration order.
        .route("/conda/{channel}/{platform}/repodata_shards.msgpack.zst", get(shards::index))
        .route(
            "/conda/{channel}/label/{label}/{platform}/repodata_shards.msgpack.zst",
            get(shards::index_with_label),
        )
        .route("/conda/{channel}/{platform}/shards/{name}", get(shards::shard))
        .route(
            "/conda/{channel}/label/{label}/{platform}/shards/{name}",
            get(shards::shard_with_label),
        )
        .route("/conda/{channel}/{*rest}", get(conda::proxy_channel))
        .route("/pypi/{*rest}", get(pypi::proxy))
        .route("/npm/@{scope}/{package}/{*path}", get(npm::get_scoped_npm_file))
        .route("/npm/{package}/{*path}", get(npm::get_npm_file))
        .route("/pyodide/{*rest}", get(pyodide::proxy))
        .route("/python-build-standalone/{tag}/{name}", get(python::get_standalone_python))
        .route("/python/{version}/{name}", get(python::get_embedded_python))
        .route("/uv/{*rest}", get(uv::proxy))
        .nest_service("/static", ServeDir::new(STATIC_DIR))
        .with_state(state.clone());

    router
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&state.config.cors.allow_origins))
}

fn cors_layer(allow_origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).max_age(Duration::from_secs(3600));
    if allow_origins.iter().any(|origin| origin == "*") {
        layer.allow_origin(Any)
    } else {
        let origins: Vec<_> = allow_origins.iter().filter_map(|origin| origin.parse().ok()).collect();
        layer.allow_origin(origins)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use mahoraga_client::UpstreamClient;
    use mahoraga_config::Config;
    use mahoraga_ledger::StatisticsLedger;
    use mahoraga_lock::LockRegistry;

    use super::*;

    async fn spawn_upstream(app: Router) -> url::Url {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        url::Url::parse(&format!("http://{addr}")).unwrap()
    }

    /// Builds a full [`RouteState`] over a `tempfile` cache root and binds
    /// `router::build`'s `Router` to an ephemeral port, the same "spawn a
    /// real server, hit it over a socket" style `mahoraga_stream`'s own
    /// tests use, rather than `tower::ServiceExt::oneshot`.
    async fn spawn_proxy(config: Config) -> (url::Url, tempfile::TempDir) {
        let cache_dir = tempfile::tempdir().unwrap();
        let locks = Arc::new(LockRegistry::new());
        let ledger = Arc::new(StatisticsLedger::load(cache_dir.path().join("statistics.json"), HashSet::new(), locks.clone()).await);
        let client = Arc::new(UpstreamClient::new().unwrap());
        let engine = mahoraga_stream::StreamEngine::new(client, ledger, locks.clone());
        let state = Arc::new(RouteState::new(engine, config, locks, cache_dir.path()));

        let app = build(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (url::Url::parse(&format!("http://{addr}")).unwrap(), cache_dir)
    }

    #[tokio::test]
    async fn pypi_route_proxies_through_to_a_configured_mirror() {
        let upstream = Router::new().route("/simple/foo/", get(|| async { "package index" }));
        let upstream_url = spawn_upstream(upstream).await;

        let mut config = Config::default();
        config.mirrors.pypi = vec![upstream_url.to_string()];
        let (proxy_url, _cache_dir) = spawn_proxy(config).await;

        let response = reqwest::get(proxy_url.join("/pypi/simple/foo/").unwrap()).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "package index");
    }

    #[tokio::test]
    async fn unknown_path_returns_not_found_instead_of_panicking() {
        let (proxy_url, _cache_dir) = spawn_proxy(Config::default()).await;
        let response = reqwest::get(proxy_url.join("/not-a-route").unwrap()).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cors_layer_echoes_a_wildcard_allow_origin_by_default() {
        let (proxy_url, _cache_dir) = spawn_proxy(Config::default()).await;
        let client = reqwest::Client::new();
        let response = client
            .get(proxy_url.join("/not-a-route").unwrap())
            .header("origin", "https://example.org")
            .send()
            .await
            .unwrap();
        assert_eq!(
            response.headers().get("access-control-allow-origin").map(|v| v.to_str().unwrap()),
            Some("*")
        );
    }

    #[tokio::test]
    async fn cors_layer_only_allows_configured_origins_when_not_wildcarded() {
        let mut config = Config::default();
        config.cors.allow_origins = vec!["https://allowed.example.org".to_string()];
        let (proxy_url, _cache_dir) = spawn_proxy(config).await;

        let client = reqwest::Client::new();
        let allowed = client
            .get(proxy_url.join("/not-a-route").unwrap())
            .header("origin", "https://allowed.example.org")
            .send()
            .await
            .unwrap();
        assert_eq!(
            allowed.headers().get("access-control-allow-origin").map(|v| v.to_str().unwrap()),
            Some("https://allowed.example.org")
        );

        let disallowed = client
            .get(proxy_url.join("/not-a-route").unwrap())
            .header("origin", "https://other.example.org")
            .send()
            .await
            .unwrap();
        assert!(disallowed.headers().get("access-control-allow-origin").is_none());
    }

    /// Builds the jsDelivr-shaped mock one `full_name`/`version`/`path`
    /// needs: the resolved-version lookup, the flat file-listing metadata
    /// (carrying the base64 SHA-256 the npm adapter verifies against), and
    /// the file download itself, all on one origin. `full_name` is the
    /// jsDelivr package name including any `@scope/` prefix. The listener is
    /// bound before the router is built so the absolute `self` link the
    /// resolved-version response carries can point back at this same
    /// origin, exactly like `data.jsdelivr.com` does for the real API.
    async fn spawn_jsdelivr_mock(full_name: &str, version: &str, path: &str, body: &'static str) -> url::Url {
        use base64::Engine;
        use sha2::{Digest, Sha256};
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = url::Url::parse(&format!("http://{}", listener.local_addr().unwrap())).unwrap();

        let hash = base64::engine::general_purpose::STANDARD.encode(Sha256::digest(body.as_bytes()));
        let resolved_path = format!("/v1/packages/npm/{full_name}/resolved");
        let metadata_path = format!("/v1/packages/npm/{full_name}@{version}");
        let download_path = format!("/npm/{full_name}@{version}/{path}");
        let self_link = format!("{base}v1/packages/npm/{full_name}@{version}");

        let resolved_body = serde_json::json!({"version": version, "links": {"self": self_link}}).to_string();
        let metadata_body = serde_json::json!({"files": [{"name": format!("/{path}"), "hash": hash, "size": body.len()}]}).to_string();

        let app = Router::new()
            .route(
                &resolved_path,
                get(move || {
                    let resolved_body = resolved_body.clone();
                    async move { ([("content-type", "application/json")], resolved_body) }
                }),
            )
            .route(
                &metadata_path,
                get(move || {
                    let metadata_body = metadata_body.clone();
                    async move { ([("content-type", "application/json")], metadata_body) }
                }),
            )
            .route(&download_path, get(move || async move { body }));

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        base
    }

    #[tokio::test]
    async fn npm_scoped_route_is_distinguished_from_the_unscoped_route() {
        let unscoped_base = spawn_jsdelivr_mock("left-pad", "1.3.0", "left-pad.js", "unscoped").await;
        let scoped_base = spawn_jsdelivr_mock("@pyodide/pyodide", "0.26.0", "pyodide.js", "scoped").await;

        let mut unscoped_config = Config::default();
        unscoped_config.mirrors.jsdelivr_npm = vec![format!("{unscoped_base}npm")];
        unscoped_config.npm.resolver_base = unscoped_base.to_string();
        let (unscoped_proxy, _unscoped_cache_dir) = spawn_proxy(unscoped_config).await;

        let unscoped_response = reqwest::get(unscoped_proxy.join("/npm/left-pad@1.3.0/left-pad.js").unwrap()).await.unwrap();
        assert_eq!(unscoped_response.status(), reqwest::StatusCode::OK);
        assert_eq!(unscoped_response.text().await.unwrap(), "unscoped");

        let mut scoped_config = Config::default();
        scoped_config.mirrors.jsdelivr_npm = vec![format!("{scoped_base}npm")];
        scoped_config.npm.resolver_base = scoped_base.to_string();
        let (scoped_proxy, _scoped_cache_dir) = spawn_proxy(scoped_config).await;

        let scoped_response = reqwest::get(scoped_proxy.join("/npm/@pyodide/pyodide@0.26.0/pyodide.js").unwrap())
            .await
            .unwrap();
        assert_eq!(scoped_response.status(), reqwest::StatusCode::OK);
        assert_eq!(scoped_response.text().await.unwrap(), "scoped");
    }
}
