//! `mahoraga serve`: runs the proxy until interrupted.

use std::sync::Arc;

use mahoraga_config::Config;
use mahoraga_shards::ShardJob;

use crate::router;
use crate::state;

#[derive(Debug, clap::Args)]
pub struct Opt {
    /// Path to the configuration file. A missing file is not an error —
    /// the proxy runs with compiled-in defaults.
    #[clap(long, default_value = "mahoraga.toml")]
    config: std::path::PathBuf,

    /// Directory cache entries and `statistics.json` are written under.
    #[clap(long, default_value = ".")]
    cache_root: std::path::PathBuf,
}

impl Opt {
    pub fn config_path(&self) -> &std::path::Path {
        &self.config
    }
}

pub async fn serve(opt: Opt) -> anyhow::Result<()> {
    let config = Config::load(&opt.config)?;
    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        cache_root = %opt.cache_root.display(),
        "starting mahoraga"
    );

    let route_state = state::build(config, &opt.cache_root).await?;

    spawn_shard_jobs(route_state.clone());

    let addr = format!("{}:{}", route_state.config.server.host, route_state.config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "listening");

    let app = router::build(route_state);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// Runs every configured shard job once, in the background, so a slow or
/// failing channel's sharding never delays the server binding its socket.
/// Matches spec.md §4.7: "triggered once on startup... failures are logged
/// and do not block the server."
fn spawn_shard_jobs(route_state: Arc<mahoraga_routes::RouteState>) {
    let jobs: Vec<ShardJob> = route_state
        .config
        .shards
        .iter()
        .map(|spec| ShardJob {
            channel: spec.channel.clone(),
            platform: spec.platform.clone(),
            label: spec.label.clone(),
        })
        .collect();
    if jobs.is_empty() {
        return;
    }

    let mirrors = jobs
        .iter()
        .map(|job| (job.channel.clone(), route_state.config.conda_mirrors_for(&job.channel)))
        .collect();

    let client = Arc::new(mahoraga_client::UpstreamClient::new().expect("client builds with static configuration"));
    let cache_root = route_state.cache_path("");

    tokio::spawn(async move {
        tracing::info!(job_count = jobs.len(), "starting sharded-repodata jobs");
        mahoraga_shards::run_all(jobs, mirrors, client, cache_root, None).await;
        tracing::info!("sharded-repodata jobs finished");
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
