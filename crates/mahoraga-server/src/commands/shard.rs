//! `mahoraga shard build`: runs every configured `ShardBuilder` job once and
//! exits, for operational use outside the long-running server (cron, a
//! deploy hook that wants fresh shards before traffic arrives).

use std::sync::Arc;

use mahoraga_client::UpstreamClient;
use mahoraga_config::Config;
use mahoraga_shards::ShardJob;

#[derive(Debug, clap::Args)]
pub struct Opt {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Materializes sharded repodata for every `[[shard]]` job in the
    /// configuration file, then exits.
    Build(BuildOpt),
}

#[derive(Debug, clap::Args)]
pub struct BuildOpt {
    #[clap(long, default_value = "mahoraga.toml")]
    config: std::path::PathBuf,

    #[clap(long, default_value = ".")]
    cache_root: std::path::PathBuf,
}

impl Opt {
    pub fn config_path(&self) -> &std::path::Path {
        match &self.command {
            Command::Build(opt) => &opt.config,
        }
    }
}

pub async fn dispatch(opt: Opt) -> anyhow::Result<()> {
    match opt.command {
        Command::Build(opt) => build(opt).await,
    }
}

async fn build(opt: BuildOpt) -> anyhow::Result<()> {
    let config = Config::load(&opt.config)?;
    if config.shards.is_empty() {
        tracing::warn!("no [[shard]] jobs configured, nothing to do");
        return Ok(());
    }

    tokio::fs::create_dir_all(&opt.cache_root).await?;

    let jobs: Vec<ShardJob> = config
        .shards
        .iter()
        .map(|spec| ShardJob {
            channel: spec.channel.clone(),
            platform: spec.platform.clone(),
            label: spec.label.clone(),
        })
        .collect();
    let mirrors = jobs
        .iter()
        .map(|job| (job.channel.clone(), config.conda_mirrors_for(&job.channel)))
        .collect();

    let client = Arc::new(UpstreamClient::new()?);
    tracing::info!(job_count = jobs.len(), "running sharded-repodata jobs");
    mahoraga_shards::run_all(jobs, mirrors, client, opt.cache_root, None).await;
    tracing::info!("sharded-repodata jobs finished");
    Ok(())
}
