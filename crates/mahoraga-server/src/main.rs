//! `mahoraga`: a caching reverse proxy aggregating conda, PyPI, jsDelivr,
//! embedded CPython, and python-build-standalone mirrors behind one local
//! HTTP endpoint.
//!
//! Entry point wiring follows `rattler-bin/src/main.rs`: a `clap::Parser`
//! over a subcommand enum, a `tokio::runtime::Builder::new_multi_thread()`
//! runtime sized off `std::thread::available_parallelism()`, and a
//! `tracing_subscriber::EnvFilter` seeded from the configuration's log
//! level (rather than `rattler-bin`'s `--verbose` flag, since this binary's
//! log level is a server setting, not a one-off CLI flag).

mod commands;
mod router;
mod state;

use clap::Parser;

#[derive(Debug, Parser)]
#[clap(author, version, about, long_about = None)]
struct Opt {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Runs the proxy server.
    Serve(commands::serve::Opt),
    /// Operates on sharded conda repodata outside the running server.
    Shard(commands::shard::Opt),
}

fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();
    init_tracing(&opt.command);

    let num_cores = std::thread::available_parallelism().map(std::num::NonZero::get).unwrap_or(2).max(2);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cores / 2)
        .max_blocking_threads(num_cores)
        .enable_all()
        .build()?;

    runtime.block_on(async_main(opt))
}

async fn async_main(opt: Opt) -> anyhow::Result<()> {
    match opt.command {
        Command::Serve(opt) => commands::serve::serve(opt).await,
        Command::Shard(opt) => commands::shard::dispatch(opt).await,
    }
}

/// Seeds the default log level from the configuration file's `log.level`
/// (not yet fully loaded/validated at this point — a best-effort peek is
/// enough for the default directive) rather than a hardcoded `info`, then
/// lets `RUST_LOG` override it exactly as `rattler-bin` lets `--verbose`
/// be overridden by the environment.
fn init_tracing(command: &Command) {
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let config_path = match command {
        Command::Serve(opt) => opt.config_path(),
        Command::Shard(opt) => opt.config_path(),
    };
    let level = mahoraga_config::Config::load(config_path).map(|config| config.log.level).unwrap_or_else(|_| "info".to_string());

    let env_filter = EnvFilter::builder()
        .with_default_directive(level.parse().unwrap_or(tracing::level_filters::LevelFilter::INFO.into()))
        .from_env_lossy();

    tracing_subscriber::fmt().with_env_filter(env_filter).finish().try_init().ok();
}
