// chatlogd: local message cache mirrored into Git repositories.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use chatlog_daemon::config::DaemonConfig;

#[derive(Parser)]
#[command(name = "chatlogd", version, about = "Local message cache mirrored into Git repositories")]
struct Cli {
    /// Config file (defaults to ~/.chatlog/config.toml).
    #[arg(long, short)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = DaemonConfig::load(cli.config.as_deref()).context("failed to load daemon config")?;

    // RUST_LOG wins over the configured filter.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(targets = config.targets.len(), "starting chatlog daemon");
    chatlog_daemon::runtime::run(config).await.context("chatlog daemon terminated unexpectedly")
}
