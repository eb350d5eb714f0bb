//! `clasperd` — the Clasper control-plane daemon.

use std::sync::Arc;

use anyhow::Context as _;
use clasper_daemon::config::Config;
use clasper_daemon::state::Daemon;
use clasper_daemon::sweeper;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env().context("loading configuration")?;
    let sweep_interval = config.sweep_interval;
    let db_path = config.db_path.clone();

    let daemon = Arc::new(Daemon::new(config).context("wiring services")?);
    tracing::info!(db = %db_path, "clasperd started");

    let sweeper_handle = sweeper::spawn(Arc::clone(&daemon.queue), sweep_interval);

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutting down");
    sweeper_handle.abort();
    Ok(())
}
