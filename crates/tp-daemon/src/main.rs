//! troupe daemon: hosts the agent orchestration layer until ctrl-c.

use anyhow::{Context, Result};
use tp_core::config::Config;
use tp_daemon::daemon::Daemon;
use tracing::info;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Overrides the default config location.
const CONFIG_ENV: &str = "TROUPE_CONFIG";

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is normal.
    let env_file = dotenv::dotenv().ok();

    let config = load_config()?;
    tp_telemetry::logging::init_from_config("troupe", &config.general);
    if let Some(path) = env_file {
        info!(path = %path.display(), "loaded environment file");
    }
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        "troupe daemon starting"
    );

    let daemon = Daemon::new(config);
    let shutdown = daemon.shutdown_handle();

    // Wire ctrl-c to trigger graceful shutdown.
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, initiating shutdown");
        shutdown.trigger();
    });

    let drained = daemon.run().await?;
    info!(clean = drained.is_complete(), "troupe daemon exited");
    Ok(())
}

fn load_config() -> Result<Config> {
    match std::env::var(CONFIG_ENV) {
        Ok(path) => {
            Config::load_from(&path).with_context(|| format!("failed to load config from {path}"))
        }
        Err(_) => Config::load().context("failed to load config"),
    }
}
