use std::sync::Arc;

use anyhow::Context;
use stream_relay::{Relay, RelayConfig, TokioSpawner, logging};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = RelayConfig::load().context("Invalid relay configuration")?;
    let (logging, _guard) = logging::init_logging(config.log_dir.as_deref())?;

    let shutdown = CancellationToken::new();
    logging.start_retention_cleanup(shutdown.clone());
    info!(filter = %logging.get_filter(), log_dir = ?logging.log_dir(), "Logging initialized");

    let spawner = Arc::new(TokioSpawner::new(config.graceful_stop()));
    let relay = Relay::build(config, spawner)?;
    relay.start().await?;
    info!(manifest = %relay.manifest_path().display(), "Relay running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    shutdown.cancel();
    relay.shutdown().await?;
    info!("stream-relay stopped");
    Ok(())
}
