use std::sync::Arc;

use anyhow::Context;

use courier_core::AppConfig;
use courier_queue::LogMailer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load().context("failed to load configuration")?;
    courier_observability::init(&config.log);

    match &config.source {
        Some(path) => tracing::info!(path = %path.display(), "configuration loaded"),
        None => tracing::warn!("no configuration file found; using built-in defaults"),
    }

    let manager = courier_app::bootstrap::start(&config, Arc::new(LogMailer::default()))?;
    tracing::info!(
        app = %config.app.name,
        version = %config.app.version,
        queues = ?manager.registered_queues(),
        "courier started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");

    // close() blocks while consumers drain.
    tokio::task::spawn_blocking(move || manager.close()).await??;
    Ok(())
}
