//! skiff Device Agent
//!
//! Applies the target state read from `SKIFF_TARGET_FILE` every poll
//! interval and keeps the device converged until Ctrl-C.

use std::sync::Arc;

use anyhow::{Context, Result};
use skiff_agent::reconciler::Reconciler;
use skiff_agent::{Composer, Config, MockEngine};
use skiff_events::TracingSink;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting skiff device agent");
    info!(
        uuid = %config.uuid,
        device_type = %config.device_type,
        local_mode = config.local_mode,
        delta = config.delta,
        "Configuration loaded"
    );

    let target_file = config
        .target_file
        .clone()
        .context("SKIFF_TARGET_FILE must be set")?;

    // In-memory engine until an engine socket client is wired in
    let engine = Arc::new(MockEngine::new());
    let composer = Arc::new(Composer::new(engine, Arc::new(TracingSink), &config));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconciler = Reconciler::new(
        Arc::clone(&composer),
        target_file,
        config.app_update_poll_interval,
    );
    let mut reconciler_handle = tokio::spawn(async move {
        reconciler.run(shutdown_rx).await;
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut reconciler_handle => {
            if let Err(e) = result {
                error!(error = %e, "Apply loop task panicked");
            }
            return Ok(());
        }
    }

    let _ = shutdown_tx.send(true);
    composer.cancel();

    info!("Waiting for the apply loop to stop...");
    if let Err(e) = reconciler_handle.await {
        error!(error = %e, "Apply loop task panicked");
    }

    info!("Device agent shutdown complete");
    Ok(())
}
