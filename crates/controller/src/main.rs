//! ChatFleet Controller - Main Entry Point

use chatfleet_common::{logging, metrics_router, ChatFleetConfig, Result};
use chatfleet_controller::{create_router, serve, Controller, HttpStatusProbe};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config_path = std::env::var("CHATFLEET_CONFIG")
        .unwrap_or_else(|_| "configs/controller.yaml".to_string());

    let config = ChatFleetConfig::from_file(&config_path)?;
    logging::init("chatfleet_controller", &config.observability_or_default());

    info!(
        "Controller configuration loaded: mode={}, bind={}:{}",
        config.mode, config.bind_address, config.port
    );

    let controller_config = config.controller_or_default();
    info!(
        "Dispatch method {:?}, heartbeat expiration {}s",
        controller_config.dispatch_method, controller_config.heart_beat_expiration_secs
    );

    let probe = Arc::new(HttpStatusProbe::new(controller_config.probe_timeout())?);
    let controller = Arc::new(Controller::new(controller_config, probe));

    let shutdown = CancellationToken::new();
    let sweep_handle = controller.clone().spawn_expiry_sweep(shutdown.clone());

    let listener = TcpListener::bind(config.listen_address()).await?;
    let mut router = create_router(controller);
    if config.observability_or_default().enable_metrics {
        router = router.merge(metrics_router());
    }
    let server = tokio::spawn(serve(listener, router, shutdown.clone()));

    info!("ChatFleet Controller running");

    // Wait for shutdown signal
    if let Err(e) = signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Received shutdown signal");
    shutdown.cancel();

    match server.await {
        Ok(result) => result?,
        Err(e) => error!("Server task failed: {}", e),
    }
    if let Err(e) = sweep_handle.await {
        error!("Expiry sweep task failed: {}", e);
    }

    info!("ChatFleet Controller shutdown complete");
    Ok(())
}
