//! ChatFleet Worker - Main Entry Point
//!
//! Starts the generation backend and HTTP server, registers with the
//! controller and keeps heartbeating until shutdown.

use chatfleet_common::{logging, metrics_router, ChatFleetConfig, ChatFleetError, Result};
use chatfleet_worker::{build_backend, create_router, serve, HeartbeatSender, ModelWorker};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config_path = std::env::var("CHATFLEET_CONFIG")
        .unwrap_or_else(|_| "configs/worker.yaml".to_string());

    let config = ChatFleetConfig::from_file(&config_path)?;
    logging::init("chatfleet_worker", &config.observability_or_default());

    info!(
        "Worker configuration loaded: mode={}, bind={}:{}",
        config.mode, config.bind_address, config.port
    );

    // Get worker-specific config
    let worker_config = config
        .worker
        .as_ref()
        .ok_or_else(|| ChatFleetError::config("Worker config not found"))?;

    info!(
        "Serving {:?} with concurrency limit {}",
        worker_config.model_names, worker_config.limit_worker_concurrency
    );

    let backend = build_backend(&worker_config.backend)?;
    let worker = Arc::new(ModelWorker::new(worker_config, backend));

    let shutdown = CancellationToken::new();
    let listener = TcpListener::bind(config.listen_address()).await?;
    let mut router = create_router(worker.clone());
    if config.observability_or_default().enable_metrics {
        router = router.merge(metrics_router());
    }
    let server = tokio::spawn(serve(listener, router, shutdown.clone()));

    let heartbeat_handle = if worker_config.no_register {
        info!("Registration disabled, running standalone");
        None
    } else {
        let sender = Arc::new(HeartbeatSender::new(worker.clone(), worker_config)?);
        if let Err(e) = sender.register().await {
            warn!("Initial registration failed, will retry on heartbeat: {}", e);
        }
        Some(sender.spawn(shutdown.clone()))
    };

    info!("ChatFleet Worker running at {}", worker.worker_address());

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
    if let Some(handle) = heartbeat_handle {
        if let Err(e) = handle.await {
            error!("Heartbeat task failed: {}", e);
        }
    }

    info!("ChatFleet Worker shutdown complete");
    Ok(())
}
