//! Registration and heartbeats towards the controller

use crate::worker::ModelWorker;
use chatfleet_common::config::WorkerConfig;
use chatfleet_common::error::Result;
use chatfleet_common::METRICS;
use chatfleet_proto::{HeartbeatRequest, HeartbeatResponse, RegisterWorkerRequest};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Reports this worker's liveness and queue length to the controller
pub struct HeartbeatSender {
    worker: Arc<ModelWorker>,
    client: reqwest::Client,
    controller_address: String,
    interval: Duration,
}

impl HeartbeatSender {
    pub fn new(worker: Arc<ModelWorker>, config: &WorkerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.controller_timeout())
            .build()?;

        Ok(Self {
            worker,
            client,
            controller_address: config.controller_address.trim_end_matches('/').to_string(),
            interval: config.heart_beat_interval(),
        })
    }

    /// Register with the controller, reporting the current status
    pub async fn register(&self) -> Result<()> {
        let body = RegisterWorkerRequest {
            worker_name: self.worker.worker_address().to_string(),
            check_heart_beat: true,
            worker_status: Some(self.worker.get_status()),
        };

        self.client
            .post(format!("{}/register_worker", self.controller_address))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        info!(
            "Registered {} serving {:?} with controller {}",
            body.worker_name,
            self.worker.model_names(),
            self.controller_address
        );
        Ok(())
    }

    /// Send one heartbeat; returns whether the controller knows this worker
    pub async fn send_heartbeat(&self) -> Result<bool> {
        let body = HeartbeatRequest {
            worker_name: self.worker.worker_address().to_string(),
            queue_length: self.worker.queue_length(),
        };

        let response: HeartbeatResponse = self
            .client
            .post(format!("{}/receive_heart_beat", self.controller_address))
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        debug!("Heartbeat sent, queue length {}", body.queue_length);
        Ok(response.exist)
    }

    /// Heartbeat once, re-registering when the controller forgot us.
    ///
    /// Failures are logged and left for the next tick.
    pub async fn heartbeat_once(&self) {
        let result = match self.send_heartbeat().await {
            Ok(true) => Ok(()),
            Ok(false) => {
                info!("Controller does not know this worker, registering again");
                self.register().await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            METRICS.worker.heartbeat_failures.inc();
            warn!("Heartbeat to {} failed: {}", self.controller_address, e);
        }
    }

    /// Start the periodic heartbeat; it stops when `shutdown` is cancelled
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Heartbeat stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.heartbeat_once().await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::tests::{worker_config, ManualBackend};
    use axum::{extract::State, routing::post, Json, Router};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct FakeController {
        known: AtomicBool,
        calls: Mutex<Vec<String>>,
    }

    async fn register(
        State(state): State<Arc<FakeController>>,
        Json(req): Json<RegisterWorkerRequest>,
    ) -> Json<()> {
        state.known.store(true, Ordering::SeqCst);
        state.calls.lock().push(format!("register {}", req.worker_name));
        Json(())
    }

    async fn heartbeat(
        State(state): State<Arc<FakeController>>,
        Json(req): Json<HeartbeatRequest>,
    ) -> Json<HeartbeatResponse> {
        state.calls.lock().push(format!("heartbeat {}", req.queue_length));
        Json(HeartbeatResponse {
            exist: state.known.load(Ordering::SeqCst),
        })
    }

    async fn start_controller() -> (Arc<FakeController>, String) {
        let state = Arc::new(FakeController::default());
        let app = Router::new()
            .route("/register_worker", post(register))
            .route("/receive_heart_beat", post(heartbeat))
            .with_state(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (state, format!("http://{}", address))
    }

    fn sender(controller_address: String) -> HeartbeatSender {
        let mut config = worker_config(2, None);
        config.controller_address = controller_address;
        let worker = Arc::new(ModelWorker::new(&config, Arc::new(ManualBackend::default())));
        HeartbeatSender::new(worker, &config).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_worker_registers_again() {
        let (controller, address) = start_controller().await;
        let sender = sender(address);

        sender.heartbeat_once().await;
        sender.heartbeat_once().await;

        let calls = controller.calls.lock().clone();
        assert_eq!(
            calls,
            vec![
                "heartbeat 0".to_string(),
                "register http://localhost:21002".to_string(),
                "heartbeat 0".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_unreachable_controller_is_tolerated() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);
        let sender = sender(address);

        assert!(sender.send_heartbeat().await.is_err());
        sender.heartbeat_once().await;
    }
}
