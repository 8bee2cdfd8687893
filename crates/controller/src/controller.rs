//! Controller service
//!
//! Wraps the registry with the operations exposed over HTTP: registration
//! (probing the worker when it did not report a status), heartbeats, status
//! sweeps and dispatch. Also owns the periodic expiry sweep.

use crate::probe::StatusProbe;
use crate::registry::WorkerRegistry;
use chatfleet_common::config::ControllerConfig;
use chatfleet_common::error::{ChatFleetError, Result};
use chatfleet_common::METRICS;
use chatfleet_proto::WorkerStatus;
use futures::future::join_all;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct Controller {
    registry: WorkerRegistry,
    probe: Arc<dyn StatusProbe>,
    config: ControllerConfig,
}

impl Controller {
    pub fn new(config: ControllerConfig, probe: Arc<dyn StatusProbe>) -> Self {
        Self {
            registry: WorkerRegistry::new(config.dispatch_method),
            probe,
            config,
        }
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Register or refresh a worker.
    ///
    /// Without a reported status the worker is probed first; an unreachable
    /// worker is not recorded.
    pub async fn register_worker(
        &self,
        address: &str,
        check_heart_beat: bool,
        status: Option<WorkerStatus>,
    ) -> Result<()> {
        let status = match status {
            Some(status) => status,
            None => self.probe_status(address).await?,
        };

        if status.model_names.is_empty() {
            return Err(ChatFleetError::invalid_input(format!(
                "worker {} reported no models",
                address
            )));
        }

        self.registry.register(address, check_heart_beat, status);
        Ok(())
    }

    pub fn remove_worker(&self, address: &str) -> bool {
        self.registry.remove(address)
    }

    /// Returns whether the worker is known; unknown workers must re-register
    pub fn receive_heartbeat(&self, address: &str, queue_length: usize) -> bool {
        let exist = self.registry.heartbeat(address, queue_length);
        if exist {
            METRICS.controller.heartbeats_received.inc();
        }
        exist
    }

    /// Probe every registered worker and drop the ones that fail.
    ///
    /// Probes run concurrently outside the registry lock; their results are
    /// applied together.
    pub async fn refresh_all_workers(&self) {
        let addresses = self.registry.addresses();
        debug!("Refreshing {} workers", addresses.len());

        let probes = addresses.into_iter().map(|address| async move {
            let status = match self.probe_status(&address).await {
                Ok(status) => Some(status),
                Err(e) => {
                    warn!("Status probe failed for {}: {}", address, e);
                    None
                }
            };
            (address, status)
        });
        let results = join_all(probes).await;

        let removed = self.registry.apply_probe_results(results);
        if !removed.is_empty() {
            METRICS.controller.probe_failures.inc_by(removed.len() as u64);
            info!("Removed {} workers after refresh: {:?}", removed.len(), removed);
        }
    }

    pub fn list_models(&self) -> Vec<String> {
        self.registry.list_models()
    }

    /// Address of a worker serving `model_name`; empty when none is live
    pub fn get_worker_address(&self, model_name: &str) -> String {
        match self.registry.select(model_name) {
            Some(address) => {
                METRICS.controller.dispatch_decisions.inc();
                address
            }
            None => {
                METRICS.controller.no_worker_available.inc();
                warn!("No worker available for model {}", model_name);
                String::new()
            }
        }
    }

    /// Aggregate status across live workers
    pub fn worker_status(&self) -> WorkerStatus {
        self.registry.aggregate_status()
    }

    /// Run one expiry pass
    pub fn expire_stale_workers(&self) -> Vec<String> {
        let expired = self.registry.remove_stale(self.config.heart_beat_expiration());
        if !expired.is_empty() {
            METRICS.controller.workers_expired.inc_by(expired.len() as u64);
        }
        expired
    }

    /// Start the periodic expiry sweep; it stops when `shutdown` is cancelled
    pub fn spawn_expiry_sweep(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.config.sweep_interval();
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Expiry sweep stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.expire_stale_workers();
                    }
                }
            }
        })
    }

    async fn probe_status(&self, address: &str) -> Result<WorkerStatus> {
        tokio::time::timeout(self.config.probe_timeout(), self.probe.get_status(address))
            .await
            .map_err(|_| ChatFleetError::worker_unreachable(format!("{}: status probe timed out", address)))?
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::time::Duration;

    /// Probe answering from a table; missing addresses fail
    #[derive(Default)]
    pub(crate) struct FakeProbe {
        pub(crate) statuses: Mutex<HashMap<String, WorkerStatus>>,
    }

    impl FakeProbe {
        pub(crate) fn set(&self, address: &str, models: &[&str], queue_length: usize) {
            self.statuses.lock().insert(
                address.to_string(),
                WorkerStatus {
                    model_names: models.iter().map(|m| m.to_string()).collect(),
                    speed: 1.0,
                    queue_length,
                },
            );
        }

        pub(crate) fn kill(&self, address: &str) {
            self.statuses.lock().remove(address);
        }
    }

    #[async_trait]
    impl StatusProbe for FakeProbe {
        async fn get_status(&self, address: &str) -> Result<WorkerStatus> {
            self.statuses
                .lock()
                .get(address)
                .cloned()
                .ok_or_else(|| ChatFleetError::worker_unreachable(address.to_string()))
        }
    }

    struct HangingProbe;

    #[async_trait]
    impl StatusProbe for HangingProbe {
        async fn get_status(&self, _address: &str) -> Result<WorkerStatus> {
            std::future::pending().await
        }
    }

    fn controller_with(probe: Arc<FakeProbe>) -> Controller {
        Controller::new(ControllerConfig::default(), probe)
    }

    #[tokio::test]
    async fn test_register_without_status_probes_worker() {
        let probe = Arc::new(FakeProbe::default());
        probe.set("http://w1", &["vicuna"], 2);
        let controller = controller_with(probe);

        controller.register_worker("http://w1", true, None).await.unwrap();

        assert_eq!(controller.list_models(), vec!["vicuna"]);
        assert!(controller.register_worker("http://w2", true, None).await.is_err());
        assert_eq!(controller.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_removes_unreachable_workers() {
        let probe = Arc::new(FakeProbe::default());
        probe.set("http://w1", &["M"], 0);
        probe.set("http://w2", &["M"], 0);
        probe.set("http://w3", &["M"], 0);
        let controller = controller_with(probe.clone());
        for address in ["http://w1", "http://w2", "http://w3"] {
            controller.register_worker(address, true, None).await.unwrap();
        }

        probe.kill("http://w2");
        probe.set("http://w3", &[], 0);
        controller.refresh_all_workers().await;

        assert_eq!(controller.registry().addresses(), vec!["http://w1"]);
        assert_eq!(controller.get_worker_address("M"), "http://w1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_timeout_is_bounded() {
        let controller = Controller::new(ControllerConfig::default(), Arc::new(HangingProbe));

        let result = controller.register_worker("http://slow", true, None).await;

        assert!(matches!(result, Err(ChatFleetError::WorkerUnreachable(_))));
    }

    #[tokio::test]
    async fn test_dispatch_miss_is_empty_address() {
        let controller = controller_with(Arc::new(FakeProbe::default()));

        assert_eq!(controller.get_worker_address("M"), "");
    }

    #[tokio::test]
    async fn test_heartbeat_requires_registration() {
        let probe = Arc::new(FakeProbe::default());
        probe.set("http://w1", &["M"], 0);
        let controller = controller_with(probe);

        assert!(!controller.receive_heartbeat("http://w1", 1));
        controller.register_worker("http://w1", true, None).await.unwrap();
        assert!(controller.receive_heartbeat("http://w1", 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_sweep_task() {
        let probe = Arc::new(FakeProbe::default());
        probe.set("http://w1", &["M"], 0);
        probe.set("http://w2", &["M"], 0);
        let controller = Arc::new(controller_with(probe));
        controller.register_worker("http://w1", true, None).await.unwrap();
        controller.register_worker("http://w2", true, None).await.unwrap();

        let shutdown = CancellationToken::new();
        let sweep = controller.clone().spawn_expiry_sweep(shutdown.clone());

        // only w2 heartbeats; sweeps fire at 45s, 90s and 135s
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_secs(35)).await;
            controller.receive_heartbeat("http://w2", 0);
        }

        assert_eq!(controller.registry().addresses(), vec!["http://w2"]);

        shutdown.cancel();
        sweep.await.unwrap();
    }
}
