//! Client for the controller's HTTP API

use chatfleet_common::error::{ChatFleetError, Result};
use chatfleet_proto::{ListModelsResponse, WorkerAddressRequest, WorkerAddressResponse, WorkerStatus};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

const CONTROLLER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct ControllerClient {
    client: reqwest::Client,
    address: String,
}

impl ControllerClient {
    pub fn new(address: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(CONTROLLER_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            address: address.trim_end_matches('/').to_string(),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: &impl serde::Serialize) -> Result<T> {
        let response = self
            .client
            .post(format!("{}{}", self.address, path))
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    /// Ask the controller to re-probe every registered worker
    pub async fn refresh_all_workers(&self) -> Result<()> {
        self.client
            .post(format!("{}/refresh_all_workers", self.address))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn list_models(&self) -> Result<Vec<String>> {
        let response: ListModelsResponse = self.post("/list_models", &serde_json::json!({})).await?;
        Ok(response.models)
    }

    /// Resolve a worker for `model`.
    ///
    /// An empty address from the controller becomes `NoWorkerAvailable`.
    pub async fn get_worker_address(&self, model: &str) -> Result<String> {
        let request = WorkerAddressRequest {
            model: model.to_string(),
        };
        let response: WorkerAddressResponse = self.post("/get_worker_address", &request).await?;

        if response.address.is_empty() {
            return Err(ChatFleetError::NoWorkerAvailable(model.to_string()));
        }
        debug!("Model {} dispatched to {}", model, response.address);
        Ok(response.address)
    }

    /// Aggregate status over all registered workers
    pub async fn worker_status(&self) -> Result<WorkerStatus> {
        self.post("/worker_get_status", &serde_json::json!({})).await
    }
}
