//! Worker status probes from the controller

use async_trait::async_trait;
use chatfleet_common::error::{ChatFleetError, Result};
use chatfleet_proto::WorkerStatus;
use std::time::Duration;

/// Source of worker status, swappable in tests
#[async_trait]
pub trait StatusProbe: Send + Sync {
    /// Fetch the current status of the worker at `address`
    async fn get_status(&self, address: &str) -> Result<WorkerStatus>;
}

/// Probe that calls `POST {address}/worker_get_status`
#[derive(Clone)]
pub struct HttpStatusProbe {
    client: reqwest::Client,
}

impl HttpStatusProbe {
    /// Create a probe whose requests give up after `timeout`
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl StatusProbe for HttpStatusProbe {
    async fn get_status(&self, address: &str) -> Result<WorkerStatus> {
        let url = format!("{}/worker_get_status", address.trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ChatFleetError::worker_unreachable(format!("{}: {}", address, e)))?;

        Ok(response.json::<WorkerStatus>().await?)
    }
}
