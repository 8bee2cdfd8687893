//! Configuration structures for ChatFleet
//!
//! This module defines all configuration types used across workers and the controller.
//! Configurations are loaded from YAML files and can be overridden by environment
//! variables of the form `CHATFLEET__WORKER__PORT`.

use crate::error::{ChatFleetError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for ChatFleet components
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatFleetConfig {
    /// Mode: either "worker" or "controller"
    pub mode: String,

    /// Server binding address
    pub bind_address: String,

    /// Server port
    pub port: u16,

    /// Controller-specific configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<ControllerConfig>,

    /// Worker-specific configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<WorkerConfig>,

    /// Observability configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,
}

/// Load balancing policy used by `get_worker_address`
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMethod {
    /// Lowest `queue_length / speed` wins
    #[default]
    ShortestQueue,

    /// Random pick weighted by speed
    Lottery,
}

/// Controller-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default)]
    pub dispatch_method: DispatchMethod,

    /// A worker silent for longer than this is expired
    #[serde(default = "default_heart_beat_expiration")]
    pub heart_beat_expiration_secs: u64,

    /// Period of the expiry sweep
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Timeout for worker status probes
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            dispatch_method: DispatchMethod::default(),
            heart_beat_expiration_secs: default_heart_beat_expiration(),
            sweep_interval_secs: default_sweep_interval(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

/// Worker-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Address the controller and clients use to reach this worker
    pub worker_address: String,

    /// Controller base URL
    pub controller_address: String,

    /// Model names served by this worker
    pub model_names: Vec<String>,

    /// Size of the admission gate
    #[serde(default = "default_limit_worker_concurrency")]
    pub limit_worker_concurrency: usize,

    /// Skip registration and heartbeats
    #[serde(default)]
    pub no_register: bool,

    /// Heartbeat period
    #[serde(default = "default_heart_beat_interval")]
    pub heart_beat_interval_secs: u64,

    /// Timeout for calls to the controller
    #[serde(default = "default_controller_timeout")]
    pub controller_timeout_secs: u64,

    /// Cap on time spent waiting for a concurrency slot (unbounded if unset)
    #[serde(default)]
    pub max_queue_wait_ms: Option<u64>,

    /// Relative capacity weight reported to the controller
    #[serde(default = "default_speed")]
    pub speed: f64,

    /// Opaque conversation template descriptor
    #[serde(default)]
    pub conv_template: Option<serde_json::Value>,

    /// Generation backend
    pub backend: BackendConfig,
}

/// Backend engine selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Sequential decode on blocking threads
    Local {
        #[serde(default)]
        model: MockModelConfig,
    },

    /// Continuous-batching engine loop
    Batched {
        #[serde(default)]
        model: MockModelConfig,
        batching: BatchingConfig,
    },

    /// Remote text-generation HTTP API
    Remote {
        api_base: String,
        model_path: String,
        #[serde(default)]
        token: Option<String>,
        #[serde(default = "default_context_length")]
        context_length: usize,
        #[serde(default)]
        seed: Option<u64>,
    },
}

/// Settings of the built-in step model used when no weights are loaded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockModelConfig {
    #[serde(default = "default_context_length")]
    pub context_length: usize,

    /// Fixed reply; when unset the last prompt line is echoed back
    #[serde(default)]
    pub reply: Option<String>,

    /// Simulated latency per decode step
    #[serde(default)]
    pub step_delay_ms: u64,
}

impl Default for MockModelConfig {
    fn default() -> Self {
        Self {
            context_length: default_context_length(),
            reply: None,
            step_delay_ms: 0,
        }
    }
}

/// Batching configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchingConfig {
    /// Maximum batch size
    pub max_batch_size: usize,

    /// Batching window in milliseconds
    pub batching_window_ms: u64,

    /// Maximum queue size
    pub max_queue_size: usize,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Serve Prometheus metrics at /metrics
    #[serde(default = "default_metrics")]
    pub enable_metrics: bool,

    /// Emit JSON log lines
    #[serde(default)]
    pub structured_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            enable_metrics: default_metrics(),
            structured_logging: false,
        }
    }
}

/// Default value functions
fn default_heart_beat_expiration() -> u64 {
    90
}

fn default_sweep_interval() -> u64 {
    45
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_limit_worker_concurrency() -> usize {
    5
}

fn default_heart_beat_interval() -> u64 {
    45
}

fn default_controller_timeout() -> u64 {
    5
}

fn default_speed() -> f64 {
    1.0
}

fn default_context_length() -> usize {
    2048
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics() -> bool {
    true
}

impl ChatFleetConfig {
    /// Load configuration from a YAML file, applying `CHATFLEET__*` overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config: ChatFleetConfig = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Yaml))
            .add_source(
                config::Environment::with_prefix("CHATFLEET")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| {
                ChatFleetError::Config(format!(
                    "Failed to load config file {}: {}",
                    path.display(),
                    e
                ))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string without environment overrides
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: ChatFleetConfig = serde_yaml::from_str(content)
            .map_err(|e| ChatFleetError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        match self.mode.as_str() {
            "worker" => {
                let worker = self
                    .worker
                    .as_ref()
                    .ok_or_else(|| ChatFleetError::config("Worker config required for worker mode"))?;
                worker.validate()?;
            }
            "controller" => self.controller_or_default().validate()?,
            _ => {
                return Err(ChatFleetError::config(format!("Invalid mode: {}", self.mode)));
            }
        }
        Ok(())
    }

    /// Controller section, falling back to defaults
    pub fn controller_or_default(&self) -> ControllerConfig {
        self.controller.clone().unwrap_or_default()
    }

    /// Observability section, falling back to defaults
    pub fn observability_or_default(&self) -> ObservabilityConfig {
        self.observability.clone().unwrap_or_default()
    }

    /// Address the HTTP server binds to
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

impl ControllerConfig {
    /// Periods and timeouts must be non-zero; a zero sweep period cannot drive an interval
    pub fn validate(&self) -> Result<()> {
        if self.heart_beat_expiration_secs == 0 {
            return Err(ChatFleetError::config("heart_beat_expiration_secs must be positive"));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ChatFleetError::config("sweep_interval_secs must be positive"));
        }
        if self.probe_timeout_secs == 0 {
            return Err(ChatFleetError::config("probe_timeout_secs must be positive"));
        }
        Ok(())
    }

    pub fn heart_beat_expiration(&self) -> Duration {
        Duration::from_secs(self.heart_beat_expiration_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

impl WorkerConfig {
    /// Validate worker configuration
    pub fn validate(&self) -> Result<()> {
        if self.model_names.is_empty() {
            return Err(ChatFleetError::config("Worker must serve at least one model name"));
        }
        if self.limit_worker_concurrency == 0 {
            return Err(ChatFleetError::config("limit_worker_concurrency must be positive"));
        }
        if self.speed <= 0.0 {
            return Err(ChatFleetError::config("speed must be positive"));
        }
        if self.heart_beat_interval_secs == 0 {
            return Err(ChatFleetError::config("heart_beat_interval_secs must be positive"));
        }
        if self.controller_timeout_secs == 0 {
            return Err(ChatFleetError::config("controller_timeout_secs must be positive"));
        }
        if let BackendConfig::Batched { batching, .. } = &self.backend {
            if batching.max_batch_size == 0 || batching.max_queue_size == 0 {
                return Err(ChatFleetError::config("Batching sizes must be positive"));
            }
        }
        Ok(())
    }

    pub fn heart_beat_interval(&self) -> Duration {
        Duration::from_secs(self.heart_beat_interval_secs)
    }

    pub fn controller_timeout(&self) -> Duration {
        Duration::from_secs(self.controller_timeout_secs)
    }

    pub fn max_queue_wait(&self) -> Option<Duration> {
        self.max_queue_wait_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const WORKER_YAML: &str = r#"
mode: worker
bind_address: 0.0.0.0
port: 21002
worker:
  worker_address: http://localhost:21002
  controller_address: http://localhost:21001
  model_names: [vicuna-7b, vicuna]
  limit_worker_concurrency: 2
  backend:
    kind: batched
    batching:
      max_batch_size: 8
      batching_window_ms: 5
      max_queue_size: 64
"#;

    #[test]
    fn test_worker_config_from_yaml() {
        let config = ChatFleetConfig::from_yaml_str(WORKER_YAML).unwrap();
        let worker = config.worker.as_ref().unwrap();

        assert_eq!(worker.model_names, vec!["vicuna-7b", "vicuna"]);
        assert_eq!(worker.limit_worker_concurrency, 2);
        assert_eq!(worker.heart_beat_interval(), Duration::from_secs(45));
        assert!(worker.max_queue_wait().is_none());
        match &worker.backend {
            BackendConfig::Batched { model, batching } => {
                assert_eq!(batching.max_batch_size, 8);
                assert_eq!(model.context_length, 2048);
            }
            other => panic!("unexpected backend: {:?}", other),
        }
    }

    #[test]
    fn test_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"mode: controller\nbind_address: 127.0.0.1\nport: 21001\ncontroller:\n  dispatch_method: lottery\n").unwrap();

        let config = ChatFleetConfig::from_file(file.path()).unwrap();
        let controller = config.controller_or_default();

        assert_eq!(config.listen_address(), "127.0.0.1:21001");
        assert_eq!(controller.dispatch_method, DispatchMethod::Lottery);
        assert_eq!(controller.heart_beat_expiration(), Duration::from_secs(90));
        assert_eq!(controller.sweep_interval(), Duration::from_secs(45));
    }

    #[test]
    fn test_config_validation_missing_worker() {
        let config = ChatFleetConfig {
            mode: "worker".to_string(),
            bind_address: "0.0.0.0".to_string(),
            port: 21002,
            controller: None,
            worker: None,
            observability: None,
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_rejects_unknown_mode() {
        let yaml = "mode: gateway\nbind_address: 0.0.0.0\nport: 1\n";

        assert!(ChatFleetConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_worker_without_models_is_invalid() {
        let yaml = WORKER_YAML.replace("[vicuna-7b, vicuna]", "[]");

        assert!(ChatFleetConfig::from_yaml_str(&yaml).is_err());
    }

    #[test]
    fn test_zero_controller_periods_are_invalid() {
        for field in ["heart_beat_expiration_secs", "sweep_interval_secs", "probe_timeout_secs"] {
            let yaml = format!(
                "mode: controller\nbind_address: 0.0.0.0\nport: 21001\ncontroller:\n  {}: 0\n",
                field
            );

            let err = ChatFleetConfig::from_yaml_str(&yaml).unwrap_err();
            assert!(err.to_string().contains(field), "{}", err);
        }
    }

    #[test]
    fn test_controller_defaults_are_valid() {
        let yaml = "mode: controller\nbind_address: 0.0.0.0\nport: 21001\n";

        assert!(ChatFleetConfig::from_yaml_str(yaml).is_ok());
        assert!(ControllerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_worker_periods_are_invalid() {
        for field in ["heart_beat_interval_secs", "controller_timeout_secs"] {
            let yaml = WORKER_YAML.replace(
                "  limit_worker_concurrency: 2\n",
                &format!("  limit_worker_concurrency: 2\n  {}: 0\n", field),
            );

            let err = ChatFleetConfig::from_yaml_str(&yaml).unwrap_err();
            assert!(err.to_string().contains(field), "{}", err);
        }
    }
}
