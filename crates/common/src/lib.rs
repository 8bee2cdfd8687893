//! ChatFleet common library
//!
//! This crate contains shared code used across ChatFleet components.

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;

// Re-export commonly used types
pub use config::ChatFleetConfig;
pub use error::{ChatFleetError, Result};
pub use metrics::{metrics_router, MetricsRegistry, METRICS};
