//! ChatFleet Worker
//!
//! Hosts one generation backend behind a concurrency-limited streaming
//! interface, and keeps the controller informed of its liveness and load.

pub mod admission;
pub mod backend;
pub(crate) mod batching;
pub mod heartbeat;
pub mod model;
pub mod server;
pub mod stop;
pub mod worker;

pub use admission::AdmissionGate;
pub use backend::{build_backend, BackendOutput, BackendRequest, GenerationBackend};
pub use heartbeat::HeartbeatSender;
pub use model::{EchoModel, SamplingParams, StepModel};
pub use server::{create_router, serve};
pub use worker::ModelWorker;
