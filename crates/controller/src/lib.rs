//! ChatFleet Controller
//!
//! Registry of model workers, liveness tracking and dispatch of model names
//! to worker addresses.

pub mod controller;
pub mod probe;
pub mod registry;
pub mod server;

pub use controller::Controller;
pub use probe::{HttpStatusProbe, StatusProbe};
pub use registry::{WorkerRecord, WorkerRegistry};
pub use server::{create_router, serve};
