//! ChatFleet client
//!
//! HTTP clients for the controller and workers, and the client-side
//! reconstruction of streamed replies.

pub mod chat;
pub mod context;
pub mod controller_client;
pub mod conversation;
pub mod decoder;
pub mod worker_client;

pub use chat::{display_error, ChatParams, ChatSession};
pub use context::{check_context_length, precheck};
pub use controller_client::ControllerClient;
pub use conversation::Conversation;
pub use decoder::StreamDecoder;
pub use worker_client::{FrameStream, WorkerClient};
