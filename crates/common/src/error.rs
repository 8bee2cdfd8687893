//! Common error types for ChatFleet
//!
//! This module defines all error types used across the ChatFleet system.
//! Every error maps to an HTTP status and to a wire error code so handlers can
//! answer with a `{error_code, text}` body instead of dropping the connection.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chatfleet_proto::{ErrorBody, ErrorCode};
use thiserror::Error;

/// Main error type for ChatFleet
#[derive(Error, Debug)]
pub enum ChatFleetError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Connection errors
    #[error("Connection error: {0}")]
    Connection(String),

    /// Dispatch found no live worker for a model
    #[error("No worker available: {0}")]
    NoWorkerAvailable(String),

    /// Status probe or heartbeat failed
    #[error("Worker unreachable: {0}")]
    WorkerUnreachable(String),

    /// Waited too long for a concurrency slot
    #[error("Admission exhausted: {0}")]
    AdmissionExhausted(String),

    /// Backend engine fault
    #[error("Backend generation error: {0}")]
    BackendGeneration(String),

    /// Prompt does not fit in the model context
    #[error("Context overflow: {0}")]
    ContextOverflow(String),

    /// Operation not offered by this backend
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Requested model is not hosted here
    #[error("Invalid model: {0}")]
    InvalidModel(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A worker answered with an error frame
    #[error("Generation failed (error_code: {code}): {text}")]
    Generation { code: i32, text: String },

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ChatFleetError {
    /// HTTP status used when the error reaches a handler boundary
    pub fn status_code(&self) -> StatusCode {
        match self {
            ChatFleetError::Config(_)
            | ChatFleetError::Io(_)
            | ChatFleetError::Serialization(_)
            | ChatFleetError::BackendGeneration(_)
            | ChatFleetError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ChatFleetError::Http(_)
            | ChatFleetError::Connection(_)
            | ChatFleetError::WorkerUnreachable(_)
            | ChatFleetError::Generation { .. } => StatusCode::BAD_GATEWAY,
            ChatFleetError::NoWorkerAvailable(_) | ChatFleetError::AdmissionExhausted(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ChatFleetError::ContextOverflow(_) | ChatFleetError::InvalidInput(_) => {
                StatusCode::BAD_REQUEST
            }
            ChatFleetError::InvalidModel(_) => StatusCode::NOT_FOUND,
            ChatFleetError::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
        }
    }

    /// Wire error code carried in frames and error bodies
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ChatFleetError::NoWorkerAvailable(_) => ErrorCode::ControllerNoWorker,
            ChatFleetError::WorkerUnreachable(_) => ErrorCode::ControllerWorkerTimeout,
            ChatFleetError::Http(_) | ChatFleetError::Connection(_) => {
                ErrorCode::GradioRequestError
            }
            ChatFleetError::AdmissionExhausted(_) => ErrorCode::EngineOverloaded,
            ChatFleetError::Generation { code, .. } => {
                ErrorCode::from_i32(*code).unwrap_or(ErrorCode::InternalError)
            }
            ChatFleetError::ContextOverflow(_) => ErrorCode::ContextOverflow,
            ChatFleetError::InvalidModel(_) => ErrorCode::InvalidModel,
            ChatFleetError::InvalidInput(_) => ErrorCode::ValidationTypeError,
            _ => ErrorCode::InternalError,
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        ChatFleetError::Config(msg.into())
    }

    /// Create a worker unreachable error
    pub fn worker_unreachable(msg: impl Into<String>) -> Self {
        ChatFleetError::WorkerUnreachable(msg.into())
    }

    /// Create an admission exhausted error
    pub fn admission_exhausted(msg: impl Into<String>) -> Self {
        ChatFleetError::AdmissionExhausted(msg.into())
    }

    /// Create a backend generation error
    pub fn backend(msg: impl Into<String>) -> Self {
        ChatFleetError::BackendGeneration(msg.into())
    }

    /// Create an unsupported operation error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        ChatFleetError::Unsupported(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        ChatFleetError::InvalidInput(msg.into())
    }
}

impl IntoResponse for ChatFleetError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error_code: self.error_code().as_i32(),
            text: self.to_string(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}

/// Result type alias for ChatFleet operations
pub type Result<T> = std::result::Result<T, ChatFleetError>;
