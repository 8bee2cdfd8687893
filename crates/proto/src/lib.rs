//! ChatFleet wire protocol
//!
//! JSON bodies exchanged between clients, the controller and workers, plus the
//! NUL-delimited frame codec used by the streaming generation endpoint.

pub mod codec;

use serde::{Deserialize, Serialize};

pub use codec::{encode_frame, FrameCodecError, NulFrameCodec, FRAME_DELIMITER};

/// Canned message shown to users when dispatch or generation fails.
pub const SERVER_ERROR_MSG: &str =
    "**NETWORK ERROR DUE TO HIGH TRAFFIC. PLEASE REGENERATE OR REFRESH THIS PAGE.**";

/// Numeric error codes carried in frames and error bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    ValidationTypeError = 40001,
    InvalidModel = 40301,
    ParamOutOfRange = 40302,
    ContextOverflow = 40303,
    EngineOverloaded = 42903,
    InternalError = 50001,
    /// Client-side transport failure talking to a worker.
    GradioRequestError = 50003,
    GradioStreamUnknownError = 50004,
    ControllerNoWorker = 50005,
    ControllerWorkerTimeout = 50006,
}

impl ErrorCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(code: i32) -> Option<Self> {
        let code = match code {
            0 => ErrorCode::Ok,
            40001 => ErrorCode::ValidationTypeError,
            40301 => ErrorCode::InvalidModel,
            40302 => ErrorCode::ParamOutOfRange,
            40303 => ErrorCode::ContextOverflow,
            42903 => ErrorCode::EngineOverloaded,
            50001 => ErrorCode::InternalError,
            50003 => ErrorCode::GradioRequestError,
            50004 => ErrorCode::GradioStreamUnknownError,
            50005 => ErrorCode::ControllerNoWorker,
            50006 => ErrorCode::ControllerWorkerTimeout,
            _ => return None,
        };
        Some(code)
    }
}

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

/// Stop strings may be sent as a single string or as a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StopStrings {
    One(String),
    Many(Vec<String>),
}

/// Body of `/worker_generate_stream` and `/worker_generate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Selects a model when the worker hosts several.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    pub prompt: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_top_p")]
    pub top_p: f32,

    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopStrings>,

    #[serde(default)]
    pub stop_token_ids: Vec<u32>,

    #[serde(default = "default_echo")]
    pub echo: bool,

    /// Assigned by the worker when a call is admitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

fn default_temperature() -> f32 {
    1.0
}

fn default_top_p() -> f32 {
    1.0
}

fn default_max_new_tokens() -> u32 {
    256
}

fn default_echo() -> bool {
    true
}

impl GenerationRequest {
    /// Request with default sampling settings.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            model: None,
            prompt: prompt.into(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            max_new_tokens: default_max_new_tokens(),
            stop: None,
            stop_token_ids: Vec::new(),
            echo: default_echo(),
            request_id: None,
        }
    }

    /// Stop strings as a flat list, empty strings removed.
    pub fn stop_strings(&self) -> Vec<String> {
        let list = match &self.stop {
            None => Vec::new(),
            Some(StopStrings::One(s)) => vec![s.clone()],
            Some(StopStrings::Many(v)) => v.clone(),
        };
        list.into_iter().filter(|s| !s.is_empty()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    Stop,
    Length,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

/// One unit of the streaming protocol.
///
/// `text` is always the whole generation so far, never a delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationFrame {
    pub text: String,

    pub error_code: i32,

    #[serde(default)]
    pub finish_reason: Option<FinishReason>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl GenerationFrame {
    /// An intermediate frame.
    pub fn partial(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            error_code: 0,
            finish_reason: None,
            usage: None,
        }
    }

    /// A successful terminal frame.
    pub fn finished(text: impl Into<String>, reason: FinishReason) -> Self {
        Self {
            text: text.into(),
            error_code: 0,
            finish_reason: Some(reason),
            usage: None,
        }
    }

    /// A terminal failure frame. The message is embedded as the text.
    pub fn failure(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            text: message.into(),
            error_code: code.as_i32(),
            finish_reason: None,
            usage: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error_code != 0
    }

    /// Whether no further frames follow this one.
    pub fn is_terminal(&self) -> bool {
        self.is_error() || self.finish_reason.is_some()
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Status reported by a worker's `/worker_get_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub model_names: Vec<String>,

    #[serde(default = "default_speed")]
    pub speed: f64,

    #[serde(default)]
    pub queue_length: usize,
}

fn default_speed() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterWorkerRequest {
    pub worker_name: String,
    pub check_heart_beat: bool,
    #[serde(default)]
    pub worker_status: Option<WorkerStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub worker_name: String,
    pub queue_length: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub exist: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListModelsResponse {
    pub models: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerAddressRequest {
    pub model: String,
}

/// An empty address means no worker is available.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerAddressResponse {
    pub address: String,
}

// ---------------------------------------------------------------------------
// Worker auxiliaries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountTokenRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub prompt: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountTokenResponse {
    pub count: usize,
    pub error_code: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingsRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub input: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingsResponse {
    pub embedding: Vec<Vec<f32>>,
    pub token_num: usize,
}

/// Body for endpoints that only need to know which hosted model is meant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelSelector {
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelDetailsResponse {
    pub context_length: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvTemplateResponse {
    pub conv: serde_json::Value,
}

/// JSON body returned alongside non-2xx HTTP statuses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error_code: i32,
    pub text: String,
}
