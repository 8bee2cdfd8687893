//! Model worker core
//!
//! Turns a backend's output stream into the wire frame sequence: admission
//! through the gate, echo of the prompt, conversion of failures into one
//! terminal error frame, and release of the slot on every exit path.

use crate::admission::AdmissionGate;
use crate::backend::{BackendRequest, GenerationBackend, OutputStream};
use crate::model::SamplingParams;
use chatfleet_common::config::WorkerConfig;
use chatfleet_common::error::{ChatFleetError, Result};
use chatfleet_common::METRICS;
use chatfleet_proto::{
    ConvTemplateResponse, CountTokenRequest, CountTokenResponse, EmbeddingsRequest,
    EmbeddingsResponse, ErrorCode, FinishReason, GenerationFrame, GenerationRequest,
    ModelDetailsResponse, WorkerStatus, SERVER_ERROR_MSG,
};
use futures::future;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub type FrameStream = BoxStream<'static, GenerationFrame>;

pub struct ModelWorker {
    worker_address: String,
    model_names: Vec<String>,
    speed: f64,
    conv_template: Option<serde_json::Value>,
    backend: Arc<dyn GenerationBackend>,
    gate: Arc<AdmissionGate>,
}

/// An admitted call. Dropping it before `complete` counts as an abort and
/// asks abort-capable backends to stop the request.
struct InFlight {
    _permit: OwnedSemaphorePermit,
    backend: Arc<dyn GenerationBackend>,
    request_id: String,
    start: Instant,
    completed: bool,
}

impl InFlight {
    fn new(permit: OwnedSemaphorePermit, backend: Arc<dyn GenerationBackend>, request_id: String) -> Self {
        METRICS.worker.active_requests.inc();
        Self {
            _permit: permit,
            backend,
            request_id,
            start: Instant::now(),
            completed: false,
        }
    }

    fn complete(&mut self, failed: bool) {
        self.completed = true;
        if failed {
            METRICS.worker.requests_failed.inc();
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        METRICS.worker.active_requests.dec();
        METRICS.worker.request_duration.observe(self.start.elapsed().as_secs_f64());
        if self.completed {
            return;
        }

        METRICS.worker.requests_aborted.inc();
        info!("Request {} abandoned before completion", self.request_id);
        if !self.backend.supports_abort() {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let backend = self.backend.clone();
            let request_id = std::mem::take(&mut self.request_id);
            handle.spawn(async move {
                if let Err(e) = backend.abort(&request_id).await {
                    warn!("Abort of {} failed: {}", request_id, e);
                }
            });
        }
    }
}

/// Terminal frame for a failed call
fn failure_frame(e: &ChatFleetError) -> GenerationFrame {
    let code = match e {
        ChatFleetError::AdmissionExhausted(_)
        | ChatFleetError::ContextOverflow(_)
        | ChatFleetError::InvalidModel(_)
        | ChatFleetError::InvalidInput(_) => e.error_code(),
        _ => ErrorCode::InternalError,
    };
    GenerationFrame::failure(code, format!("{}\n\n({})", SERVER_ERROR_MSG, e))
}

fn error_stream(e: ChatFleetError) -> FrameStream {
    error!("Generation failed: {}", e);
    METRICS.worker.requests_failed.inc();
    stream::once(future::ready(failure_frame(&e))).boxed()
}

struct FrameState {
    outputs: OutputStream,
    guard: InFlight,
    prefix: String,
    last_text: String,
}

fn frames(outputs: OutputStream, guard: InFlight, prefix: String) -> FrameStream {
    let state = FrameState {
        outputs,
        guard,
        last_text: prefix.clone(),
        prefix,
    };

    stream::unfold(Some(state), |state| async move {
        let mut state = state?;
        match state.outputs.next().await {
            Some(Ok(output)) => {
                let text = format!("{}{}", state.prefix, output.text);
                match output.finish_reason {
                    Some(reason) => {
                        state.guard.complete(false);
                        let mut frame = GenerationFrame::finished(text, reason);
                        frame.usage = output.usage;
                        Some((frame, None))
                    }
                    None => {
                        state.last_text.clone_from(&text);
                        Some((GenerationFrame::partial(text), Some(state)))
                    }
                }
            }
            Some(Err(e)) => {
                error!("Backend failed for {}: {}", state.guard.request_id, e);
                state.guard.complete(true);
                Some((failure_frame(&e), None))
            }
            None => {
                // backend ended without marking the last output
                state.guard.complete(false);
                let text = std::mem::take(&mut state.last_text);
                Some((GenerationFrame::finished(text, FinishReason::Stop), None))
            }
        }
    })
    .boxed()
}

impl ModelWorker {
    pub fn new(config: &WorkerConfig, backend: Arc<dyn GenerationBackend>) -> Self {
        Self {
            worker_address: config.worker_address.clone(),
            model_names: config.model_names.clone(),
            speed: config.speed,
            conv_template: config.conv_template.clone(),
            backend,
            gate: Arc::new(AdmissionGate::new(
                config.limit_worker_concurrency,
                config.max_queue_wait(),
            )),
        }
    }

    pub fn worker_address(&self) -> &str {
        &self.worker_address
    }

    pub fn model_names(&self) -> &[String] {
        &self.model_names
    }

    /// Admitted plus waiting calls
    pub fn queue_length(&self) -> usize {
        self.gate.queue_length()
    }

    pub fn get_status(&self) -> WorkerStatus {
        WorkerStatus {
            model_names: self.model_names.clone(),
            speed: self.speed,
            queue_length: self.queue_length(),
        }
    }

    fn check_model(&self, model: Option<&str>) -> Result<()> {
        match model {
            Some(name) if !self.model_names.iter().any(|m| m == name) => Err(
                ChatFleetError::InvalidModel(format!("model {} is not served by this worker", name)),
            ),
            _ => Ok(()),
        }
    }

    /// Lazily admit and run one generation.
    ///
    /// Every frame carries the full text so far. The stream always ends with
    /// exactly one terminal frame unless the consumer drops it first.
    pub fn generate_stream(&self, request: GenerationRequest) -> FrameStream {
        METRICS.worker.requests_total.inc();
        if let Err(e) = self.check_model(request.model.as_deref()) {
            return error_stream(e);
        }

        let request_id = Uuid::new_v4().to_string();
        let prefix = if request.echo {
            request.prompt.clone()
        } else {
            String::new()
        };
        let backend_request = BackendRequest {
            request_id: request_id.clone(),
            params: SamplingParams::normalized(
                request.temperature,
                request.top_p,
                request.max_new_tokens,
            ),
            stop: request.stop_strings(),
            stop_token_ids: request.stop_token_ids,
            prompt: request.prompt,
        };
        debug!("Request {} queued with {:?}", request_id, backend_request.params);

        let gate = self.gate.clone();
        let backend = self.backend.clone();
        stream::once(async move {
            let permit = match gate.acquire().await {
                Ok(permit) => permit,
                Err(e) => return error_stream(e),
            };
            let mut guard = InFlight::new(permit, backend.clone(), request_id);

            match backend.generate_stream(backend_request).await {
                Ok(outputs) => frames(outputs, guard, prefix),
                Err(e) => {
                    guard.complete(false);
                    error_stream(e)
                }
            }
        })
        .flatten()
        .boxed()
    }

    /// Run a generation to completion and return its terminal frame
    pub async fn generate(&self, request: GenerationRequest) -> GenerationFrame {
        let mut stream = self.generate_stream(request);
        let mut last = None;
        while let Some(frame) = stream.next().await {
            last = Some(frame);
        }
        last.unwrap_or_else(|| {
            GenerationFrame::failure(ErrorCode::InternalError, SERVER_ERROR_MSG.to_string())
        })
    }

    pub async fn count_token(&self, request: &CountTokenRequest) -> Result<CountTokenResponse> {
        self.check_model(request.model.as_deref())?;
        let count = self.backend.count_token(&request.prompt).await?;
        Ok(CountTokenResponse {
            count,
            error_code: ErrorCode::Ok.as_i32(),
        })
    }

    pub async fn get_embeddings(&self, request: &EmbeddingsRequest) -> Result<EmbeddingsResponse> {
        self.check_model(request.model.as_deref())?;
        let _permit = self.gate.acquire().await?;
        self.backend.get_embeddings(&request.input).await
    }

    pub fn model_details(&self) -> ModelDetailsResponse {
        ModelDetailsResponse {
            context_length: self.backend.context_length(),
        }
    }

    pub fn conv_template(&self) -> ConvTemplateResponse {
        ConvTemplateResponse {
            conv: self.conv_template.clone().unwrap_or(serde_json::Value::Null),
        }
    }
}
