//! Generation backends
//!
//! The worker core only sees `Arc<dyn GenerationBackend>`. Three engines are
//! provided: sequential decode on blocking threads, a continuous-batching
//! engine loop, and a remote text-generation API.

pub mod batched;
pub mod local;
pub mod remote;

use crate::model::{EchoModel, SamplingParams, StepModel, TokenId};
use crate::stop::{StopCheck, StopMatcher};
use async_trait::async_trait;
use chatfleet_common::config::BackendConfig;
use chatfleet_common::error::{ChatFleetError, Result};
use chatfleet_proto::{EmbeddingsResponse, FinishReason, Usage};
use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;

pub use batched::BatchedAsyncBackend;
pub use local::LocalSequentialBackend;
pub use remote::RemoteApiBackend;

/// One generation call as seen by a backend
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub request_id: String,
    pub prompt: String,
    pub params: SamplingParams,
    pub stop: Vec<String>,
    pub stop_token_ids: Vec<TokenId>,
}

/// Generated text so far, without the prompt
#[derive(Debug, Clone, PartialEq)]
pub struct BackendOutput {
    pub text: String,
    pub finish_reason: Option<FinishReason>,
    pub usage: Option<Usage>,
}

impl BackendOutput {
    pub fn partial(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            finish_reason: None,
            usage: None,
        }
    }

    pub fn finished(text: impl Into<String>, reason: FinishReason, usage: Option<Usage>) -> Self {
        Self {
            text: text.into(),
            finish_reason: Some(reason),
            usage,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finish_reason.is_some()
    }
}

pub type OutputStream = BoxStream<'static, Result<BackendOutput>>;

#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Start generating; the returned stream ends after a finished output
    async fn generate_stream(&self, request: BackendRequest) -> Result<OutputStream>;

    /// Token cost of `prompt`
    async fn count_token(&self, prompt: &str) -> Result<usize>;

    fn context_length(&self) -> usize;

    async fn get_embeddings(&self, _input: &[String]) -> Result<EmbeddingsResponse> {
        Err(ChatFleetError::unsupported("embeddings are not supported by this backend"))
    }

    /// Best-effort cancellation of a running request
    async fn abort(&self, _request_id: &str) -> Result<()> {
        Ok(())
    }

    fn supports_abort(&self) -> bool {
        false
    }
}

/// Build the backend named by the worker configuration
pub fn build_backend(config: &BackendConfig) -> Result<Arc<dyn GenerationBackend>> {
    let backend: Arc<dyn GenerationBackend> = match config {
        BackendConfig::Local { model } => Arc::new(LocalSequentialBackend::new(
            Arc::new(EchoModel::new(model)),
            Duration::from_millis(model.step_delay_ms),
        )),
        BackendConfig::Batched { model, batching } => Arc::new(BatchedAsyncBackend::new(
            Arc::new(EchoModel::new(model)),
            batching.clone(),
            Duration::from_millis(model.step_delay_ms),
        )),
        BackendConfig::Remote {
            api_base,
            model_path,
            token,
            context_length,
            seed,
        } => Arc::new(RemoteApiBackend::new(
            api_base.clone(),
            model_path.clone(),
            token.clone(),
            *context_length,
            *seed,
        )?),
    };
    Ok(backend)
}

/// Decode state of one request driven by a step model.
///
/// Applies stop token ids (EOS included), stop strings with holdback of
/// partial matches, and the max_new_tokens limit.
pub(crate) struct Sequence {
    pub(crate) request_id: String,
    prompt: Vec<TokenId>,
    generated: Vec<TokenId>,
    params: SamplingParams,
    stop: StopMatcher,
    stop_token_ids: Vec<TokenId>,
    finished: bool,
}

impl Sequence {
    pub(crate) fn new(model: &dyn StepModel, request: BackendRequest) -> Self {
        let mut stop_token_ids = request.stop_token_ids;
        let eos = model.eos_token_id();
        if !stop_token_ids.contains(&eos) {
            stop_token_ids.push(eos);
        }

        Self {
            prompt: model.encode(&request.prompt),
            request_id: request.request_id,
            generated: Vec::new(),
            params: request.params,
            stop: StopMatcher::new(request.stop),
            stop_token_ids,
            finished: false,
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished
    }

    fn usage(&self) -> Usage {
        Usage {
            prompt_tokens: self.prompt.len(),
            completion_tokens: self.generated.len(),
            total_tokens: self.prompt.len() + self.generated.len(),
        }
    }

    fn finish(&mut self, text: String, reason: FinishReason) -> BackendOutput {
        self.finished = true;
        BackendOutput::finished(text, reason, Some(self.usage()))
    }

    /// Run one decode step; `None` means the new text is held back
    pub(crate) fn step(&mut self, model: &dyn StepModel) -> Result<Option<BackendOutput>> {
        if self.finished {
            return Ok(None);
        }
        if self.generated.len() >= self.params.max_new_tokens as usize {
            let text = model.decode(&self.generated);
            return Ok(Some(self.finish(text, FinishReason::Length)));
        }

        let token = model.next_token(&self.prompt, &self.generated, &self.params)?;
        if self.stop_token_ids.contains(&token) {
            let text = model.decode(&self.generated);
            return Ok(Some(self.finish(text, FinishReason::Stop)));
        }

        self.generated.push(token);
        let text = model.decode(&self.generated);
        let at_limit = self.generated.len() >= self.params.max_new_tokens as usize;

        let output = match self.stop.check(&text) {
            StopCheck::Stopped(trimmed) => Some(self.finish(trimmed, FinishReason::Stop)),
            _ if at_limit => Some(self.finish(text, FinishReason::Length)),
            StopCheck::Hold => None,
            StopCheck::Emit => Some(BackendOutput::partial(text)),
        };
        Ok(output)
    }
}
