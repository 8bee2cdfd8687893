//! Context-length pre-check done before sending a generation

use crate::worker_client::WorkerClient;
use chatfleet_common::error::{ChatFleetError, Result};

/// Fails when the prompt plus the requested completion cannot fit
pub fn check_context_length(prompt_tokens: usize, max_new_tokens: u32, context_length: usize) -> Result<()> {
    let needed = prompt_tokens + max_new_tokens as usize;
    if needed > context_length {
        return Err(ChatFleetError::ContextOverflow(format!(
            "This model's maximum context length is {} tokens. However, you requested {} tokens ({} in the messages, {} in the completion). Please reduce the length of the messages or completion.",
            context_length, needed, prompt_tokens, max_new_tokens
        )));
    }
    Ok(())
}

/// Ask the worker for its token count and context length, then check.
///
/// Workers that cannot count tokens report zero, which always passes.
pub async fn precheck(
    worker: &WorkerClient,
    model: Option<&str>,
    prompt: &str,
    max_new_tokens: u32,
) -> Result<()> {
    let prompt_tokens = worker.count_token(model, prompt).await?;
    let details = worker.model_details(model).await?;
    check_context_length(prompt_tokens, max_new_tokens, details.context_length)
}
