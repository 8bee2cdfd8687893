//! Step models driven by the local and batched backends
//!
//! A step model maps text to token ids and produces one token per decode
//! step. Real weight loading lives outside this crate; `EchoModel` is the
//! built-in deterministic model used when a worker runs without weights.

use chatfleet_common::config::MockModelConfig;
use chatfleet_common::error::{ChatFleetError, Result};

/// Token identifier
pub type TokenId = u32;

/// Sampling parameters after normalisation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
    pub max_new_tokens: u32,
}

/// Smallest top_p handed to a sampler
pub const MIN_TOP_P: f32 = 1e-5;

/// Temperatures at or below this are treated as greedy decoding
pub const GREEDY_TEMPERATURE: f32 = 1e-5;

impl SamplingParams {
    /// Clamp raw request values into the range samplers accept.
    ///
    /// top_p is kept at or above `MIN_TOP_P`; greedy decoding forces top_p to 1.
    pub fn normalized(temperature: f32, top_p: f32, max_new_tokens: u32) -> Self {
        let mut top_p = top_p.clamp(MIN_TOP_P, 1.0);
        if temperature <= GREEDY_TEMPERATURE {
            top_p = 1.0;
        }
        Self {
            temperature: temperature.max(0.0),
            top_p,
            max_new_tokens,
        }
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature <= GREEDY_TEMPERATURE
    }
}

/// A model that decodes one token at a time
pub trait StepModel: Send + Sync {
    fn encode(&self, text: &str) -> Vec<TokenId>;

    fn decode(&self, tokens: &[TokenId]) -> String;

    fn eos_token_id(&self) -> TokenId;

    fn context_length(&self) -> usize;

    /// Produce the token following `generated` for the given prompt
    fn next_token(
        &self,
        prompt: &[TokenId],
        generated: &[TokenId],
        params: &SamplingParams,
    ) -> Result<TokenId>;

    /// Sentence embedding of `text`
    fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Err(ChatFleetError::unsupported("this model does not produce embeddings"))
    }
}

/// Character-level model that replies with a fixed text.
///
/// Token ids are Unicode scalar values shifted by one so that id 0 is EOS.
/// Without a configured reply the last non-empty prompt line is echoed back.
#[derive(Debug, Clone)]
pub struct EchoModel {
    reply: Option<Vec<TokenId>>,
    context_length: usize,
}

const EOS_TOKEN_ID: TokenId = 0;
const EMBEDDING_DIM: usize = 32;

impl EchoModel {
    pub fn new(config: &MockModelConfig) -> Self {
        let mut model = Self {
            reply: None,
            context_length: config.context_length,
        };
        model.reply = config.reply.as_deref().map(|reply| model.encode(reply));
        model
    }

    fn reply_for(&self, prompt: &[TokenId]) -> Vec<TokenId> {
        match &self.reply {
            Some(reply) => reply.clone(),
            None => {
                let text = self.decode(prompt);
                let line = text.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
                self.encode(line)
            }
        }
    }
}

impl StepModel for EchoModel {
    fn encode(&self, text: &str) -> Vec<TokenId> {
        text.chars().map(|c| c as TokenId + 1).collect()
    }

    fn decode(&self, tokens: &[TokenId]) -> String {
        tokens
            .iter()
            .filter(|&&t| t != EOS_TOKEN_ID)
            .filter_map(|&t| char::from_u32(t - 1))
            .collect()
    }

    fn eos_token_id(&self) -> TokenId {
        EOS_TOKEN_ID
    }

    fn context_length(&self) -> usize {
        self.context_length
    }

    fn next_token(
        &self,
        prompt: &[TokenId],
        generated: &[TokenId],
        _params: &SamplingParams,
    ) -> Result<TokenId> {
        if prompt.len() + generated.len() >= self.context_length {
            return Err(ChatFleetError::ContextOverflow(format!(
                "sequence of {} tokens exceeds context length {}",
                prompt.len() + generated.len(),
                self.context_length
            )));
        }
        let reply = self.reply_for(prompt);
        Ok(reply.get(generated.len()).copied().unwrap_or(EOS_TOKEN_ID))
    }

    /// L2-normalised character histogram
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut embedding = vec![0.0f32; EMBEDDING_DIM];
        for token in self.encode(text) {
            embedding[token as usize % EMBEDDING_DIM] += 1.0;
        }
        let norm = embedding.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            embedding.iter_mut().for_each(|v| *v /= norm);
        }
        Ok(embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn greedy() -> SamplingParams {
        SamplingParams::normalized(0.0, 0.5, 16)
    }

    #[test]
    fn test_sampling_normalisation() {
        let params = SamplingParams::normalized(0.7, 0.0, 8);
        assert_eq!(params.top_p, MIN_TOP_P);

        let params = greedy();
        assert!(params.is_greedy());
        assert_eq!(params.top_p, 1.0);
    }

    #[test]
    fn test_echo_model_replies_last_line() {
        let model = EchoModel::new(&MockModelConfig::default());
        let prompt = model.encode("USER: hi\nASSISTANT: héllo\n");

        let mut generated = Vec::new();
        loop {
            let token = model.next_token(&prompt, &generated, &greedy()).unwrap();
            if token == model.eos_token_id() {
                break;
            }
            generated.push(token);
        }

        assert_eq!(model.decode(&generated), "ASSISTANT: héllo");
    }

    #[test]
    fn test_echo_model_fixed_reply() {
        let config = MockModelConfig {
            reply: Some("ok".to_string()),
            ..Default::default()
        };
        let model = EchoModel::new(&config);
        let prompt = model.encode("anything");

        assert_eq!(model.next_token(&prompt, &[], &greedy()).unwrap(), 'o' as u32 + 1);
        let generated = model.encode("ok");
        assert_eq!(model.next_token(&prompt, &generated, &greedy()).unwrap(), EOS_TOKEN_ID);
    }

    #[test]
    fn test_echo_model_embedding_is_normalised() {
        let model = EchoModel::new(&MockModelConfig::default());
        let embedding = model.embed("hello world").unwrap();

        let norm: f32 = embedding.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert_eq!(embedding.len(), EMBEDDING_DIM);
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_echo_model_context_overflow() {
        let config = MockModelConfig {
            context_length: 4,
            ..Default::default()
        };
        let model = EchoModel::new(&config);
        let prompt = model.encode("abcd");

        assert!(model.next_token(&prompt, &[], &greedy()).is_err());
    }
}
