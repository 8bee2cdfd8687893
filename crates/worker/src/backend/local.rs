//! Sequential decode on the blocking thread pool

use super::{BackendOutput, BackendRequest, GenerationBackend, OutputStream, Sequence};
use crate::model::StepModel;
use async_trait::async_trait;
use chatfleet_common::error::Result;
use chatfleet_proto::EmbeddingsResponse;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error};

/// Outputs buffered between the decode thread and the response stream
const OUTPUT_BUFFER: usize = 16;

/// Runs each request's decode loop on its own `spawn_blocking` thread.
///
/// The loop ends as soon as the consumer drops the stream, so no explicit
/// abort is needed.
pub struct LocalSequentialBackend {
    model: Arc<dyn StepModel>,
    step_delay: Duration,
}

impl LocalSequentialBackend {
    pub fn new(model: Arc<dyn StepModel>, step_delay: Duration) -> Self {
        Self { model, step_delay }
    }
}

fn decode_loop(
    model: Arc<dyn StepModel>,
    mut sequence: Sequence,
    step_delay: Duration,
    tx: mpsc::Sender<Result<BackendOutput>>,
) {
    while !sequence.is_finished() {
        if !step_delay.is_zero() {
            std::thread::sleep(step_delay);
        }

        let output = match sequence.step(model.as_ref()) {
            Ok(Some(output)) => output,
            Ok(None) => continue,
            Err(e) => {
                error!("Decode failed for {}: {}", sequence.request_id, e);
                let _ = tx.blocking_send(Err(e));
                return;
            }
        };

        if tx.blocking_send(Ok(output)).is_err() {
            debug!("Consumer of {} went away, stopping decode", sequence.request_id);
            return;
        }
    }
}

#[async_trait]
impl GenerationBackend for LocalSequentialBackend {
    async fn generate_stream(&self, request: BackendRequest) -> Result<OutputStream> {
        let sequence = Sequence::new(self.model.as_ref(), request);
        let (tx, rx) = mpsc::channel(OUTPUT_BUFFER);

        let model = self.model.clone();
        let step_delay = self.step_delay;
        tokio::task::spawn_blocking(move || decode_loop(model, sequence, step_delay, tx));

        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn count_token(&self, prompt: &str) -> Result<usize> {
        Ok(self.model.encode(prompt).len())
    }

    fn context_length(&self) -> usize {
        self.model.context_length()
    }

    async fn get_embeddings(&self, input: &[String]) -> Result<EmbeddingsResponse> {
        let mut embedding = Vec::with_capacity(input.len());
        let mut token_num = 0;
        for text in input {
            embedding.push(self.model.embed(text)?);
            token_num += self.model.encode(text).len();
        }
        Ok(EmbeddingsResponse {
            embedding,
            token_num,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::tests::request;
    use crate::model::EchoModel;
    use chatfleet_common::config::MockModelConfig;
    use chatfleet_proto::FinishReason;

    fn backend(reply: &str, step_delay: Duration) -> LocalSequentialBackend {
        let model = EchoModel::new(&MockModelConfig {
            reply: Some(reply.to_string()),
            ..Default::default()
        });
        LocalSequentialBackend::new(Arc::new(model), step_delay)
    }

    #[tokio::test]
    async fn test_local_stream_ends_with_finished_output() {
        let backend = backend("hello", Duration::ZERO);

        let outputs: Vec<BackendOutput> = backend
            .generate_stream(request("hi", 32, &[]))
            .await
            .unwrap()
            .map(|o| o.unwrap())
            .collect()
            .await;

        let last = outputs.last().unwrap();
        assert_eq!(last.text, "hello");
        assert_eq!(last.finish_reason, Some(FinishReason::Stop));
        assert!(outputs[..outputs.len() - 1].iter().all(|o| !o.is_finished()));
    }

    #[tokio::test]
    async fn test_local_stream_stops_when_dropped() {
        let backend = backend(&"x".repeat(1000), Duration::from_millis(1));

        let mut stream = backend.generate_stream(request("hi", 1000, &[])).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        drop(stream);

        assert_eq!(first.text, "x");
    }

    #[tokio::test]
    async fn test_local_count_and_embeddings() {
        let backend = backend("ok", Duration::ZERO);

        assert_eq!(backend.count_token("héllo").await.unwrap(), 5);
        let response = backend
            .get_embeddings(&["a".to_string(), "bc".to_string()])
            .await
            .unwrap();
        assert_eq!(response.embedding.len(), 2);
        assert_eq!(response.token_num, 3);
    }
}
