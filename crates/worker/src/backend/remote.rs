//! Remote text-generation API backend
//!
//! Streams tokens from a hosted inference endpoint speaking the
//! text-generation-inference protocol (`data:` server-sent events). The
//! endpoint has no tokenizer exposed, so token counts are reported as zero.

use super::{BackendOutput, BackendRequest, GenerationBackend, OutputStream};
use crate::stop::{StopCheck, StopMatcher};
use async_trait::async_trait;
use chatfleet_common::error::{ChatFleetError, Result};
use chatfleet_proto::FinishReason;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use tracing::{debug, info};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct RemoteApiBackend {
    client: reqwest::Client,
    api_base: String,
    model_path: String,
    token: Option<String>,
    context_length: usize,
    seed: Option<u64>,
}

#[derive(Debug, Serialize)]
struct GenerateParameters {
    max_new_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    do_sample: bool,
    stop: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    details: bool,
}

#[derive(Debug, Serialize)]
struct GenerateBody<'a> {
    inputs: &'a str,
    parameters: GenerateParameters,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct StreamToken {
    text: String,
    #[serde(default)]
    special: bool,
}

#[derive(Debug, Deserialize)]
struct StreamDetails {
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    token: Option<StreamToken>,
    details: Option<StreamDetails>,
    error: Option<String>,
}

impl RemoteApiBackend {
    pub fn new(
        api_base: String,
        model_path: String,
        token: Option<String>,
        context_length: usize,
        seed: Option<u64>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        info!("Using remote generation API {}/{}", api_base, model_path);
        Ok(Self {
            client,
            api_base,
            model_path,
            token,
            context_length,
            seed,
        })
    }

    fn url(&self) -> String {
        format!("{}/{}", self.api_base.trim_end_matches('/'), self.model_path)
    }

    fn parameters(&self, request: &BackendRequest) -> GenerateParameters {
        let params = &request.params;
        let greedy = params.is_greedy();
        // the API rejects top_p == 1.0
        let top_p = if params.top_p >= 1.0 { 0.9999999 } else { params.top_p };

        GenerateParameters {
            max_new_tokens: params.max_new_tokens,
            temperature: (!greedy).then_some(params.temperature),
            top_p: (!greedy).then_some(top_p),
            do_sample: !greedy,
            stop: request.stop.clone(),
            seed: self.seed,
            details: true,
        }
    }
}

fn finish_reason(details: Option<&StreamDetails>) -> Option<FinishReason> {
    match details?.finish_reason.as_deref()? {
        "length" => Some(FinishReason::Length),
        _ => Some(FinishReason::Stop),
    }
}

/// Turn `data:` lines into outputs, applying stop strings locally
fn outputs_from_lines<S>(lines: S, stop: StopMatcher) -> OutputStream
where
    S: futures::Stream<Item = Result<String>> + Send + Unpin + 'static,
{
    stream::unfold(Some((lines, String::new(), stop)), |state| async move {
        let (mut lines, mut text, stop) = state?;
        loop {
            let line = match lines.next().await? {
                Ok(line) => line,
                Err(e) => return Some((Err(e), None)),
            };
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };

            let event: StreamEvent = match serde_json::from_str(data.trim()) {
                Ok(event) => event,
                Err(e) => return Some((Err(e.into()), None)),
            };
            if let Some(error) = event.error {
                return Some((Err(ChatFleetError::backend(error)), None));
            }

            if let Some(token) = event.token.filter(|t| !t.special) {
                text.push_str(&token.text);
            }
            let reason = finish_reason(event.details.as_ref());

            let output = match stop.check(&text) {
                StopCheck::Stopped(trimmed) => {
                    BackendOutput::finished(trimmed, FinishReason::Stop, None)
                }
                _ if reason.is_some() => BackendOutput {
                    text: text.clone(),
                    finish_reason: reason,
                    usage: None,
                },
                StopCheck::Hold => continue,
                StopCheck::Emit => BackendOutput::partial(text.clone()),
            };

            if output.is_finished() {
                return Some((Ok(output), None));
            }
            return Some((Ok(output), Some((lines, text, stop))));
        }
    })
    .boxed()
}

#[async_trait]
impl GenerationBackend for RemoteApiBackend {
    async fn generate_stream(&self, request: BackendRequest) -> Result<OutputStream> {
        let body = GenerateBody {
            inputs: &request.prompt,
            parameters: self.parameters(&request),
            stream: true,
        };
        debug!("Remote generation {} with {:?}", request.request_id, body.parameters);

        let mut builder = self.client.post(self.url()).json(&body);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        let response = builder.send().await?.error_for_status()?;

        let bytes = response.bytes_stream().map_err(std::io::Error::other);
        let lines = FramedRead::new(StreamReader::new(bytes), LinesCodec::new())
            .map_err(|e| ChatFleetError::backend(format!("malformed event stream: {}", e)));

        Ok(outputs_from_lines(Box::pin(lines), StopMatcher::new(request.stop)))
    }

    async fn count_token(&self, _prompt: &str) -> Result<usize> {
        Ok(0)
    }

    fn context_length(&self) -> usize {
        self.context_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::tests::request;
    use axum::{routing::post, Router};
    use tokio::net::TcpListener;

    async fn serve_events(body: &'static str) -> String {
        let app = Router::new().route("/models/test", post(move || async move { body }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{}", address)
    }

    fn backend(api_base: String) -> RemoteApiBackend {
        RemoteApiBackend::new(api_base, "models/test".to_string(), None, 4096, Some(7)).unwrap()
    }

    async fn collect(stream: OutputStream) -> Vec<Result<BackendOutput>> {
        stream.collect().await
    }

    #[tokio::test]
    async fn test_remote_stream_trims_stop_string() {
        let api_base = serve_events(concat!(
            "data:{\"token\":{\"text\":\"Hello\",\"special\":false}}\n\n",
            "data:{\"token\":{\"text\":\" #\",\"special\":false}}\n\n",
            "data:{\"token\":{\"text\":\"##\",\"special\":false}}\n\n",
            "data:{\"token\":{\"text\":\"more\",\"special\":false}}\n\n",
        ))
        .await;
        let backend = backend(api_base);

        let outputs = collect(backend.generate_stream(request("p", 16, &["###"])).await.unwrap()).await;
        let outputs: Vec<BackendOutput> = outputs.into_iter().map(|o| o.unwrap()).collect();

        let texts: Vec<&str> = outputs.iter().map(|o| o.text.as_str()).collect();
        assert_eq!(texts, vec!["Hello", "Hello "]);
        assert_eq!(outputs[1].finish_reason, Some(FinishReason::Stop));
    }

    #[tokio::test]
    async fn test_remote_stream_reports_length() {
        let api_base = serve_events(concat!(
            "data:{\"token\":{\"text\":\"a\",\"special\":false}}\n\n",
            "data:{\"token\":{\"text\":\"</s>\",\"special\":true},\"details\":{\"finish_reason\":\"length\"}}\n\n",
        ))
        .await;
        let backend = backend(api_base);

        let outputs = collect(backend.generate_stream(request("p", 1, &[])).await.unwrap()).await;
        let last = outputs.last().unwrap().as_ref().unwrap();

        assert_eq!(last.text, "a");
        assert_eq!(last.finish_reason, Some(FinishReason::Length));
    }

    #[tokio::test]
    async fn test_remote_error_event() {
        let api_base = serve_events("data:{\"error\":\"model overloaded\"}\n\n").await;
        let backend = backend(api_base);

        let outputs = collect(backend.generate_stream(request("p", 4, &[])).await.unwrap()).await;

        assert_eq!(outputs.len(), 1);
        assert!(matches!(outputs[0], Err(ChatFleetError::BackendGeneration(_))));
    }

    #[test]
    fn test_greedy_parameters() {
        let backend = backend("http://localhost:1".to_string());
        let mut req = request("p", 4, &[]);
        req.params = crate::model::SamplingParams::normalized(0.0, 0.3, 4);

        let params = backend.parameters(&req);

        assert!(!params.do_sample);
        assert!(params.temperature.is_none());
        assert_eq!(params.seed, Some(7));
    }
}
