//! Client for a worker's generation endpoints

use chatfleet_common::error::{ChatFleetError, Result};
use chatfleet_proto::{
    ConvTemplateResponse, CountTokenRequest, CountTokenResponse, FrameCodecError, GenerationFrame,
    GenerationRequest, ModelDetailsResponse, ModelSelector, NulFrameCodec,
};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;

/// Only connecting is bounded; a generation may stream for as long as the
/// backend keeps producing tokens.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub type FrameStream = BoxStream<'static, Result<GenerationFrame>>;

fn frame_error(err: FrameCodecError) -> ChatFleetError {
    match err {
        FrameCodecError::Io(e) => ChatFleetError::Connection(e.to_string()),
        FrameCodecError::Json(e) => ChatFleetError::Serialization(e),
    }
}

#[derive(Clone)]
pub struct WorkerClient {
    client: reqwest::Client,
    address: String,
}

impl WorkerClient {
    pub fn new(address: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            address: address.trim_end_matches('/').to_string(),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: &impl serde::Serialize) -> Result<T> {
        let response = self
            .client
            .post(format!("{}{}", self.address, path))
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    /// Open a streaming generation.
    ///
    /// Dropping the returned stream closes the connection, which the worker
    /// treats as an abort.
    pub async fn generate_stream(&self, request: &GenerationRequest) -> Result<FrameStream> {
        let response = self
            .client
            .post(format!("{}/worker_generate_stream", self.address))
            .json(request)
            .send()
            .await?
            .error_for_status()?;

        let bytes = response.bytes_stream().map_err(std::io::Error::other);
        let frames = FramedRead::new(StreamReader::new(bytes), NulFrameCodec::new()).map_err(frame_error);
        Ok(frames.boxed())
    }

    /// Non-streaming generation; returns the terminal frame
    pub async fn generate(&self, request: &GenerationRequest) -> Result<GenerationFrame> {
        self.post("/worker_generate", request).await
    }

    pub async fn count_token(&self, model: Option<&str>, prompt: &str) -> Result<usize> {
        let request = CountTokenRequest {
            model: model.map(str::to_string),
            prompt: prompt.to_string(),
        };
        let response: CountTokenResponse = self.post("/count_token", &request).await?;
        Ok(response.count)
    }

    pub async fn model_details(&self, model: Option<&str>) -> Result<ModelDetailsResponse> {
        let selector = ModelSelector {
            model: model.map(str::to_string),
        };
        self.post("/model_details", &selector).await
    }

    pub async fn conv_template(&self, model: Option<&str>) -> Result<serde_json::Value> {
        let selector = ModelSelector {
            model: model.map(str::to_string),
        };
        let response: ConvTemplateResponse = self.post("/worker_get_conv_template", &selector).await?;
        Ok(response.conv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};
    use chatfleet_proto::{encode_frame, FinishReason};
    use futures::stream;
    use serde_json::json;
    use tokio::net::TcpListener;

    fn frame_bytes() -> Vec<u8> {
        let frames = [
            GenerationFrame::partial("Hi: y"),
            GenerationFrame::partial("Hi: yo"),
            GenerationFrame::finished("Hi: yo!", FinishReason::Stop),
        ];
        frames
            .iter()
            .flat_map(|f| encode_frame(f).unwrap().to_vec())
            .collect()
    }

    async fn start_worker() -> String {
        let app = Router::new()
            .route(
                "/worker_generate_stream",
                post(|| async {
                    // uneven chunks so frames straddle chunk boundaries
                    let body = frame_bytes();
                    let chunks: Vec<std::io::Result<Vec<u8>>> =
                        body.chunks(7).map(|c| Ok(c.to_vec())).collect();
                    axum::body::Body::from_stream(stream::iter(chunks))
                }),
            )
            .route(
                "/count_token",
                post(|Json(req): Json<CountTokenRequest>| async move {
                    Json(json!({"count": req.prompt.chars().count(), "error_code": 0}))
                }),
            )
            .route(
                "/model_details",
                post(|| async { Json(json!({"context_length": 2048})) }),
            )
            .route(
                "/worker_get_conv_template",
                post(|| async { Json(json!({"conv": {"name": "vicuna_v1.1"}})) }),
            );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{}", local)
    }

    #[tokio::test]
    async fn test_stream_frames_across_chunks() {
        let client = WorkerClient::new(&start_worker().await).unwrap();

        let frames: Vec<GenerationFrame> = client
            .generate_stream(&GenerationRequest::new("Hi:"))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();

        let texts: Vec<&str> = frames.iter().map(|f| f.text.as_str()).collect();
        assert_eq!(texts, vec!["Hi: y", "Hi: yo", "Hi: yo!"]);
        assert!(frames[2].is_terminal());
    }

    #[tokio::test]
    async fn test_auxiliary_calls() {
        let client = WorkerClient::new(&start_worker().await).unwrap();

        assert_eq!(client.count_token(None, "héllo").await.unwrap(), 5);
        assert_eq!(client.model_details(Some("vicuna")).await.unwrap().context_length, 2048);
        assert_eq!(client.conv_template(None).await.unwrap()["name"], "vicuna_v1.1");
    }

    #[tokio::test]
    async fn test_unreachable_worker() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);
        let client = WorkerClient::new(&address).unwrap();

        let err = client.generate_stream(&GenerationRequest::new("x")).await.err().unwrap();

        assert!(matches!(err, ChatFleetError::Http(_)));
    }
}
