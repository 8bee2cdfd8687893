//! HTTP surface of a worker

use crate::worker::ModelWorker;
use axum::{
    body::Body,
    extract::State,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use chatfleet_common::error::Result;
use chatfleet_common::METRICS;
use chatfleet_proto::{
    encode_frame, ConvTemplateResponse, CountTokenRequest, CountTokenResponse, EmbeddingsRequest,
    EmbeddingsResponse, GenerationFrame, GenerationRequest, ModelDetailsResponse, WorkerStatus,
};
use futures::StreamExt;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub fn create_router(worker: Arc<ModelWorker>) -> Router {
    Router::new()
        .route("/worker_generate_stream", post(generate_stream))
        .route("/worker_generate", post(generate))
        .route("/worker_get_embeddings", post(get_embeddings))
        .route("/worker_get_status", post(get_status))
        .route("/count_token", post(count_token))
        .route("/worker_get_conv_template", post(conv_template))
        .route("/model_details", post(model_details))
        .with_state(worker)
}

/// Serve until `shutdown` is cancelled
pub async fn serve(listener: TcpListener, router: Router, shutdown: CancellationToken) -> Result<()> {
    info!("Worker listening on {}", listener.local_addr()?);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

/// Chunked body of NUL-terminated JSON frames
async fn generate_stream(
    State(worker): State<Arc<ModelWorker>>,
    Json(request): Json<GenerationRequest>,
) -> Response {
    let frames = worker.generate_stream(request).map(|frame| {
        METRICS.worker.frames_streamed.inc();
        encode_frame(&frame)
    });
    Body::from_stream(frames).into_response()
}

async fn generate(
    State(worker): State<Arc<ModelWorker>>,
    Json(request): Json<GenerationRequest>,
) -> Json<GenerationFrame> {
    Json(worker.generate(request).await)
}

async fn get_embeddings(
    State(worker): State<Arc<ModelWorker>>,
    Json(request): Json<EmbeddingsRequest>,
) -> Result<Json<EmbeddingsResponse>> {
    Ok(Json(worker.get_embeddings(&request).await?))
}

async fn get_status(State(worker): State<Arc<ModelWorker>>) -> Json<WorkerStatus> {
    Json(worker.get_status())
}

async fn count_token(
    State(worker): State<Arc<ModelWorker>>,
    Json(request): Json<CountTokenRequest>,
) -> Result<Json<CountTokenResponse>> {
    Ok(Json(worker.count_token(&request).await?))
}

async fn conv_template(State(worker): State<Arc<ModelWorker>>) -> Json<ConvTemplateResponse> {
    Json(worker.conv_template())
}

async fn model_details(State(worker): State<Arc<ModelWorker>>) -> Json<ModelDetailsResponse> {
    Json(worker.model_details())
}
