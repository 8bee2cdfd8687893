//! HTTP surface of the controller

use crate::controller::Controller;
use axum::{
    extract::State,
    http::StatusCode,
    routing::post,
    Json, Router,
};
use chatfleet_common::error::Result;
use chatfleet_proto::{
    HeartbeatRequest, HeartbeatResponse, ListModelsResponse, RegisterWorkerRequest,
    WorkerAddressRequest, WorkerAddressResponse, WorkerStatus,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub fn create_router(controller: Arc<Controller>) -> Router {
    Router::new()
        .route("/register_worker", post(register_worker))
        .route("/receive_heart_beat", post(receive_heart_beat))
        .route("/refresh_all_workers", post(refresh_all_workers))
        .route("/list_models", post(list_models))
        .route("/get_worker_address", post(get_worker_address))
        .route("/worker_get_status", post(worker_get_status))
        .route("/test_connection", post(test_connection))
        .with_state(controller)
}

/// Serve until `shutdown` is cancelled
pub async fn serve(listener: TcpListener, router: Router, shutdown: CancellationToken) -> Result<()> {
    info!("Controller listening on {}", listener.local_addr()?);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn register_worker(
    State(controller): State<Arc<Controller>>,
    Json(req): Json<RegisterWorkerRequest>,
) -> Result<StatusCode> {
    controller
        .register_worker(&req.worker_name, req.check_heart_beat, req.worker_status)
        .await?;
    Ok(StatusCode::OK)
}

async fn receive_heart_beat(
    State(controller): State<Arc<Controller>>,
    Json(req): Json<HeartbeatRequest>,
) -> Json<HeartbeatResponse> {
    debug!("Heartbeat from {} (queue {})", req.worker_name, req.queue_length);
    let exist = controller.receive_heartbeat(&req.worker_name, req.queue_length);
    Json(HeartbeatResponse { exist })
}

async fn refresh_all_workers(State(controller): State<Arc<Controller>>) -> StatusCode {
    controller.refresh_all_workers().await;
    StatusCode::OK
}

async fn list_models(State(controller): State<Arc<Controller>>) -> Json<ListModelsResponse> {
    Json(ListModelsResponse {
        models: controller.list_models(),
    })
}

async fn get_worker_address(
    State(controller): State<Arc<Controller>>,
    Json(req): Json<WorkerAddressRequest>,
) -> Json<WorkerAddressResponse> {
    Json(WorkerAddressResponse {
        address: controller.get_worker_address(&req.model),
    })
}

async fn worker_get_status(State(controller): State<Arc<Controller>>) -> Json<WorkerStatus> {
    Json(controller.worker_status())
}

async fn test_connection() -> Json<&'static str> {
    Json("success")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::tests::FakeProbe;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use chatfleet_common::config::ControllerConfig;
    use chatfleet_common::metrics_router;
    use serde::de::DeserializeOwned;
    use serde_json::json;
    use tower::ServiceExt;

    fn test_app(probe: Arc<FakeProbe>) -> (Arc<Controller>, Router) {
        let controller = Arc::new(Controller::new(ControllerConfig::default(), probe));
        let router = create_router(controller.clone());
        (controller, router)
    }

    async fn post_json(router: &Router, uri: &str, body: serde_json::Value) -> axum::response::Response {
        router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    async fn read_json<T: DeserializeOwned>(response: axum::response::Response) -> T {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_register_and_dispatch_over_http() {
        let (_, router) = test_app(Arc::new(FakeProbe::default()));

        let response = post_json(
            &router,
            "/register_worker",
            json!({
                "worker_name": "http://w1:21002",
                "check_heart_beat": true,
                "worker_status": {"model_names": ["vicuna-7b"], "speed": 1.0, "queue_length": 0}
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let models: ListModelsResponse = read_json(post_json(&router, "/list_models", json!({})).await).await;
        assert_eq!(models.models, vec!["vicuna-7b"]);

        let address: WorkerAddressResponse =
            read_json(post_json(&router, "/get_worker_address", json!({"model": "vicuna-7b"})).await).await;
        assert_eq!(address.address, "http://w1:21002");

        let missing: WorkerAddressResponse =
            read_json(post_json(&router, "/get_worker_address", json!({"model": "other"})).await).await;
        assert_eq!(missing.address, "");
    }

    #[tokio::test]
    async fn test_register_unreachable_worker_fails() {
        let (controller, router) = test_app(Arc::new(FakeProbe::default()));

        let response = post_json(
            &router,
            "/register_worker",
            json!({"worker_name": "http://gone", "check_heart_beat": true}),
        )
        .await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(controller.registry().is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_for_unknown_worker() {
        let (_, router) = test_app(Arc::new(FakeProbe::default()));

        let response = post_json(
            &router,
            "/receive_heart_beat",
            json!({"worker_name": "http://unknown", "queue_length": 3}),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let body: HeartbeatResponse = read_json(response).await;
        assert!(!body.exist);
    }

    #[tokio::test]
    async fn test_refresh_and_status() {
        let probe = Arc::new(FakeProbe::default());
        probe.set("http://w1", &["A"], 1);
        probe.set("http://w2", &["B"], 2);
        let (controller, router) = test_app(probe.clone());
        controller.register_worker("http://w1", true, None).await.unwrap();
        controller.register_worker("http://w2", true, None).await.unwrap();

        probe.kill("http://w2");
        let response = post_json(&router, "/refresh_all_workers", json!({})).await;
        assert_eq!(response.status(), StatusCode::OK);

        let status: WorkerStatus = read_json(post_json(&router, "/worker_get_status", json!({})).await).await;
        assert_eq!(status.model_names, vec!["A"]);
        assert_eq!(status.queue_length, 1);
    }

    #[tokio::test]
    async fn test_connection_and_metrics() {
        let (_, router) = test_app(Arc::new(FakeProbe::default()));

        let body: String = read_json(post_json(&router, "/test_connection", json!({})).await).await;
        assert_eq!(body, "success");

        let response = router
            .merge(metrics_router())
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
