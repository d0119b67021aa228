//! HTTP API
//!
//! - `POST /api/v1/sandbox/run` runs a script and returns its result
//! - `GET /api/v1/sandbox/status` pool diagnostics
//! - `GET /health` liveness

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;

use crate::capabilities::{CapabilityId, REGISTRY_VERSION};
use crate::error::{Error, Result};
use crate::pool::PoolSnapshot;
use crate::sandbox::{ErrorKind, ExecutionRequest, ExecutionResult};
use crate::service::SandboxService;

/// Seconds a rejected client should wait before retrying
const RETRY_AFTER_SECS: u64 = 1;

// ---- App State ----

#[derive(Clone)]
struct ApiState {
    service: SandboxService,
}

// ---- Error Handling ----

struct ApiError(Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::InvalidInput(_) | Error::NotFound(_) => StatusCode::BAD_REQUEST,
            Error::PoolExhausted { .. } | Error::Shutdown { .. } | Error::NotAccepting => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({ "success": false, "error": self.0.to_string() }));

        if matches!(self.0, Error::PoolExhausted { .. }) {
            (status, [(header::RETRY_AFTER, RETRY_AFTER_SECS.to_string())], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

// ---- Request/Response Types ----

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunRequest {
    code: String,
    #[serde(default)]
    context: Value,
    timeout_ms: Option<u64>,
    capabilities: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    logs: Option<String>,
    duration_ms: u64,
}

impl From<ExecutionResult> for RunResponse {
    fn from(result: ExecutionResult) -> Self {
        RunResponse {
            success: result.success,
            value: result.value,
            error: result.error,
            error_kind: result.error_kind,
            logs: Some(result.logs).filter(|logs| !logs.is_empty()),
            duration_ms: result.duration_ms,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    version: &'static str,
    registry_version: u32,
    pool: PoolSnapshot,
}

// ---- Handlers ----

async fn run_script(
    State(state): State<ApiState>,
    payload: std::result::Result<Json<RunRequest>, JsonRejection>,
) -> std::result::Result<Json<RunResponse>, ApiError> {
    let Json(payload) = payload.map_err(|e| Error::InvalidInput(e.body_text()))?;
    if payload.code.trim().is_empty() {
        return Err(Error::InvalidInput("code must not be empty".to_string()).into());
    }

    let mut request = ExecutionRequest::new(payload.code).with_context(payload.context);
    if let Some(timeout_ms) = payload.timeout_ms {
        request = request.with_timeout_ms(timeout_ms);
    }
    if let Some(names) = payload.capabilities {
        let ids = names
            .iter()
            .map(|name| name.parse::<CapabilityId>())
            .collect::<Result<Vec<_>>>()?;
        request = request.with_capabilities(ids);
    }

    let result = state.service.submit(request).await?;
    Ok(Json(result.into()))
}

async fn get_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: crate::VERSION,
        registry_version: REGISTRY_VERSION,
        pool: state.service.snapshot(),
    })
}

async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    if state.service.is_accepting() {
        (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "shutting_down" })),
        )
    }
}

// ---- Router ----

/// Build the HTTP router; `body_limit` caps request bodies in bytes
pub fn build_router(service: SandboxService, body_limit: usize) -> Router {
    let api = Router::new()
        .route("/sandbox/run", post(run_script))
        .route("/sandbox/status", get(get_status));

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api)
        .with_state(ApiState { service })
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::service::{initialize_sandbox_service, shutdown_sandbox_service};
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;
    use std::time::Duration;
    use tower::ServiceExt;

    fn service(pool_size: usize, queue_capacity: usize) -> SandboxService {
        let mut config = Config::default();
        config.sandbox.pool_size = pool_size;
        config.sandbox.queue_capacity = queue_capacity;
        config.sandbox.prewarm_workers = Some(0);
        config.sandbox.shutdown_grace = Duration::from_millis(200);
        initialize_sandbox_service(&config).unwrap()
    }

    fn run_request(body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/v1/sandbox/run")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_run_endpoint() {
        let app = build_router(service(1, 0), 1024 * 1024);
        let response = app
            .oneshot(run_request(json!({
                "code": "console.log('hi', context.n); return context.n * 2;",
                "context": { "n": 21 },
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["value"], 42);
        assert_eq!(body["logs"], "hi 21");
        assert!(body["durationMs"].is_u64());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_script_failure_is_200() {
        let app = build_router(service(1, 0), 1024 * 1024);
        let response = app
            .oneshot(run_request(json!({ "code": "throw new Error('nope');" })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "nope");
        assert!(body.get("logs").is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_invalid_input_is_400() {
        let app = build_router(service(1, 0), 1024 * 1024);

        let response = app
            .clone()
            .oneshot(run_request(json!({ "code": "   " })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .clone()
            .oneshot(run_request(json!({ "code": "return 1;", "capabilities": ["readFile"] })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(run_request(json!({ "code": "return 1;", "timeoutMs": 999999 })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pool_exhausted_is_503_with_retry_after() {
        let service = service(1, 0);
        let app = build_router(service.clone(), 1024 * 1024);

        let busy = tokio::spawn({
            let app = app.clone();
            async move {
                app.oneshot(run_request(json!({ "code": "while (true) {}", "timeoutMs": 500 })))
                    .await
            }
        });
        while service.snapshot().busy == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let response = app
            .oneshot(run_request(json!({ "code": "return 1;" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], "1");

        let timed_out = json_body(busy.await.unwrap().unwrap()).await;
        assert_eq!(timed_out["errorKind"], "timeout");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_status_and_health() {
        let service = service(2, 3);
        let app = build_router(service.clone(), 1024 * 1024);

        let response = app
            .clone()
            .oneshot(Request::get("/api/v1/sandbox/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["registryVersion"], 1);
        assert_eq!(body["pool"]["workers"].as_array().unwrap().len(), 2);
        assert_eq!(body["pool"]["queueCapacity"], 3);
        assert_eq!(body["pool"]["capabilities"], json!(["addNumbers", "httpCall"]));

        let response = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        shutdown_sandbox_service(service).await;
        let response = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = app
            .oneshot(run_request(json!({ "code": "return 1;" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
