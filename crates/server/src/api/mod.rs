//! Queue API served by the coordinator, the only process that opens the
//! database. Workers and the CLI reach the queue through it.

use crate::config::AppState;
use anyhow::Result;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tunegraph_core::queue::EnqueueError;

mod handlers;

/// Serve the API on `listener` until `shutdown` fires
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> Result<()> {
    let app = create_router(state);

    tracing::info!("Queue API listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    Ok(())
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        // Producer
        .route("/api/workflows/queue", post(handlers::queue_workflow))
        .route("/api/workflows/schedule", post(handlers::schedule_workflow))
        // Run records
        .route("/api/runs", get(handlers::list_runs))
        .route(
            "/api/runs/{job_id}",
            get(handlers::get_run).patch(handlers::update_run),
        )
        // Job lifecycle
        .route("/api/jobs/claim", post(handlers::claim_job))
        .route("/api/jobs/{job_id}/complete", post(handlers::complete_job))
        .route("/api/jobs/{job_id}/fail", post(handlers::fail_job))
        // Workers
        .route("/api/workers", get(handlers::list_workers))
        .route(
            "/api/workers/{device_hash}",
            get(handlers::get_worker).put(handlers::upsert_worker),
        )
        .route(
            "/api/workers/{device_hash}/status",
            put(handlers::set_worker_status),
        )
        .route(
            "/api/workers/{device_hash}/recover",
            post(handlers::recover_jobs),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "tunegraph",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}

/// Error type for API handlers; anything converted with `?` is a 500
pub struct ApiError {
    status: StatusCode,
    error: anyhow::Error,
}

impl ApiError {
    pub fn new(status: StatusCode, error: impl Into<anyhow::Error>) -> Self {
        Self {
            status,
            error: error.into(),
        }
    }

    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::new(StatusCode::NOT_FOUND, anyhow::anyhow!("{} not found", what))
    }

    pub fn bad_request(error: impl Into<anyhow::Error>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, error)
    }

    /// Admission refusals are the caller's problem, storage failures ours
    pub fn enqueue(error: EnqueueError) -> Self {
        let status = match &error {
            EnqueueError::PlanLimitExceeded { .. } | EnqueueError::ExecutionDisallowed(_) => {
                StatusCode::FORBIDDEN
            }
            EnqueueError::InvalidWorkflow(_) | EnqueueError::InvalidSchedule(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            EnqueueError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error_msg = self.error.to_string();
        let details = self
            .error
            .chain()
            .skip(1)
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join(": ");

        if self.status.is_server_error() {
            tracing::error!("Request failed: {:#}", self.error);
        }

        let response = if details.is_empty() {
            ErrorResponse::new(error_msg)
        } else {
            ErrorResponse::with_details(error_msg, details)
        };

        (self.status, Json(response)).into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err)
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn app(dir: &TempDir) -> Router {
        let config = ServerConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        create_router(Arc::new(AppState::new(&config).unwrap()))
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    fn workflow(limit: usize) -> Value {
        json!({
            "id": "wf-1",
            "name": "Mix",
            "operations": [
                {"id": "src", "type": "Source.playlist", "params": {"playlistId": "p1"}, "sources": []},
                {"id": "top", "type": "Filter.limit", "params": {"limit": limit}, "sources": ["src"]}
            ]
        })
    }

    #[tokio::test]
    async fn test_health_check() {
        let dir = TempDir::new().unwrap();
        let (status, body) = send(&app(&dir), Method::GET, "/api/health", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_queue_claim_and_complete() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir);

        let (status, job) = send(
            &app,
            Method::POST,
            "/api/workflows/queue",
            Some(json!({"workflow": workflow(10), "userId": "user-1"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let job_id = job["id"].as_str().unwrap().to_string();

        let (_, run) = send(&app, Method::GET, &format!("/api/runs/{}", job_id), None).await;
        assert_eq!(run["status"], "queued");
        assert_eq!(run["workflowId"], "wf-1");

        let (status, claimed) = send(
            &app,
            Method::POST,
            "/api/jobs/claim",
            Some(json!({"workerId": "w1"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(claimed["id"], job_id.as_str());
        assert_eq!(claimed["claimedBy"], "w1");

        let (_, nothing) = send(
            &app,
            Method::POST,
            "/api/jobs/claim",
            Some(json!({"workerId": "w2"})),
        )
        .await;
        assert_eq!(nothing, Value::Null);

        let (status, _) = send(
            &app,
            Method::POST,
            &format!("/api/jobs/{}/complete", job_id),
            Some(json!({"returnValue": [1, 2]})),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_enqueue_refusals_map_to_client_errors() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir);

        let mut broken = workflow(10);
        broken["operations"][1]["sources"] = json!(["nowhere"]);
        let (status, body) = send(
            &app,
            Method::POST,
            "/api/workflows/queue",
            Some(json!({"workflow": broken, "userId": "user-1"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"].as_str().unwrap().contains("nowhere"));

        let (status, _) = send(
            &app,
            Method::POST,
            "/api/workflows/schedule",
            Some(json!({"workflow": workflow(10), "userId": "user-1", "cron": "every day"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_unknown_run_and_worker_are_not_found() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir);

        let uri = format!("/api/runs/{}", uuid_like());
        let (status, _) = send(&app, Method::GET, &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, Method::GET, "/api/runs/not-a-uuid", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, Method::GET, "/api/workers/abc", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    fn uuid_like() -> String {
        tunegraph_core::JobId::new().to_string()
    }
}
