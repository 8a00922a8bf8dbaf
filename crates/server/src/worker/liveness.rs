use anyhow::Result;
use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};

/// Serve the liveness endpoint until `shutdown` fires
pub async fn serve(addr: String, worker_id: String, shutdown: CancellationToken) -> Result<()> {
    let app = create_router(worker_id);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Liveness endpoint listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    Ok(())
}

/// Create the liveness router
fn create_router(worker_id: String) -> Router {
    Router::new()
        .route("/", get(liveness))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .with_state(Arc::new(worker_id))
}

async fn liveness(State(worker_id): State<Arc<String>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "workerId": worker_id.as_str(),
    }))
}
