//! Control API: JSON endpoints over the running service.

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::error;

use crate::error::{Error, WorkerError};
use crate::ingest::poller::PollOutcome;
use crate::service::IntakeService;

const DEFAULT_PEEK: usize = 10;
const MAX_PEEK: usize = 100;
const DEFAULT_RESULTS: usize = 50;
const MAX_RESULTS: usize = 500;
/// Room for the JSON envelope and metadata around the base64 content.
const UPLOAD_JSON_OVERHEAD: u64 = 64 * 1024;

/// Shared state for control routes.
#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<IntakeService>,
}

fn error_json(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn internal(e: Error) -> Response {
    error!(error = %e, "Control API request failed");
    let status = match e {
        Error::Queue(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::Worker(WorkerError::NotRunning) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_json(status, e.to_string())
}

/// GET /health
///
/// 503 when the queue store cannot be reached.
async fn health(State(state): State<ApiState>) -> Response {
    let queue = state.service.queue_health().await;
    if queue.is_healthy() {
        Json(json!({ "status": "ok", "queue": queue })).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "degraded", "queue": queue })),
        )
            .into_response()
    }
}

/// GET /api/status
async fn status(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.service.stats().await)
}

#[derive(Debug, Deserialize)]
struct CountParams {
    count: Option<usize>,
    limit: Option<usize>,
}

/// GET /api/queue/peek?count=N
///
/// Oldest tasks first, attachment content replaced by its length.
async fn peek_queue(State(state): State<ApiState>, Query(params): Query<CountParams>) -> Response {
    let count = params.count.unwrap_or(DEFAULT_PEEK).min(MAX_PEEK);
    match state.service.peek_queue(count).await {
        Ok(tasks) => Json(json!({ "count": tasks.len(), "tasks": tasks })).into_response(),
        Err(e) => internal(e),
    }
}

/// GET /api/queue/stats
async fn queue_stats(State(state): State<ApiState>) -> Response {
    match state.service.queue_stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => internal(e),
    }
}

/// GET /api/queue/tasks/{task_id}
async fn queued_task(State(state): State<ApiState>, Path(task_id): Path<String>) -> Response {
    match state.service.find_queued(&task_id).await {
        Ok(Some(task)) => Json(task).into_response(),
        Ok(None) => error_json(StatusCode::NOT_FOUND, format!("task {task_id} is not queued")),
        Err(e) => internal(e),
    }
}

/// DELETE /api/queue
async fn clear_queue(State(state): State<ApiState>) -> Response {
    match state.service.clear_queue().await {
        Ok(removed) => Json(json!({ "removed": removed })).into_response(),
        Err(e) => internal(e),
    }
}

/// POST /api/workers/restart
async fn restart_workers(State(state): State<ApiState>) -> Response {
    match state.service.restart_workers().await {
        Ok(signalled) => Json(json!({ "signalled": signalled })).into_response(),
        Err(e) => internal(e),
    }
}

/// POST /api/process-now
///
/// Runs one poll immediately. Clears an auth halt.
async fn process_now(State(state): State<ApiState>) -> Response {
    match state.service.poll_now().await {
        None => error_json(StatusCode::NOT_FOUND, "no mail source configured"),
        Some(PollOutcome::Completed(report)) => {
            Json(json!({ "status": "completed", "report": report })).into_response()
        }
        Some(PollOutcome::InProgress) => error_json(StatusCode::CONFLICT, "a poll is already running"),
        Some(PollOutcome::Halted) => error_json(StatusCode::CONFLICT, "polling is halted"),
        Some(PollOutcome::Failed(e)) => {
            let status = if e.is_auth() {
                StatusCode::UNAUTHORIZED
            } else {
                StatusCode::BAD_GATEWAY
            };
            error_json(status, e.to_string())
        }
    }
}

#[derive(Debug, Deserialize)]
struct UploadRequest {
    filename: String,
    #[serde(default)]
    mime_type: String,
    content_b64: String,
    #[serde(default)]
    uploader: String,
}

/// POST /api/upload
///
/// Body: `{ "filename", "content_b64", "mime_type"?, "uploader"? }`.
async fn upload(State(state): State<ApiState>, Json(req): Json<UploadRequest>) -> Response {
    if req.filename.trim().is_empty() {
        return error_json(StatusCode::BAD_REQUEST, "filename is required");
    }
    let bytes = match BASE64.decode(req.content_b64.as_bytes()) {
        Ok(bytes) => bytes,
        Err(e) => return error_json(StatusCode::BAD_REQUEST, format!("content_b64: {e}")),
    };
    let receipt = state
        .service
        .upload(&req.filename, &req.mime_type, &bytes, &req.uploader)
        .await;
    (StatusCode::ACCEPTED, Json(receipt)).into_response()
}

/// GET /api/results?limit=N
async fn results(State(state): State<ApiState>, Query(params): Query<CountParams>) -> Response {
    let limit = params.limit.unwrap_or(DEFAULT_RESULTS).min(MAX_RESULTS);
    match state.service.recent_results(limit).await {
        Ok(results) => Json(json!({ "count": results.len(), "results": results })).into_response(),
        Err(e) => internal(e),
    }
}

/// POST /api/cursor/reset
async fn reset_cursor(State(state): State<ApiState>) -> Response {
    match state.service.reset_cursor().await {
        Ok(true) => Json(json!({ "reset": true })).into_response(),
        Ok(false) => error_json(StatusCode::NOT_FOUND, "no mail source configured"),
        Err(e) => internal(e),
    }
}

/// Largest upload body: the base64 form of `max_attachment_size` plus the
/// JSON around it.
fn upload_body_limit(max_attachment_size: u64) -> usize {
    let encoded = max_attachment_size.div_ceil(3).saturating_mul(4);
    usize::try_from(encoded.saturating_add(UPLOAD_JSON_OVERHEAD)).unwrap_or(usize::MAX)
}

/// Build the control routes.
pub fn api_routes(state: ApiState) -> Router {
    let upload_limit = upload_body_limit(state.service.config().max_attachment_size);
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(status))
        .route("/api/queue/peek", get(peek_queue))
        .route("/api/queue/stats", get(queue_stats))
        .route("/api/queue/tasks/{task_id}", get(queued_task))
        .route("/api/queue", delete(clear_queue))
        .route("/api/workers/restart", post(restart_workers))
        .route("/api/process-now", post(process_now))
        .route(
            "/api/upload",
            post(upload).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/api/results", get(results))
        .route("/api/cursor/reset", post(reset_cursor))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
