//! HTTP route handlers for the task and queue API.

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use conductor::core::types::TaskId;
use conductor::orchestrator::{AbortError, SubmitError};
use conductor::queue::QueueStatus;
use conductor::task::TaskView;
use conductor::trace::TraceRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::state::AppState;

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/tasks", post(submit_task).get(list_tasks))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}/trace", get(get_trace))
        .route("/tasks/{id}/abort", post(abort_task))
        .route("/queue/status", get(queue_status))
        .route("/queue/pause", post(pause_queue))
        .route("/queue/resume", post(resume_queue))
        .route("/queue/purge", post(purge_queue))
        .route("/queue/emergency-stop", post(emergency_stop))
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub payload: Value,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub task_id: TaskId,
}

/// POST /tasks - queue a payload; 503 when the queue rejects it.
pub async fn submit_task(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), StatusCode> {
    match state.orchestrator.submit(request.payload) {
        Ok(task_id) => {
            info!(task_id = %task_id, "task submitted");
            Ok((StatusCode::ACCEPTED, Json(SubmitResponse { task_id })))
        }
        Err(err @ SubmitError::Rejected { .. }) => {
            warn!(error = %err, "submission rejected");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

/// GET /tasks - all tasks, oldest first.
pub async fn list_tasks(State(state): State<AppState>) -> Json<Vec<TaskView>> {
    Json(state.orchestrator.tasks())
}

fn parse_id(raw: &str) -> Result<TaskId, StatusCode> {
    TaskId::parse(raw).ok_or(StatusCode::NOT_FOUND)
}

/// GET /tasks/{id}
pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskView>, StatusCode> {
    let task_id = parse_id(&id)?;
    state
        .orchestrator
        .task(task_id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// GET /tasks/{id}/trace
pub async fn get_trace(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TraceRecord>, StatusCode> {
    let task_id = parse_id(&id)?;
    state
        .orchestrator
        .trace(task_id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

#[derive(Debug, Serialize)]
pub struct OkResponse {
    pub ok: bool,
}

/// POST /tasks/{id}/abort - 404 unknown, 409 already finished.
pub async fn abort_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<OkResponse>, StatusCode> {
    let task_id = parse_id(&id)?;
    match state.orchestrator.abort(task_id) {
        Ok(()) => Ok(Json(OkResponse { ok: true })),
        Err(AbortError::NotFound(_)) => Err(StatusCode::NOT_FOUND),
        Err(AbortError::AlreadyTerminal(..)) => Err(StatusCode::CONFLICT),
    }
}

pub async fn queue_status(State(state): State<AppState>) -> Json<QueueStatus> {
    Json(state.orchestrator.queue_status())
}

pub async fn pause_queue(State(state): State<AppState>) -> Json<QueueStatus> {
    Json(state.orchestrator.pause())
}

pub async fn resume_queue(State(state): State<AppState>) -> Json<QueueStatus> {
    Json(state.orchestrator.resume())
}

#[derive(Debug, Serialize)]
pub struct PurgeResponse {
    pub removed: usize,
}

pub async fn purge_queue(State(state): State<AppState>) -> Json<PurgeResponse> {
    let removed = state.orchestrator.purge().len();
    Json(PurgeResponse { removed })
}

#[derive(Debug, Serialize)]
pub struct EmergencyStopResponse {
    pub cancelled: usize,
    pub purged: usize,
}

pub async fn emergency_stop(State(state): State<AppState>) -> Json<EmergencyStopResponse> {
    let report = state.orchestrator.emergency_stop();
    Json(EmergencyStopResponse {
        cancelled: report.cancelled.len(),
        purged: report.purged.len(),
    })
}
