use super::{ApiError, ApiResult};
use crate::config::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tunegraph_core::queue::{FailOutcome, JobBroker, QueuedJob, RepeatableJob};
use tunegraph_core::storage::RunUpdate;
use tunegraph_core::{JobId, WorkerRecord, WorkerStatus, WorkflowDefinition, WorkflowRunRecord};

fn parse_job_id(job_id: &str) -> ApiResult<JobId> {
    job_id
        .parse()
        .map_err(|_| ApiError::bad_request(anyhow::anyhow!("Invalid job ID '{}'", job_id)))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueWorkflowRequest {
    pub workflow: WorkflowDefinition,
    pub user_id: String,
    /// Defaults to the definition id
    #[serde(default)]
    pub workflow_record_id: Option<String>,
}

/// Admit a workflow and queue one run of it
pub async fn queue_workflow(
    State(state): State<Arc<AppState>>,
    Json(req): Json<QueueWorkflowRequest>,
) -> ApiResult<Json<QueuedJob>> {
    let record = req
        .workflow_record_id
        .unwrap_or_else(|| req.workflow.id.clone());

    let job = state
        .producer
        .create_workflow_queue(req.workflow, &req.user_id, &record)
        .await
        .map_err(ApiError::enqueue)?;

    Ok(Json(job))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleWorkflowRequest {
    pub workflow: WorkflowDefinition,
    pub user_id: String,
    #[serde(default)]
    pub workflow_record_id: Option<String>,
    pub cron: String,
}

/// Register a cron schedule for a workflow
pub async fn schedule_workflow(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ScheduleWorkflowRequest>,
) -> ApiResult<Json<RepeatableJob>> {
    let record = req
        .workflow_record_id
        .unwrap_or_else(|| req.workflow.id.clone());

    let repeatable = state
        .producer
        .schedule_workflow(req.workflow, &req.user_id, &record, &req.cron)
        .await
        .map_err(ApiError::enqueue)?;

    Ok(Json(repeatable))
}

/// List all run records
pub async fn list_runs(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<WorkflowRunRecord>>> {
    Ok(Json(state.store.list_runs()?))
}

/// Get the run record of a job
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<WorkflowRunRecord>> {
    let job_id = parse_job_id(&job_id)?;

    let run = state
        .store
        .get_run(&job_id)?
        .ok_or_else(|| ApiError::not_found(format!("Run {}", job_id)))?;

    Ok(Json(run))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateRunResponse {
    pub applied: bool,
}

/// Apply a partial update to a run record
pub async fn update_run(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
    Json(update): Json<RunUpdate>,
) -> ApiResult<Json<UpdateRunResponse>> {
    let job_id = parse_job_id(&job_id)?;
    let applied = state.broker.update_run(&job_id, update).await?;
    Ok(Json(UpdateRunResponse { applied }))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRequest {
    pub worker_id: String,
}

/// Claim the oldest available job; `null` when the queue is empty
pub async fn claim_job(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ClaimRequest>,
) -> ApiResult<Json<Option<QueuedJob>>> {
    Ok(Json(state.broker.claim(&req.worker_id).await?))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRequest {
    #[serde(default)]
    pub return_value: Value,
}

pub async fn complete_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
    Json(req): Json<CompleteRequest>,
) -> ApiResult<StatusCode> {
    let job_id = parse_job_id(&job_id)?;
    state.broker.complete(&job_id, req.return_value).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FailRequest {
    pub reason: String,
    pub retryable: bool,
}

pub async fn fail_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
    Json(req): Json<FailRequest>,
) -> ApiResult<Json<FailOutcome>> {
    let job_id = parse_job_id(&job_id)?;
    let outcome = state
        .broker
        .fail(&job_id, &req.reason, req.retryable)
        .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RecoverResponse {
    pub recovered: usize,
}

/// Requeue the jobs a worker left active
pub async fn recover_jobs(
    State(state): State<Arc<AppState>>,
    Path(device_hash): Path<String>,
) -> ApiResult<Json<RecoverResponse>> {
    let recovered = state.broker.recover(&device_hash).await?;
    Ok(Json(RecoverResponse { recovered }))
}

pub async fn list_workers(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<WorkerRecord>>> {
    Ok(Json(state.store.list_workers()?))
}

pub async fn get_worker(
    State(state): State<Arc<AppState>>,
    Path(device_hash): Path<String>,
) -> ApiResult<Json<WorkerRecord>> {
    let worker = state
        .broker
        .get_worker(&device_hash)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Worker {}", device_hash)))?;

    Ok(Json(worker))
}

pub async fn upsert_worker(
    State(state): State<Arc<AppState>>,
    Path(device_hash): Path<String>,
    Json(worker): Json<WorkerRecord>,
) -> ApiResult<StatusCode> {
    if worker.device_hash != device_hash {
        return Err(ApiError::bad_request(anyhow::anyhow!(
            "Worker record {} does not match path {}",
            worker.device_hash,
            device_hash
        )));
    }

    state.broker.upsert_worker(&worker).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkerStatusRequest {
    pub status: WorkerStatus,
}

pub async fn set_worker_status(
    State(state): State<Arc<AppState>>,
    Path(device_hash): Path<String>,
    Json(req): Json<WorkerStatusRequest>,
) -> ApiResult<StatusCode> {
    if state.broker.get_worker(&device_hash).await?.is_none() {
        return Err(ApiError::not_found(format!("Worker {}", device_hash)));
    }

    state.broker.set_worker_status(&device_hash, req.status).await?;
    Ok(StatusCode::NO_CONTENT)
}
