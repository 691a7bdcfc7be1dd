//! Sync-queue administration.

use crate::errors::{AppError, AppResult};
use crate::state::AppState;
use axum::{
    Json,
    extract::{Path, State},
};
use oculink_core::queue::{AddJobOptions, JobPayload, JobPriority, JobType};
use serde::Deserialize;
use serde_json::{Value, json};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueRequest {
    job_type: JobType,
    data: Value,
    #[serde(default)]
    options: EnqueueOptions,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueOptions {
    priority: Option<u8>,
    #[serde(default)]
    delay_ms: u64,
    retries: Option<u32>,
    timeout_ms: Option<u64>,
}

/// `POST /devices/sync-queue/jobs`
pub async fn enqueue_job_handler(
    State(state): State<AppState>,
    Json(request): Json<EnqueueRequest>,
) -> AppResult<Json<Value>> {
    let payload = JobPayload::from_parts(request.job_type, request.data)
        .map_err(|e| AppError::bad_request(e.to_string()))?;

    let priority = match request.options.priority {
        Some(band) => {
            Some(JobPriority::new(band).map_err(|e| AppError::bad_request(e.to_string()))?)
        }
        None => None,
    };
    let options = AddJobOptions {
        priority,
        delay_ms: request.options.delay_ms,
        retries: request.options.retries,
        timeout_ms: request.options.timeout_ms,
    };

    let receipt = state.core.queue.add_job(payload, options).await?;
    Ok(Json(json!(receipt)))
}

/// `GET /devices/sync-queue/jobs/{job_id}`
pub async fn get_job_handler(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<Json<Value>> {
    let job = state
        .core
        .queue
        .get_job(&job_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("job {job_id} not found")))?;
    Ok(Json(serde_json::to_value(job).map_err(|e| AppError::internal(e.to_string()))?))
}

/// `GET /devices/sync-queue/stats`
pub async fn queue_stats_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "queue": state.core.queue.get_stats().await,
        "strategies": state.core.processor.strategy_stats(),
        "smb": state.core.pool.get_stats().await,
    }))
}

/// `POST /devices/sync-queue/retry-failed`
pub async fn retry_failed_handler(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let requeued = state.core.queue.retry_all_failed().await?;
    Ok(Json(json!({"requeued": requeued})))
}

/// `DELETE /devices/sync-queue/failed`
pub async fn clear_failed_handler(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let cleared = state.core.queue.clear_failed_jobs().await?;
    Ok(Json(json!({"cleared": cleared})))
}
