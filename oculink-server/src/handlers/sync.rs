//! Sync triggers, auto-sync control, and indexer views.

use crate::errors::{AppError, AppResult};
use crate::handlers::load_device;
use crate::state::AppState;
use axum::{
    Json,
    extract::{Path, State},
};
use oculink_model::{DeviceType, PatientId, UserId};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;

/// `POST /devices/{id}/sync-folder`
pub async fn sync_device_handler(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> AppResult<Json<Value>> {
    let device = load_device(&state, &device_id).await?;
    let report = state.core.orchestrator.sync_device(&device).await?;
    Ok(Json(serde_json::to_value(report).map_err(|e| AppError::internal(e.to_string()))?))
}

/// `GET /devices/sync-status`
pub async fn sync_status_handler(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let states = state.core.orchestrator.sync_states().await;
    let states: serde_json::Map<String, Value> = states
        .into_iter()
        .map(|(id, device_state)| {
            (
                id.to_string(),
                serde_json::to_value(device_state).unwrap_or(Value::Null),
            )
        })
        .collect();
    Ok(Json(Value::Object(states)))
}

/// `POST /devices/auto-sync/start`
pub async fn auto_sync_start_handler(State(state): State<AppState>) -> Json<Value> {
    state.core.orchestrator.start_scheduler();
    Json(json!({"running": true}))
}

/// `POST /devices/auto-sync/stop`
pub async fn auto_sync_stop_handler(State(state): State<AppState>) -> Json<Value> {
    state.core.orchestrator.stop_scheduler();
    Json(json!({"running": false}))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoSyncConfig {
    poll_interval_minutes: u64,
}

/// `PUT /devices/auto-sync/config`
pub async fn auto_sync_config_handler(
    State(state): State<AppState>,
    Json(config): Json<AutoSyncConfig>,
) -> AppResult<Json<Value>> {
    if config.poll_interval_minutes == 0 {
        return Err(AppError::bad_request("pollIntervalMinutes must be at least 1"));
    }
    state
        .core
        .orchestrator
        .set_poll_interval(Duration::from_secs(config.poll_interval_minutes * 60))
        .await;
    Ok(Json(json!({
        "pollIntervalMinutes": config.poll_interval_minutes,
    })))
}

/// `GET /devices/unmatched-folders`
pub async fn unmatched_folders_handler(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let tickets = state.core.indexer.get_unmatched_folders().await?;
    Ok(Json(json!({"unmatched": tickets})))
}

/// `GET /devices/indexer/stats`
pub async fn indexer_stats_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.core.indexer.get_stats()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualLinkRequest {
    folder_path: String,
    patient_id: String,
    device_type: DeviceType,
    user_id: String,
}

/// `POST /devices/folders/link`
pub async fn manual_link_handler(
    State(state): State<AppState>,
    Json(request): Json<ManualLinkRequest>,
) -> AppResult<Json<Value>> {
    let patient = PatientId::parse(request.patient_id)
        .map_err(|e| AppError::bad_request(e.to_string()))?;
    let user =
        UserId::parse(request.user_id).map_err(|e| AppError::bad_request(e.to_string()))?;
    state
        .core
        .indexer
        .manual_link_folder(&request.folder_path, patient, request.device_type, user)
        .await?;
    Ok(Json(json!({"linked": true})))
}
