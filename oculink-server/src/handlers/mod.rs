pub mod browse;
pub mod queue;
pub mod records;
pub mod sync;
pub mod webhook;

use crate::errors::{AppError, AppResult};
use crate::state::AppState;
use axum::{Json, extract::State};
use oculink_model::{Device, DeviceId};
use serde_json::{Value, json};

/// Parse a path segment into a device id (400 on bad shape).
pub fn parse_device_id(raw: &str) -> AppResult<DeviceId> {
    DeviceId::parse(raw).map_err(|e| AppError::bad_request(e.to_string()))
}

/// Load a device or 404.
pub async fn load_device(state: &AppState, raw_id: &str) -> AppResult<Device> {
    let id = parse_device_id(raw_id)?;
    state
        .core
        .devices
        .get(&id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("device {raw_id} not found")))
}

/// `GET /health`
pub async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let queue = state.core.queue.get_stats().await;
    Json(json!({
        "status": "ok",
        "queue_durable": queue.durable,
        "scheduler_running": state.core.orchestrator.scheduler_running(),
        "websocket_clients": state.websocket_manager.connection_count(),
    }))
}
