//! Device webhook ingress.

use crate::errors::{AppError, AppResult};
use crate::handlers::parse_device_id;
use crate::state::AppState;
use axum::{
    Json,
    extract::{ConnectInfo, Path, State},
    http::HeaderMap,
};
use oculink_core::orchestrator::{WebhookOutcome, WebhookRequest};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::net::SocketAddr;

const SIGNATURE_HEADER: &str = "x-device-signature";

/// `POST /devices/webhook/{device_id}`
pub async fn webhook_handler(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> AppResult<Json<Value>> {
    let device_id = parse_device_id(&device_id)?;

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let header_map: BTreeMap<String, String> = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    let request = WebhookRequest {
        device_id,
        signature,
        headers: header_map,
        payload,
        source_ip: Some(addr.ip().to_string()),
        user_agent,
    };

    match state.core.orchestrator.handle_webhook(request).await? {
        WebhookOutcome::Processed { event_type } => Ok(Json(json!({
            "processed": true,
            "eventType": event_type,
        }))),
        WebhookOutcome::InvalidSignature => {
            Err(AppError::unauthorized("invalid webhook signature"))
        }
        WebhookOutcome::UnknownDevice => Err(AppError::not_found("device not found")),
    }
}
