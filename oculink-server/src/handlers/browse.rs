//! Direct SMB browsing for device shares.

use crate::errors::{AppError, AppResult};
use crate::handlers::load_device;
use crate::state::AppState;
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::header,
    response::Response,
};
use oculink_core::smb::ScanOptions;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::io::ReaderStream;

#[derive(Debug, Default, Deserialize)]
pub struct BrowseQuery {
    #[serde(default)]
    subpath: String,
}

/// `GET /devices/{id}/smb2/test`
pub async fn test_connection_handler(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> AppResult<Json<Value>> {
    let device = load_device(&state, &device_id).await?;
    state.core.pool.test_connection(&device).await?;
    Ok(Json(json!({"connected": true})))
}

/// `GET /devices/{id}/smb2/browse?subpath=`
pub async fn browse_handler(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(query): Query<BrowseQuery>,
) -> AppResult<Json<Value>> {
    let device = load_device(&state, &device_id).await?;
    let listing = state.core.pool.list_directory(&device, &query.subpath).await?;
    Ok(Json(json!(listing)))
}

/// `GET /devices/{id}/smb2/file/{*path}` — download through the cache.
pub async fn file_handler(
    State(state): State<AppState>,
    Path((device_id, file_path)): Path<(String, String)>,
) -> AppResult<Response> {
    let device = load_device(&state, &device_id).await?;
    let read = state.core.pool.read_file(&device, &file_path).await?;

    let file = tokio::fs::File::open(&read.local_path)
        .await
        .map_err(|e| AppError::internal(format!("cached file vanished: {e}")))?;
    let stream = ReaderStream::new(file);

    let filename = file_path.rsplit('/').next().unwrap_or("download");
    Response::builder()
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        )
        .header("X-From-Cache", read.from_cache.to_string())
        .body(Body::from_stream(stream))
        .map_err(|e| AppError::internal(e.to_string()))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRequest {
    #[serde(default)]
    base_path: String,
    max_depth: Option<u32>,
    max_files: Option<usize>,
    extensions: Option<Vec<String>>,
}

/// `POST /devices/{id}/smb2/scan`
pub async fn scan_handler(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Json(request): Json<ScanRequest>,
) -> AppResult<Json<Value>> {
    let device = load_device(&state, &device_id).await?;
    let defaults = ScanOptions::default();
    let options = ScanOptions {
        max_depth: request.max_depth.unwrap_or(defaults.max_depth),
        max_files: request.max_files.unwrap_or(defaults.max_files),
        extensions: request
            .extensions
            .map(|exts| exts.into_iter().map(|e| e.to_ascii_lowercase()).collect()),
        ..defaults
    };
    let result = state
        .core
        .pool
        .scan_directory_recursive(&device, &request.base_path, &options)
        .await?;
    Ok(Json(json!(result)))
}
