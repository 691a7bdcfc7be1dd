//! Route table for the device-integration surface.

use crate::handlers::{
    browse, health_handler, queue, records, sync, webhook,
};
use crate::state::AppState;
use crate::websocket::websocket_handler;
use axum::{
    Router,
    routing::{delete, get, post, put},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        // Webhook ingress
        .route("/devices/webhook/{device_id}", post(webhook::webhook_handler))
        // Sync triggers and auto-sync control
        .route("/devices/{id}/sync-folder", post(sync::sync_device_handler))
        .route("/devices/sync-status", get(sync::sync_status_handler))
        .route("/devices/auto-sync/start", post(sync::auto_sync_start_handler))
        .route("/devices/auto-sync/stop", post(sync::auto_sync_stop_handler))
        .route("/devices/auto-sync/config", put(sync::auto_sync_config_handler))
        // Queue administration
        .route("/devices/sync-queue/jobs", post(queue::enqueue_job_handler))
        .route("/devices/sync-queue/jobs/{job_id}", get(queue::get_job_handler))
        .route("/devices/sync-queue/stats", get(queue::queue_stats_handler))
        .route("/devices/sync-queue/retry-failed", post(queue::retry_failed_handler))
        .route("/devices/sync-queue/failed", delete(queue::clear_failed_handler))
        // SMB browsing
        .route("/devices/{id}/smb2/test", get(browse::test_connection_handler))
        .route("/devices/{id}/smb2/browse", get(browse::browse_handler))
        .route("/devices/{id}/smb2/file/{*path}", get(browse::file_handler))
        .route("/devices/{id}/smb2/scan", post(browse::scan_handler))
        // Folder indexing
        .route("/devices/unmatched-folders", get(sync::unmatched_folders_handler))
        .route("/devices/indexer/stats", get(sync::indexer_stats_handler))
        .route("/devices/folders/link", post(sync::manual_link_handler))
        // Granular record updates (called by the EMR backend)
        .route("/records/{id}/refraction", put(records::update_refraction_handler))
        .route("/records/{id}/diagnosis", put(records::update_diagnosis_handler))
        .route("/records/{id}/treatment", put(records::update_treatment_handler))
        .route("/records/{id}/iop", put(records::update_iop_handler))
        .route("/records/{id}/visual-acuity", put(records::update_visual_acuity_handler))
        .route(
            "/records/{id}/anterior-segment",
            put(records::update_anterior_segment_handler),
        )
        .route(
            "/records/{id}/posterior-segment",
            put(records::update_posterior_segment_handler),
        )
        .route("/records/{id}/keratometry", put(records::update_keratometry_handler))
        .route(
            "/records/{id}/pathology-findings",
            put(records::update_pathology_findings_handler),
        )
        .route("/records/{id}/notes", put(records::update_notes_handler))
        .route(
            "/records/{id}/chief-complaint",
            put(records::update_chief_complaint_handler),
        )
        .route("/records/{id}/prescriptions", post(records::link_prescription_handler))
        .route("/records/{id}/ivt", post(records::link_ivt_handler))
        // Real-time event stream
        .route("/devices/events/ws", get(websocket_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
