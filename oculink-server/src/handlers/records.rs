//! Granular clinical-record update endpoints.
//!
//! Called by the EMR backend when a measurement maps onto a per-section
//! clinical update. Every route takes the acting user in the body and
//! returns the updated record.

use crate::errors::{AppError, AppResult};
use crate::state::AppState;
use axum::{
    Json,
    extract::{Path, State},
};
use oculink_core::records::{
    DiagnosisEntry, IopUpdate, RefractionUpdate, TreatmentUpdate, VisualAcuityUpdate,
};
use oculink_model::{RecordId, UserId};
use serde::Deserialize;
use serde_json::Value;

fn parse_record_id(raw: &str) -> AppResult<RecordId> {
    RecordId::parse(raw).map_err(|e| AppError::bad_request(e.to_string()))
}

fn parse_user_id(raw: &str) -> AppResult<UserId> {
    UserId::parse(raw).map_err(|e| AppError::bad_request(e.to_string()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionRequest<T> {
    user_id: String,
    payload: T,
}

macro_rules! section_handler {
    ($name:ident, $payload:ty, $method:ident) => {
        pub async fn $name(
            State(state): State<AppState>,
            Path(record_id): Path<String>,
            Json(request): Json<SectionRequest<$payload>>,
        ) -> AppResult<Json<Value>> {
            let record = parse_record_id(&record_id)?;
            let user = parse_user_id(&request.user_id)?;
            let updated = state.core.records.$method(record, request.payload, user).await?;
            Ok(Json(updated))
        }
    };
}

section_handler!(update_refraction_handler, RefractionUpdate, update_refraction);
section_handler!(update_diagnosis_handler, Vec<DiagnosisEntry>, update_diagnosis);
section_handler!(update_treatment_handler, TreatmentUpdate, update_treatment);
section_handler!(update_iop_handler, IopUpdate, update_iop);
section_handler!(update_visual_acuity_handler, VisualAcuityUpdate, update_visual_acuity);
section_handler!(update_anterior_segment_handler, Value, update_anterior_segment);
section_handler!(update_posterior_segment_handler, Value, update_posterior_segment);
section_handler!(update_keratometry_handler, Value, update_keratometry);
section_handler!(update_pathology_findings_handler, Value, update_pathology_findings);
section_handler!(update_notes_handler, Value, update_notes);
section_handler!(update_chief_complaint_handler, Value, update_chief_complaint);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkRequest {
    user_id: String,
    reference_id: String,
}

pub async fn link_prescription_handler(
    State(state): State<AppState>,
    Path(record_id): Path<String>,
    Json(request): Json<LinkRequest>,
) -> AppResult<Json<Value>> {
    let record = parse_record_id(&record_id)?;
    let user = parse_user_id(&request.user_id)?;
    let reference = parse_record_id(&request.reference_id)?;
    let updated = state.core.records.link_prescription(record, reference, user).await?;
    Ok(Json(updated))
}

pub async fn link_ivt_handler(
    State(state): State<AppState>,
    Path(record_id): Path<String>,
    Json(request): Json<LinkRequest>,
) -> AppResult<Json<Value>> {
    let record = parse_record_id(&record_id)?;
    let user = parse_user_id(&request.user_id)?;
    let reference = parse_record_id(&request.reference_id)?;
    let updated = state.core.records.link_ivt(record, reference, user).await?;
    Ok(Json(updated))
}
