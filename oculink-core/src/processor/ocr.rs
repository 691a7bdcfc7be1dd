//! OCR microservice client.
//!
//! The service is a black box: `POST /api/ocr/process` for image/PDF text
//! extraction, `POST /api/ocr/dicom` for structured DICOM metadata, and
//! `GET /health`. The trait is the seam tests script.

use crate::adapters::parse::{parse_flexible_date, parse_laterality};
use crate::error::{IntegrationError, Result};
use async_trait::async_trait;
use oculink_model::{Gender, PatientInfo};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Request body for both OCR endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct OcrRequest {
    pub file_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extract_thumbnail: Option<bool>,
}

/// Identity fields as the service reports them.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OcrExtractedInfo {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub patient_id: Option<String>,
    pub date_of_birth: Option<String>,
    pub gender: Option<String>,
    pub laterality: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OcrResponse {
    pub extracted_info: Option<OcrExtractedInfo>,
    pub ocr_text: Option<String>,
    pub ocr_confidence: Option<f64>,
    pub error: Option<String>,
}

impl OcrResponse {
    /// Convert the wire shape into a [`PatientInfo`]; confidence defaults
    /// to 0.6 when the service does not report one.
    pub fn to_patient_info(&self) -> Option<PatientInfo> {
        let extracted = self.extracted_info.as_ref()?;
        let mut info = PatientInfo {
            first_name: extracted.first_name.clone(),
            last_name: extracted.last_name.clone(),
            patient_id: extracted.patient_id.clone(),
            date_of_birth: extracted
                .date_of_birth
                .as_deref()
                .and_then(parse_flexible_date),
            ..Default::default()
        };
        info.gender = extracted
            .gender
            .as_deref()
            .and_then(|raw| match raw.to_ascii_lowercase().as_str() {
                "m" | "male" | "h" | "homme" => Some(Gender::Male),
                "f" | "female" | "femme" => Some(Gender::Female),
                _ => None,
            });
        info.laterality = extracted.laterality.as_deref().and_then(parse_laterality);

        if info.is_empty() {
            return None;
        }
        info.confidence = self.ocr_confidence.unwrap_or(0.6);
        Some(info)
    }
}

/// OCR microservice operations.
#[async_trait]
pub trait OcrClient: Send + Sync {
    /// Free-text OCR over an image or PDF.
    async fn process(&self, request: &OcrRequest) -> Result<OcrResponse>;
    /// Structured metadata extraction for DICOM-family files.
    async fn process_dicom(&self, request: &OcrRequest) -> Result<OcrResponse>;
    async fn health(&self) -> Result<bool>;
}

/// HTTP client against `OCR_SERVICE_URL`.
#[derive(Debug, Clone)]
pub struct HttpOcrClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpOcrClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn post(&self, endpoint: &str, request: &OcrRequest) -> Result<OcrResponse> {
        let url = format!("{}{endpoint}", self.base_url);
        debug!(url = %url, file = %request.file_path, "ocr request");
        let response = self.client.post(&url).json(request).send().await?;
        if !response.status().is_success() {
            return Err(IntegrationError::Transport(format!(
                "ocr service returned {}",
                response.status()
            )));
        }
        let body: OcrResponse = response.json().await?;
        if let Some(error) = &body.error {
            return Err(IntegrationError::Transport(format!("ocr error: {error}")));
        }
        Ok(body)
    }
}

#[async_trait]
impl OcrClient for HttpOcrClient {
    async fn process(&self, request: &OcrRequest) -> Result<OcrResponse> {
        self.post("/api/ocr/process", request).await
    }

    async fn process_dicom(&self, request: &OcrRequest) -> Result<OcrResponse> {
        self.post("/api/ocr/dicom", request).await
    }

    async fn health(&self) -> Result<bool> {
        let url = format!("{}/health", self.base_url);
        match self.client.get(&url).send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(_) => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oculink_model::Laterality;

    #[test]
    fn response_maps_to_patient_info() {
        let response = OcrResponse {
            extracted_info: Some(OcrExtractedInfo {
                first_name: Some("Jean".into()),
                last_name: Some("Dupont".into()),
                patient_id: Some("A12345".into()),
                date_of_birth: Some("1980-01-15".into()),
                gender: Some("male".into()),
                laterality: Some("OD".into()),
            }),
            ocr_text: None,
            ocr_confidence: Some(0.83),
            error: None,
        };
        let info = response.to_patient_info().unwrap();
        assert_eq!(info.last_name.as_deref(), Some("Dupont"));
        assert_eq!(info.gender, Some(Gender::Male));
        assert_eq!(info.laterality, Some(Laterality::OD));
        assert!((info.confidence - 0.83).abs() < 1e-9);
    }

    #[test]
    fn empty_extraction_yields_none_and_default_confidence_applies() {
        let response = OcrResponse::default();
        assert!(response.to_patient_info().is_none());

        let response = OcrResponse {
            extracted_info: Some(OcrExtractedInfo {
                last_name: Some("Dupont".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let info = response.to_patient_info().unwrap();
        assert!((info.confidence - 0.6).abs() < 1e-9);
    }
}
