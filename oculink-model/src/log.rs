use crate::ids::DeviceId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Lifecycle status of one ingestion attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntegrationStatus {
    Processing,
    Success,
    Partial,
    Failed,
}

/// Who triggered the attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InitiatedBy {
    Device,
    Manual,
    Scheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: String,
    pub message: String,
    pub severity: ErrorSeverity,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ProcessingCounts {
    pub records_processed: u32,
    pub records_failed: u32,
    /// Wall-clock milliseconds the attempt took.
    pub processing_time: u64,
}

/// Audit capture of an inbound webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookAudit {
    pub signature: String,
    pub signature_verified: bool,
    pub headers: BTreeMap<String, String>,
    pub payload: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

/// References to the records one attempt created.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreatedRecords {
    #[serde(default)]
    pub device_measurements: Vec<String>,
    #[serde(default)]
    pub device_images: Vec<String>,
    pub count: u32,
}

/// One record per ingestion attempt, written through the log store port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationLogEntry {
    pub device: DeviceId,
    pub device_type: String,
    pub event_type: String,
    pub status: IntegrationStatus,
    pub integration_method: String,
    pub initiated_by: InitiatedBy,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub source: SourceInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookAudit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<ErrorDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing: Option<ProcessingCounts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_records: Option<CreatedRecords>,
}

impl IntegrationLogEntry {
    /// Start a `PROCESSING` entry; callers complete or fail it later.
    pub fn begin(
        device: DeviceId,
        device_type: impl Into<String>,
        event_type: impl Into<String>,
        method: impl Into<String>,
        initiated_by: InitiatedBy,
    ) -> Self {
        Self {
            device,
            device_type: device_type.into(),
            event_type: event_type.into(),
            status: IntegrationStatus::Processing,
            integration_method: method.into(),
            initiated_by,
            started_at: Utc::now(),
            completed_at: None,
            source: SourceInfo::default(),
            webhook: None,
            error_details: None,
            processing: None,
            created_records: None,
        }
    }

    pub fn complete(mut self, status: IntegrationStatus) -> Self {
        self.status = status;
        self.completed_at = Some(Utc::now());
        self
    }

    pub fn fail(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.status = IntegrationStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error_details = Some(ErrorDetails {
            code: code.into(),
            message: message.into(),
            severity: ErrorSeverity::Error,
        });
        self
    }
}
