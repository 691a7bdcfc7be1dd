use crate::ids::{DeviceId, ExamId, PatientId};
use crate::patient::Laterality;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kinds of normalized measurements adapters emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MeasurementType {
    SpecularMicroscopy,
    Tonometry,
    Refraction,
    Keratometry,
    OctScan,
    FundusImage,
}

/// Where the file entered the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceChannel {
    Webhook,
    ScheduledSync,
    Watcher,
    Manual,
}

/// One quality factor with its acceptability threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityFactor {
    pub name: String,
    pub value: f64,
    pub acceptable: bool,
    pub threshold: f64,
}

/// Adapter-computed quality summary. `overall` is 0-100.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualityBlock {
    pub overall: f64,
    #[serde(default)]
    pub factors: Vec<QualityFactor>,
}

/// Normalized measurement record handed to the persistence interface.
///
/// The adapter-specific payload lives in `values`; the untouched device
/// output is preserved under `raw_data` for audit and re-processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceMeasurement {
    pub device: DeviceId,
    pub patient: PatientId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exam: Option<ExamId>,
    pub measurement_type: MeasurementType,
    pub measurement_date: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eye: Option<Laterality>,
    pub values: Value,
    pub quality: QualityBlock,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interpretation: Option<String>,
    #[serde(default)]
    pub findings: Vec<String>,
    pub source_channel: SourceChannel,
    pub raw_data: Value,
}

/// Image record for file-centric devices (fundus, OCT exports).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceImage {
    pub device: DeviceId,
    pub patient: PatientId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exam: Option<ExamId>,
    pub file_name: String,
    pub content_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eye: Option<Laterality>,
    pub captured_at: DateTime<Utc>,
    pub source_channel: SourceChannel,
}
