//! Device adapters: raw device output → normalized measurement records.
//!
//! Each adapter knows one device family's export format. The registry looks
//! adapters up by device type; unknown types get a no-op adapter whose
//! outcomes carry `NO_ADAPTER`.

pub mod fundus;
pub mod oct;
pub mod parse;
pub mod refractometer;
pub mod specular;
pub mod tonometer;

use crate::error::Result;
use crate::ports::{IntegrationLogStore, MeasurementSink};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use oculink_model::{
    Device, DeviceId, DeviceMeasurement, DeviceType, ExamId, InitiatedBy, IntegrationLogEntry,
    IntegrationStatus, Laterality, MeasurementType, PatientId, PatientInfo, ProcessingCounts,
    QualityBlock, QualityFactor, SourceChannel,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of `validate`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationOutcome {
    pub is_valid: bool,
    pub errors: Vec<String>,
}

impl ValidationOutcome {
    pub fn ok() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
        }
    }

    pub fn from_errors(errors: Vec<String>) -> Self {
        Self {
            is_valid: errors.is_empty(),
            errors,
        }
    }
}

/// Adapter-produced measurement content, merged with identity by the
/// processing pipeline.
#[derive(Debug, Clone)]
pub struct TransformedMeasurement {
    pub measurement_type: MeasurementType,
    pub measurement_date: DateTime<Utc>,
    pub eye: Option<Laterality>,
    pub values: Value,
    pub quality: QualityBlock,
    pub interpretation: Option<String>,
    pub findings: Vec<String>,
    /// Original envelope, preserved verbatim.
    pub raw_data: Value,
}

/// Context handed to `parse_file`.
#[derive(Debug, Clone)]
pub struct ParseContext {
    pub device_type: DeviceType,
    pub device: Option<DeviceId>,
    pub patient: Option<PatientId>,
    pub source: SourceChannel,
}

impl ParseContext {
    pub fn for_type(device_type: DeviceType) -> Self {
        Self {
            device_type,
            device: None,
            patient: None,
            source: SourceChannel::Manual,
        }
    }

    pub fn for_device(device: &Device, source: SourceChannel) -> Self {
        Self {
            device_type: device.device_type,
            device: Some(device.id.clone()),
            patient: None,
            source,
        }
    }
}

/// Result of a full `process` run.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub measurement_ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<AdapterErrorInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdapterErrorInfo {
    pub code: String,
    pub message: String,
}

impl ProcessOutcome {
    pub fn failure(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            measurement_ids: None,
            error: Some(AdapterErrorInfo {
                code: code.into(),
                message: message.into(),
            }),
        }
    }
}

/// One device family's parsing and normalization rules.
#[async_trait]
pub trait DeviceAdapter: Send + Sync {
    fn device_type(&self) -> DeviceType;
    fn measurement_type(&self) -> MeasurementType;

    /// Structural validation: required fields, numeric ranges.
    fn validate(&self, data: &Value) -> ValidationOutcome;

    /// Map one validated record into normalized measurement content.
    fn transform(&self, data: &Value) -> Result<TransformedMeasurement>;

    /// Parse a downloaded file into raw records for `validate`/`transform`.
    async fn parse_file(&self, path: &Path, ctx: &ParseContext) -> Result<Vec<Value>>;

    /// Pull patient identity out of a parsed record, when the format
    /// carries any.
    fn extract_patient_demographics(&self, _parsed: &Value) -> Option<PatientInfo> {
        None
    }
}

// ---- shared validation helpers ----

/// Collect `field is required` errors for absent/null fields.
pub fn require_fields(data: &Value, fields: &[&str]) -> Vec<String> {
    fields
        .iter()
        .filter(|field| data.get(**field).is_none_or(Value::is_null))
        .map(|field| format!("{field} is required"))
        .collect()
}

/// Range check on an optional numeric field.
pub fn check_range(data: &Value, field: &str, min: f64, max: f64) -> Option<String> {
    let value = data.get(field)?.as_f64()?;
    if value < min || value > max {
        Some(format!("{field} out of range: {value} not in [{min}, {max}]"))
    } else {
        None
    }
}

/// Build a quality factor where larger is better.
pub fn factor_at_least(name: &str, value: f64, threshold: f64) -> QualityFactor {
    QualityFactor {
        name: name.to_string(),
        value,
        acceptable: value >= threshold,
        threshold,
    }
}

/// Build a quality factor where smaller is better.
pub fn factor_at_most(name: &str, value: f64, threshold: f64) -> QualityFactor {
    QualityFactor {
        name: name.to_string(),
        value,
        acceptable: value <= threshold,
        threshold,
    }
}

/// Overall score: share of acceptable factors, 0-100.
pub fn overall_quality(factors: &[QualityFactor]) -> f64 {
    if factors.is_empty() {
        return 0.0;
    }
    let acceptable = factors.iter().filter(|f| f.acceptable).count();
    (acceptable as f64 / factors.len() as f64 * 100.0).round()
}

/// Adapter lookup by device type.
#[derive(Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<DeviceType, Arc<dyn DeviceAdapter>>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("types", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl AdapterRegistry {
    pub fn empty() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// Registry with every built-in adapter.
    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(specular::SpecularMicroscopeAdapter));
        registry.register(Arc::new(tonometer::TonometerAdapter));
        let refractometer = Arc::new(refractometer::RefractometerAdapter);
        registry
            .adapters
            .insert(DeviceType::Keratometer, refractometer.clone());
        registry.register(refractometer);
        registry.register(Arc::new(oct::OctAdapter));
        registry.register(Arc::new(fundus::FundusCameraAdapter));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn DeviceAdapter>) {
        self.adapters.insert(adapter.device_type(), adapter);
    }

    pub fn lookup(&self, device_type: DeviceType) -> Option<Arc<dyn DeviceAdapter>> {
        self.adapters.get(&device_type).cloned()
    }

    pub fn registered_types(&self) -> Vec<DeviceType> {
        self.adapters.keys().copied().collect()
    }
}

/// Runs the full adapter pipeline: validate → transform → persist → log.
#[derive(Clone)]
pub struct AdapterService {
    registry: AdapterRegistry,
    sink: Arc<dyn MeasurementSink>,
    logs: Arc<dyn IntegrationLogStore>,
}

impl std::fmt::Debug for AdapterService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterService")
            .field("registry", &self.registry)
            .finish()
    }
}

impl AdapterService {
    pub fn new(
        registry: AdapterRegistry,
        sink: Arc<dyn MeasurementSink>,
        logs: Arc<dyn IntegrationLogStore>,
    ) -> Self {
        Self {
            registry,
            sink,
            logs,
        }
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    /// Persist an image record for file-centric captures.
    pub async fn save_image(&self, image: &oculink_model::DeviceImage) -> Result<String> {
        self.sink.save_image(image).await
    }

    /// Process already-parsed records for one patient. Per-record failures
    /// do not abort the batch; the log entry becomes `PARTIAL`.
    pub async fn process(
        &self,
        device: &Device,
        records: &[Value],
        patient: &PatientId,
        exam: Option<&ExamId>,
        source: SourceChannel,
        initiated_by: InitiatedBy,
    ) -> ProcessOutcome {
        let Some(adapter) = self.registry.lookup(device.device_type) else {
            return ProcessOutcome::failure(
                "NO_ADAPTER",
                format!("no adapter for device type {}", device.device_type),
            );
        };

        let mut entry = IntegrationLogEntry::begin(
            device.id.clone(),
            device.device_type.to_string(),
            "measurement_import",
            format!("{:?}", device.protocol).to_lowercase(),
            initiated_by,
        );
        let started = std::time::Instant::now();

        let mut measurement_ids = Vec::new();
        let mut failures = Vec::new();

        for record in records {
            match self
                .process_one(adapter.as_ref(), device, record, patient, exam, source)
                .await
            {
                Ok(id) => measurement_ids.push(id),
                Err(message) => {
                    warn!(device = %device.id, error = %message, "record rejected");
                    failures.push(message);
                }
            }
        }

        let status = match (measurement_ids.is_empty(), failures.is_empty()) {
            (false, true) => IntegrationStatus::Success,
            (false, false) => IntegrationStatus::Partial,
            (true, _) => IntegrationStatus::Failed,
        };
        entry = entry.complete(status);
        entry.processing = Some(ProcessingCounts {
            records_processed: measurement_ids.len() as u32,
            records_failed: failures.len() as u32,
            processing_time: started.elapsed().as_millis() as u64,
        });
        entry.created_records = Some(oculink_model::CreatedRecords {
            device_measurements: measurement_ids.clone(),
            device_images: Vec::new(),
            count: measurement_ids.len() as u32,
        });
        if let Err(e) = self.logs.append(&entry).await {
            warn!(device = %device.id, error = %e, "integration log write failed");
        }

        if measurement_ids.is_empty() {
            let message = failures.join("; ");
            ProcessOutcome::failure("VALIDATION_FAILED", message)
        } else {
            ProcessOutcome {
                success: true,
                measurement_ids: Some(measurement_ids),
                error: None,
            }
        }
    }

    async fn process_one(
        &self,
        adapter: &dyn DeviceAdapter,
        device: &Device,
        record: &Value,
        patient: &PatientId,
        exam: Option<&ExamId>,
        source: SourceChannel,
    ) -> std::result::Result<String, String> {
        let validation = adapter.validate(record);
        if !validation.is_valid {
            return Err(validation.errors.join(", "));
        }

        let transformed = adapter.transform(record).map_err(|e| e.to_string())?;
        let measurement = DeviceMeasurement {
            device: device.id.clone(),
            patient: patient.clone(),
            exam: exam.cloned(),
            measurement_type: transformed.measurement_type,
            measurement_date: transformed.measurement_date,
            eye: transformed.eye,
            values: transformed.values,
            quality: transformed.quality,
            interpretation: transformed.interpretation,
            findings: transformed.findings,
            source_channel: source,
            raw_data: transformed.raw_data,
        };

        let id = self
            .sink
            .save_measurement(&measurement)
            .await
            .map_err(|e| e.to_string())?;
        debug!(device = %device.id, measurement = %id, "measurement persisted");
        Ok(id)
    }
}
