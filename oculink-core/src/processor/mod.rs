//! Universal file processor.
//!
//! Multi-strategy identity extraction with short-circuit on sufficient
//! confidence: structured DICOM metadata → device adapter → filename →
//! OCR. A partial filename result is kept as a floor so a file never
//! leaves with less identity than its name carried.

pub mod detect;
pub mod filename;
pub mod ocr;

pub use detect::infer_device_type;
pub use filename::parse_filename;
pub use ocr::{HttpOcrClient, OcrClient, OcrRequest, OcrResponse};

use crate::adapters::{AdapterRegistry, ParseContext};
use oculink_model::{DeviceType, ExtractionMethod, PatientInfo};
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

const ADAPTER_ACCEPT_THRESHOLD: f64 = 0.70;
const FILENAME_ACCEPT_THRESHOLD: f64 = 0.60;
const DICOM_CONFIDENCE: f64 = 0.95;

const DICOM_EXTENSIONS: &[&str] = &["dcm", "dicom", "dic"];
const OCR_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "tif", "tiff", "pdf"];

/// Options for one processing run.
#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    pub device_type_hint: Option<DeviceType>,
    pub use_ocr: bool,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            device_type_hint: None,
            use_ocr: true,
        }
    }
}

/// Outcome of the strategy chain.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessOutput {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient_info: Option<PatientInfo>,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<ExtractionMethod>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_data: Option<Value>,
    pub processing_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Cumulative per-strategy acceptance counters.
#[derive(Debug, Default)]
struct StrategyCounters {
    structured_meta: AtomicU64,
    adapter: AtomicU64,
    filename: AtomicU64,
    ocr: AtomicU64,
    filename_partial: AtomicU64,
    failures: AtomicU64,
}

/// Serializable counter snapshot for stats endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct StrategyStats {
    pub structured_meta: u64,
    pub adapter: u64,
    pub filename: u64,
    pub ocr: u64,
    pub filename_partial: u64,
    pub failures: u64,
}

/// Strategy-chain processor shared by the queue handlers and the manual
/// upload path.
#[derive(Clone)]
pub struct UniversalFileProcessor {
    registry: AdapterRegistry,
    ocr: Arc<dyn OcrClient>,
    counters: Arc<StrategyCounters>,
}

impl std::fmt::Debug for UniversalFileProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UniversalFileProcessor")
            .field("registry", &self.registry)
            .finish()
    }
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default()
}

impl UniversalFileProcessor {
    pub fn new(registry: AdapterRegistry, ocr: Arc<dyn OcrClient>) -> Self {
        Self {
            registry,
            ocr,
            counters: Arc::new(StrategyCounters::default()),
        }
    }

    pub fn strategy_stats(&self) -> StrategyStats {
        StrategyStats {
            structured_meta: self.counters.structured_meta.load(Ordering::Relaxed),
            adapter: self.counters.adapter.load(Ordering::Relaxed),
            filename: self.counters.filename.load(Ordering::Relaxed),
            ocr: self.counters.ocr.load(Ordering::Relaxed),
            filename_partial: self.counters.filename_partial.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }

    /// Run the strategy chain over a local file.
    pub async fn process_file(
        &self,
        path: &Path,
        options: &ProcessorOptions,
    ) -> ProcessOutput {
        let started = std::time::Instant::now();
        let extension = extension_of(path);
        let device_type = options
            .device_type_hint
            .or_else(|| infer_device_type(path));
        debug!(path = %path.display(), ?device_type, "processing file");

        // 1. Structured metadata for DICOM-family files.
        if DICOM_EXTENSIONS.contains(&extension.as_str())
            && let Some(mut info) = self.try_dicom(path, device_type).await
        {
            info.confidence = DICOM_CONFIDENCE;
            info.method = Some(ExtractionMethod::StructuredMeta);
            self.counters.structured_meta.fetch_add(1, Ordering::Relaxed);
            return self.accept(info, None, started);
        }

        // 2. Adapter-based extraction.
        let mut adapter_raw = None;
        if let Some(device_type) = device_type
            && let Some(adapter) = self.registry.lookup(device_type)
        {
            let ctx = ParseContext::for_type(device_type);
            match adapter.parse_file(path, &ctx).await {
                Ok(records) => {
                    let best = records
                        .iter()
                        .filter_map(|record| adapter.extract_patient_demographics(record))
                        .max_by(|a, b| {
                            a.confidence
                                .partial_cmp(&b.confidence)
                                .unwrap_or(std::cmp::Ordering::Equal)
                        });
                    adapter_raw = Some(Value::Array(records));
                    if let Some(mut info) = best
                        && info.confidence >= ADAPTER_ACCEPT_THRESHOLD
                    {
                        info.method = Some(ExtractionMethod::Adapter);
                        self.counters.adapter.fetch_add(1, Ordering::Relaxed);
                        return self.accept(info, adapter_raw, started);
                    }
                }
                Err(e) => debug!(path = %path.display(), error = %e, "adapter strategy declined"),
            }
        }

        // 3. Filename conventions.
        let filename_info = parse_filename(path);
        if let Some(info) = &filename_info
            && info.confidence >= FILENAME_ACCEPT_THRESHOLD
        {
            self.counters.filename.fetch_add(1, Ordering::Relaxed);
            return self.accept(info.clone(), adapter_raw, started);
        }

        // 4. OCR fallback for images and PDFs.
        if options.use_ocr && OCR_EXTENSIONS.contains(&extension.as_str()) {
            let request = OcrRequest {
                file_path: path.to_string_lossy().into_owned(),
                device_type: device_type.map(|t| t.to_string()),
                extract_thumbnail: None,
            };
            match self.ocr.process(&request).await {
                Ok(response) => {
                    if let Some(mut info) = response.to_patient_info() {
                        // OCR is primary; the filename fills holes.
                        if let Some(partial) = &filename_info {
                            info.merge_missing_from(partial);
                        }
                        info.method = Some(ExtractionMethod::Ocr);
                        self.counters.ocr.fetch_add(1, Ordering::Relaxed);
                        return self.accept(info, adapter_raw, started);
                    }
                }
                Err(e) => warn!(path = %path.display(), error = %e, "ocr strategy failed"),
            }
        }

        // Partial filename info beats nothing.
        if let Some(mut info) = filename_info {
            info.method = Some(ExtractionMethod::FilenamePartial);
            self.counters.filename_partial.fetch_add(1, Ordering::Relaxed);
            return self.accept(info, adapter_raw, started);
        }

        self.counters.failures.fetch_add(1, Ordering::Relaxed);
        ProcessOutput {
            success: false,
            patient_info: None,
            confidence: 0.0,
            method: None,
            raw_data: None,
            processing_time_ms: started.elapsed().as_millis() as u64,
            error: Some("Unable to extract patient information".to_string()),
        }
    }

    async fn try_dicom(
        &self,
        path: &Path,
        device_type: Option<DeviceType>,
    ) -> Option<PatientInfo> {
        let request = OcrRequest {
            file_path: path.to_string_lossy().into_owned(),
            device_type: device_type.map(|t| t.to_string()),
            extract_thumbnail: None,
        };
        match self.ocr.process_dicom(&request).await {
            Ok(response) => response.to_patient_info(),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "dicom strategy declined");
                None
            }
        }
    }

    fn accept(
        &self,
        info: PatientInfo,
        raw_data: Option<Value>,
        started: std::time::Instant,
    ) -> ProcessOutput {
        ProcessOutput {
            success: true,
            confidence: info.confidence,
            method: info.method,
            patient_info: Some(info),
            raw_data,
            processing_time_ms: started.elapsed().as_millis() as u64,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{IntegrationError, Result};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU64;

    /// Scripted OCR double: DICOM answers from a canned response, plain OCR
    /// counts calls.
    struct FakeOcr {
        dicom: Option<OcrResponse>,
        process: Option<OcrResponse>,
        process_calls: AtomicU64,
    }

    impl FakeOcr {
        fn none() -> Self {
            Self {
                dicom: None,
                process: None,
                process_calls: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl OcrClient for FakeOcr {
        async fn process(&self, _request: &OcrRequest) -> Result<OcrResponse> {
            self.process_calls.fetch_add(1, Ordering::SeqCst);
            self.process
                .clone()
                .ok_or_else(|| IntegrationError::Transport("ocr unavailable".into()))
        }

        async fn process_dicom(&self, _request: &OcrRequest) -> Result<OcrResponse> {
            self.dicom
                .clone()
                .ok_or_else(|| IntegrationError::Transport("dicom unavailable".into()))
        }

        async fn health(&self) -> Result<bool> {
            Ok(true)
        }
    }

    fn dicom_response() -> OcrResponse {
        OcrResponse {
            extracted_info: Some(ocr::OcrExtractedInfo {
                first_name: Some("Jean".into()),
                last_name: Some("Dupont".into()),
                patient_id: Some("A12345".into()),
                date_of_birth: Some("1980-01-15".into()),
                gender: Some("male".into()),
                laterality: None,
            }),
            ocr_text: None,
            ocr_confidence: None,
            error: None,
        }
    }

    fn processor(ocr: FakeOcr) -> UniversalFileProcessor {
        UniversalFileProcessor::new(AdapterRegistry::with_builtin(), Arc::new(ocr))
    }

    #[tokio::test]
    async fn dicom_strategy_wins_at_095() {
        let processor = processor(FakeOcr {
            dicom: Some(dicom_response()),
            process: None,
            process_calls: AtomicU64::new(0),
        });

        let output = processor
            .process_file(
                Path::new("DUPONT_JEAN_A12345_19800115_M_OCT.dcm"),
                &ProcessorOptions::default(),
            )
            .await;

        assert!(output.success);
        assert_eq!(output.method, Some(ExtractionMethod::StructuredMeta));
        assert!((output.confidence - 0.95).abs() < 1e-9);
        let info = output.patient_info.unwrap();
        assert_eq!(info.last_name.as_deref(), Some("Dupont"));

        let stats = processor.strategy_stats();
        assert_eq!(stats.structured_meta, 1);
        assert_eq!(stats.adapter + stats.filename + stats.ocr, 0);
    }

    #[tokio::test]
    async fn filename_strategy_with_ocr_disabled() {
        let processor = processor(FakeOcr::none());
        let output = processor
            .process_file(
                Path::new("DUPONT_JEAN_A12345_19800115.jpg"),
                &ProcessorOptions {
                    use_ocr: false,
                    ..Default::default()
                },
            )
            .await;

        assert!(output.success);
        assert_eq!(output.method, Some(ExtractionMethod::Filename));
        assert!((output.confidence - 1.0).abs() < 1e-9);
        let info = output.patient_info.unwrap();
        assert_eq!(info.last_name.as_deref(), Some("DUPONT"));
        assert_eq!(info.first_name.as_deref(), Some("JEAN"));
        assert_eq!(info.patient_id.as_deref(), Some("A12345"));
    }

    #[tokio::test]
    async fn ocr_merges_filename_holes() {
        let processor = processor(FakeOcr {
            dicom: None,
            process: Some(OcrResponse {
                extracted_info: Some(ocr::OcrExtractedInfo {
                    last_name: Some("DUPONT".into()),
                    first_name: None,
                    patient_id: None,
                    date_of_birth: None,
                    gender: None,
                    laterality: None,
                }),
                ocr_text: Some("DUPONT".into()),
                ocr_confidence: Some(0.7),
                error: None,
            }),
            process_calls: AtomicU64::new(0),
        });

        // Filename alone scores 0.30 + 0.25 = 0.55 < 0.60, so OCR runs and
        // the filename's patient id fills the hole.
        let output = processor
            .process_file(Path::new("DUPONT_A12345_capture.jpg"), &ProcessorOptions::default())
            .await;

        assert!(output.success);
        assert_eq!(output.method, Some(ExtractionMethod::Ocr));
        let info = output.patient_info.unwrap();
        assert_eq!(info.patient_id.as_deref(), Some("A12345"));
        assert!((output.confidence - 0.7).abs() < 1e-9);
    }

    #[tokio::test]
    async fn partial_filename_floor() {
        let processor = processor(FakeOcr::none());
        let output = processor
            .process_file(Path::new("MARTIN_capture.jpg"), &ProcessorOptions::default())
            .await;

        assert!(output.success);
        assert_eq!(output.method, Some(ExtractionMethod::FilenamePartial));
        assert!(output.confidence < FILENAME_ACCEPT_THRESHOLD);
        assert_eq!(processor.strategy_stats().filename_partial, 1);
    }

    #[tokio::test]
    async fn nothing_extractable_fails() {
        let processor = processor(FakeOcr::none());
        let output = processor
            .process_file(Path::new("IMG_1.jpg"), &ProcessorOptions::default())
            .await;

        assert!(!output.success);
        assert_eq!(
            output.error.as_deref(),
            Some("Unable to extract patient information")
        );
        assert_eq!(processor.strategy_stats().failures, 1);
    }
}
