//! Fundus camera adapter.
//!
//! Fundus exports are plain images; there is no structured payload to mine.
//! The adapter records the image handoff as a measurement so downstream
//! views see the capture, and leaves identity extraction to the universal
//! file processor's filename and OCR strategies.

use crate::adapters::parse::parse_laterality;
use crate::adapters::{
    DeviceAdapter, ParseContext, TransformedMeasurement, ValidationOutcome, require_fields,
};
use crate::error::{IntegrationError, Result};
use async_trait::async_trait;
use chrono::Utc;
use oculink_model::{DeviceType, MeasurementType, QualityBlock, QualityFactor};
use serde_json::{Value, json};
use std::path::Path;

const SUPPORTED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "tif", "tiff", "bmp"];

#[derive(Debug, Clone, Copy)]
pub struct FundusCameraAdapter;

#[async_trait]
impl DeviceAdapter for FundusCameraAdapter {
    fn device_type(&self) -> DeviceType {
        DeviceType::FundusCamera
    }

    fn measurement_type(&self) -> MeasurementType {
        MeasurementType::FundusImage
    }

    fn validate(&self, data: &Value) -> ValidationOutcome {
        ValidationOutcome::from_errors(require_fields(data, &["file_name"]))
    }

    fn transform(&self, data: &Value) -> Result<TransformedMeasurement> {
        let file_name = data
            .get("file_name")
            .and_then(Value::as_str)
            .ok_or_else(|| IntegrationError::Parse("fundus record without file_name".into()))?;

        let size = data.get("size_bytes").and_then(Value::as_u64).unwrap_or(0);
        let factors = vec![QualityFactor {
            name: "image_non_empty".to_string(),
            value: size as f64,
            acceptable: size > 0,
            threshold: 1.0,
        }];

        Ok(TransformedMeasurement {
            measurement_type: MeasurementType::FundusImage,
            measurement_date: Utc::now(),
            eye: parse_laterality(file_name),
            values: json!({
                "file_name": file_name,
                "size_bytes": size,
            }),
            quality: QualityBlock {
                overall: if size > 0 { 100.0 } else { 0.0 },
                factors,
            },
            interpretation: None,
            findings: Vec::new(),
            raw_data: data.clone(),
        })
    }

    async fn parse_file(&self, path: &Path, _ctx: &ParseContext) -> Result<Vec<Value>> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if !SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
            return Err(IntegrationError::Parse(format!(
                "{} is not a fundus image",
                path.display()
            )));
        }
        let metadata = tokio::fs::metadata(path).await?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("image")
            .to_string();

        Ok(vec![json!({
            "file_name": file_name,
            "size_bytes": metadata.len(),
            "format": extension,
        })])
    }
}
