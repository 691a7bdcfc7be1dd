//! Tonometer adapter (intraocular pressure).
//!
//! Exports are short key-value blocks, one line per eye
//! (`IOP R: 17` / `IOP L: 22`) or a single reading with an `EYE` key.

use crate::adapters::parse::{
    parse_flexible_date, parse_key_values, parse_laterality, parse_number, split_patient_name,
};
use crate::adapters::{
    DeviceAdapter, ParseContext, TransformedMeasurement, ValidationOutcome, check_range,
    factor_at_least, overall_quality, require_fields,
};
use crate::error::{IntegrationError, Result};
use async_trait::async_trait;
use chrono::Utc;
use oculink_model::{DeviceType, MeasurementType, PatientInfo, QualityBlock};
use serde_json::{Value, json};
use std::path::Path;

#[derive(Debug, Clone, Copy)]
pub struct TonometerAdapter;

const RIGHT_KEYS: &[&str] = &["IOP R", "IOP OD", "R", "OD", "RIGHT"];
const LEFT_KEYS: &[&str] = &["IOP L", "IOP OS", "L", "OS", "OG", "LEFT"];

#[async_trait]
impl DeviceAdapter for TonometerAdapter {
    fn device_type(&self) -> DeviceType {
        DeviceType::Tonometer
    }

    fn measurement_type(&self) -> MeasurementType {
        MeasurementType::Tonometry
    }

    fn validate(&self, data: &Value) -> ValidationOutcome {
        let mut errors = require_fields(data, &["eye", "iop"]);
        if let Some(error) = check_range(data, "iop", 0.0, 60.0) {
            errors.push(error);
        }
        ValidationOutcome::from_errors(errors)
    }

    fn transform(&self, data: &Value) -> Result<TransformedMeasurement> {
        let iop = data
            .get("iop")
            .and_then(Value::as_f64)
            .ok_or_else(|| IntegrationError::Parse("tonometry record without iop".into()))?;

        let factors = match data.get("reliability").and_then(Value::as_f64) {
            Some(reliability) => vec![factor_at_least("reliability", reliability, 70.0)],
            None => {
                // No device-reported reliability; fall back to a physiologic
                // plausibility check.
                vec![crate::adapters::factor_at_most(
                    "iop_plausible",
                    iop,
                    40.0,
                )]
            }
        };

        let interpretation = if iop > 21.0 {
            "Elevated intraocular pressure"
        } else if iop < 8.0 {
            "Ocular hypotony"
        } else {
            "Intraocular pressure within normal limits"
        };
        let mut findings = Vec::new();
        if iop > 21.0 {
            findings.push(format!("IOP {iop:.0} mmHg exceeds 21 mmHg"));
        }
        if iop < 8.0 {
            findings.push(format!("IOP {iop:.0} mmHg below 8 mmHg"));
        }

        let measurement_date = data
            .get("captured_at")
            .and_then(Value::as_str)
            .and_then(parse_flexible_date)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|naive| naive.and_utc())
            .unwrap_or_else(Utc::now);

        Ok(TransformedMeasurement {
            measurement_type: MeasurementType::Tonometry,
            measurement_date,
            eye: data
                .get("eye")
                .and_then(Value::as_str)
                .and_then(parse_laterality),
            values: json!({
                "iop": iop,
                "method": data.get("method").cloned().unwrap_or(Value::Null),
            }),
            quality: QualityBlock {
                overall: overall_quality(&factors),
                factors,
            },
            interpretation: Some(interpretation.to_string()),
            findings,
            raw_data: data.clone(),
        })
    }

    async fn parse_file(&self, path: &Path, _ctx: &ParseContext) -> Result<Vec<Value>> {
        let text = tokio::fs::read_to_string(path).await?;
        let kv = parse_key_values(&text);

        let date = kv
            .get("DATE")
            .or_else(|| kv.get("EXAM DATE"))
            .cloned()
            .unwrap_or_default();
        let shared = |eye: &str, iop: f64| {
            json!({
                "eye": eye,
                "iop": iop,
                "captured_at": date,
                "reliability": kv.get("RELIABILITY").and_then(|v| parse_number(v)),
                "method": kv.get("METHOD").cloned(),
                "patient_name": kv.get("NAME").or_else(|| kv.get("PATIENT")).cloned(),
                "patient_id": kv.get("ID").or_else(|| kv.get("PATIENT ID")).cloned(),
            })
        };

        let mut records = Vec::new();
        for key in RIGHT_KEYS {
            if let Some(iop) = kv.get(*key).and_then(|v| parse_number(v)) {
                records.push(shared("OD", iop));
                break;
            }
        }
        for key in LEFT_KEYS {
            if let Some(iop) = kv.get(*key).and_then(|v| parse_number(v)) {
                records.push(shared("OS", iop));
                break;
            }
        }
        if records.is_empty()
            && let Some(iop) = kv.get("IOP").and_then(|v| parse_number(v))
        {
            let eye = kv
                .get("EYE")
                .and_then(|raw| parse_laterality(raw))
                .map(|l| l.to_string())
                .unwrap_or_else(|| "OU".to_string());
            records.push(shared(&eye, iop));
        }

        if records.is_empty() {
            return Err(IntegrationError::Parse(format!(
                "no IOP readings in {}",
                path.display()
            )));
        }
        Ok(records)
    }

    fn extract_patient_demographics(&self, parsed: &Value) -> Option<PatientInfo> {
        let mut info = PatientInfo::default();
        if let Some(name) = parsed.get("patient_name").and_then(Value::as_str) {
            let (last, first) = split_patient_name(name);
            info.last_name = last;
            info.first_name = first;
        }
        if let Some(id) = parsed.get("patient_id").and_then(Value::as_str) {
            info.patient_id = Some(id.to_string());
        }
        if info.is_empty() {
            return None;
        }
        let mut confidence: f64 = 0.0;
        if info.last_name.is_some() {
            confidence += 0.30;
        }
        if info.first_name.is_some() {
            confidence += 0.20;
        }
        if info.patient_id.is_some() {
            confidence += 0.25;
        }
        info.confidence = confidence.min(1.0);
        Some(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oculink_model::Laterality;

    const EXPORT: &str = "\
PATIENT: MARTIN, Sophie
ID: B991200000023
DATE: 2023-09-05
METHOD: NCT
IOP R: 17
IOP L: 24
";

    fn ctx() -> ParseContext {
        ParseContext::for_type(DeviceType::Tonometer)
    }

    #[tokio::test]
    async fn one_record_per_eye() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("iop.txt");
        tokio::fs::write(&path, EXPORT).await.unwrap();

        let records = TonometerAdapter.parse_file(&path, &ctx()).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["eye"], "OD");
        assert_eq!(records[0]["iop"], 17.0);
        assert_eq!(records[1]["eye"], "OS");
        assert_eq!(records[1]["iop"], 24.0);
    }

    #[test]
    fn elevated_pressure_flagged() {
        let record = json!({"eye": "OS", "iop": 24.0});
        let transformed = TonometerAdapter.transform(&record).unwrap();
        assert_eq!(transformed.eye, Some(Laterality::OS));
        assert_eq!(
            transformed.interpretation.as_deref(),
            Some("Elevated intraocular pressure")
        );
        assert_eq!(transformed.findings.len(), 1);
    }

    #[test]
    fn iop_range_is_zero_to_sixty() {
        let outcome = TonometerAdapter.validate(&json!({"eye": "OD", "iop": 75.0}));
        assert!(!outcome.is_valid);
        let outcome = TonometerAdapter.validate(&json!({"eye": "OD", "iop": 18.0}));
        assert!(outcome.is_valid);
    }
}
