//! Specular microscope adapter (corneal endothelium analysis).
//!
//! Exports arrive as CSV batches or per-exam key-value text. Normalized
//! metrics: ECD (cells/mm²), CV (%), hexagonality (%), average cell area
//! (µm²), CCT (µm), analyzed cell count.

use crate::adapters::parse::{
    parse_csv, parse_flexible_date, parse_key_values, parse_laterality, parse_number,
    split_patient_name,
};
use crate::adapters::{
    DeviceAdapter, ParseContext, TransformedMeasurement, ValidationOutcome, check_range,
    factor_at_least, factor_at_most, overall_quality, require_fields,
};
use crate::error::{IntegrationError, Result};
use async_trait::async_trait;
use chrono::Utc;
use oculink_model::{DeviceType, MeasurementType, PatientInfo, QualityBlock};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Copy)]
pub struct SpecularMicroscopeAdapter;

/// Vendor key variants → normalized field.
const KEY_MAP: &[(&str, &[&str])] = &[
    ("ecd", &["ECD", "CD", "CELL DENSITY", "CELLDENSITY", "DENSITY"]),
    ("cv", &["CV", "COEFF VARIATION", "COEFFICIENT OF VARIATION"]),
    ("hexagonality", &["HEX", "6A", "HEXAGONALITY", "HEX%"]),
    ("avg_cell_area", &["AVG", "AVE", "AVG AREA", "AVGCELLAREA", "MEAN CELL AREA"]),
    ("cct", &["CCT", "PACHY", "PACHYMETRY", "THICKNESS"]),
    ("cell_count", &["NUM", "N", "CELL COUNT", "CELLCOUNT", "CELLS"]),
];

const TEXT_KEYS: &[(&str, &[&str])] = &[
    ("eye", &["EYE", "SIDE", "LATERALITY"]),
    ("captured_at", &["DATE", "EXAM DATE", "EXAMDATE"]),
    ("patient_name", &["NAME", "PATIENT", "PATIENT NAME"]),
    ("patient_id", &["ID", "PATIENT ID", "PATIENTID", "PID"]),
    ("date_of_birth", &["DOB", "BIRTH", "BIRTHDATE", "DATE OF BIRTH"]),
];

fn record_from_map(raw: &HashMap<String, String>) -> Value {
    let upper: HashMap<String, &String> = raw
        .iter()
        .map(|(k, v)| (k.trim().to_ascii_uppercase(), v))
        .collect();
    let mut record = Map::new();

    for (field, variants) in KEY_MAP {
        for variant in *variants {
            if let Some(value) = upper.get(*variant)
                && let Some(number) = parse_number(value)
            {
                record.insert((*field).to_string(), json!(number));
                break;
            }
        }
    }
    for (field, variants) in TEXT_KEYS {
        for variant in *variants {
            if let Some(value) = upper.get(*variant) {
                record.insert((*field).to_string(), json!(value.trim()));
                break;
            }
        }
    }

    // Normalize the eye token so `validate` sees OD/OS/OU.
    if let Some(eye_raw) = record.get("eye").and_then(Value::as_str)
        && let Some(laterality) = parse_laterality(eye_raw)
    {
        record.insert("eye".into(), json!(laterality.to_string()));
    }

    Value::Object(record)
}

#[async_trait]
impl DeviceAdapter for SpecularMicroscopeAdapter {
    fn device_type(&self) -> DeviceType {
        DeviceType::SpecularMicroscope
    }

    fn measurement_type(&self) -> MeasurementType {
        MeasurementType::SpecularMicroscopy
    }

    fn validate(&self, data: &Value) -> ValidationOutcome {
        let mut errors = require_fields(data, &["eye", "ecd"]);
        for (field, min, max) in [
            ("ecd", 0.0, 6000.0),
            ("cv", 0.0, 100.0),
            ("hexagonality", 0.0, 100.0),
            ("avg_cell_area", 0.0, 5000.0),
            ("cct", 200.0, 900.0),
            ("cell_count", 1.0, 1000.0),
        ] {
            if let Some(error) = check_range(data, field, min, max) {
                errors.push(error);
            }
        }
        ValidationOutcome::from_errors(errors)
    }

    fn transform(&self, data: &Value) -> Result<TransformedMeasurement> {
        let ecd = data
            .get("ecd")
            .and_then(Value::as_f64)
            .ok_or_else(|| IntegrationError::Parse("specular record without ecd".into()))?;
        let cv = data.get("cv").and_then(Value::as_f64);
        let hexagonality = data.get("hexagonality").and_then(Value::as_f64);
        let cct = data.get("cct").and_then(Value::as_f64);
        let cell_count = data.get("cell_count").and_then(Value::as_f64);

        let mut factors = vec![factor_at_least("endothelial_cell_density", ecd, 2000.0)];
        if let Some(cv) = cv {
            factors.push(factor_at_most("coefficient_of_variation", cv, 40.0));
        }
        if let Some(hexagonality) = hexagonality {
            factors.push(factor_at_least("hexagonality", hexagonality, 50.0));
        }
        if let Some(cell_count) = cell_count {
            factors.push(factor_at_least("analyzed_cell_count", cell_count, 75.0));
        }

        let interpretation = if ecd >= 2500.0 {
            "Normal endothelial cell density"
        } else if ecd >= 1500.0 {
            "Reduced endothelial cell density"
        } else if ecd >= 1000.0 {
            "Severely reduced endothelial cell density"
        } else {
            "Critical endothelial cell loss; decompensation risk"
        };

        let mut findings = Vec::new();
        if let Some(cv) = cv
            && cv > 40.0
        {
            findings.push(format!("Polymegethism: CV {cv:.0}% exceeds 40%"));
        }
        if let Some(hexagonality) = hexagonality
            && hexagonality < 50.0
        {
            findings.push(format!("Pleomorphism: hexagonality {hexagonality:.0}% below 50%"));
        }
        if let Some(cct) = cct {
            if cct < 480.0 {
                findings.push(format!("Thin cornea: CCT {cct:.0} µm"));
            } else if cct > 620.0 {
                findings.push(format!("Thick cornea: CCT {cct:.0} µm"));
            }
        }

        let measurement_date = data
            .get("captured_at")
            .and_then(Value::as_str)
            .and_then(parse_flexible_date)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|naive| naive.and_utc())
            .unwrap_or_else(Utc::now);

        let eye = data
            .get("eye")
            .and_then(Value::as_str)
            .and_then(parse_laterality);

        let values = json!({
            "ecd": ecd,
            "cv": cv,
            "hexagonality": hexagonality,
            "avg_cell_area": data.get("avg_cell_area").and_then(Value::as_f64),
            "cct": cct,
            "cell_count": cell_count,
        });

        Ok(TransformedMeasurement {
            measurement_type: MeasurementType::SpecularMicroscopy,
            measurement_date,
            eye,
            values,
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
        let is_csv = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("csv"));

        let records: Vec<Value> = if is_csv {
            parse_csv(&text).iter().map(record_from_map).collect()
        } else {
            vec![record_from_map(&parse_key_values(&text))]
        };

        let records: Vec<Value> = records
            .into_iter()
            .filter(|record| record.get("ecd").is_some())
            .collect();
        if records.is_empty() {
            return Err(IntegrationError::Parse(format!(
                "no specular measurements in {}",
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
        info.date_of_birth = parsed
            .get("date_of_birth")
            .and_then(Value::as_str)
            .and_then(parse_flexible_date);
        info.laterality = parsed
            .get("eye")
            .and_then(Value::as_str)
            .and_then(parse_laterality);

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
        if info.date_of_birth.is_some() {
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

    fn ctx() -> ParseContext {
        ParseContext::for_type(DeviceType::SpecularMicroscope)
    }

    const KV_EXPORT: &str = "\
NAME: DUPONT, Jean
ID: A12345
DOB: 15/01/1980
DATE: 2023-09-05
EYE: OD
ECD: 2512
CV: 32
HEX: 58
AVG: 398
CCT: 543,2
NUM: 104
";

    #[tokio::test]
    async fn parses_key_value_export() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exam.txt");
        tokio::fs::write(&path, KV_EXPORT).await.unwrap();

        let adapter = SpecularMicroscopeAdapter;
        let records = adapter.parse_file(&path, &ctx()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["ecd"], 2512.0);
        assert_eq!(records[0]["cct"], 543.2);
        assert_eq!(records[0]["eye"], "OD");
    }

    #[test]
    fn validate_requires_eye_and_checks_ranges() {
        let adapter = SpecularMicroscopeAdapter;
        let ok = adapter.validate(&serde_json::json!({"eye": "OD", "ecd": 2512.0}));
        assert!(ok.is_valid);

        let missing = adapter.validate(&serde_json::json!({"ecd": 2512.0}));
        assert!(!missing.is_valid);
        assert!(missing.errors[0].contains("eye"));

        let out_of_range =
            adapter.validate(&serde_json::json!({"eye": "OD", "ecd": 2512.0, "cv": 140.0}));
        assert!(!out_of_range.is_valid);
    }

    #[test]
    fn transform_builds_quality_and_interpretation() {
        let adapter = SpecularMicroscopeAdapter;
        let record = serde_json::json!({
            "eye": "OD", "ecd": 2512.0, "cv": 32.0, "hexagonality": 58.0,
            "cct": 543.2, "cell_count": 104.0, "captured_at": "2023-09-05",
        });
        let transformed = adapter.transform(&record).unwrap();
        assert_eq!(transformed.eye, Some(Laterality::OD));
        assert_eq!(transformed.quality.overall, 100.0);
        assert_eq!(
            transformed.interpretation.as_deref(),
            Some("Normal endothelial cell density")
        );
        assert!(transformed.findings.is_empty());
        assert_eq!(transformed.raw_data, record);
    }

    #[test]
    fn degraded_cornea_produces_findings() {
        let adapter = SpecularMicroscopeAdapter;
        let record = serde_json::json!({
            "eye": "OS", "ecd": 1200.0, "cv": 48.0, "hexagonality": 41.0, "cct": 455.0,
        });
        let transformed = adapter.transform(&record).unwrap();
        assert_eq!(
            transformed.interpretation.as_deref(),
            Some("Severely reduced endothelial cell density")
        );
        assert_eq!(transformed.findings.len(), 3);
        assert!(transformed.quality.overall < 50.0);
    }

    #[test]
    fn demographics_with_confidence() {
        let adapter = SpecularMicroscopeAdapter;
        let record = serde_json::json!({
            "patient_name": "DUPONT, Jean",
            "patient_id": "A12345",
            "date_of_birth": "15/01/1980",
            "eye": "OD",
        });
        let info = adapter.extract_patient_demographics(&record).unwrap();
        assert_eq!(info.last_name.as_deref(), Some("DUPONT"));
        assert_eq!(info.first_name.as_deref(), Some("Jean"));
        assert_eq!(info.patient_id.as_deref(), Some("A12345"));
        assert!((info.confidence - 1.0).abs() < f64::EPSILON);
    }
}
