//! Autorefractor / keratometer adapter.
//!
//! Combined units export refraction (sphere/cylinder/axis) and keratometry
//! (K1/K2) per eye, as CSV batches or key-value text. Registered for both
//! the refractometer and keratometer device types.

use crate::adapters::parse::{
    parse_csv, parse_flexible_date, parse_key_values, parse_laterality, parse_number,
    split_patient_name,
};
use crate::adapters::{
    DeviceAdapter, ParseContext, TransformedMeasurement, ValidationOutcome, check_range,
    factor_at_least, overall_quality, require_fields,
};
use crate::error::{IntegrationError, Result};
use async_trait::async_trait;
use chrono::Utc;
use oculink_model::{DeviceType, MeasurementType, PatientInfo, QualityBlock};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Copy)]
pub struct RefractometerAdapter;

const NUMERIC_KEYS: &[(&str, &[&str])] = &[
    ("sphere", &["SPH", "SPHERE", "S"]),
    ("cylinder", &["CYL", "CYLINDER", "C"]),
    ("axis", &["AX", "AXIS", "A"]),
    ("addition", &["ADD", "ADDITION"]),
    ("k1", &["K1", "R1"]),
    ("k2", &["K2", "R2"]),
    ("confidence", &["CONF", "CONFIDENCE", "RELIABILITY"]),
];

fn record_from_map(raw: &HashMap<String, String>) -> Value {
    let upper: HashMap<String, &String> = raw
        .iter()
        .map(|(k, v)| (k.trim().to_ascii_uppercase(), v))
        .collect();
    let mut record = Map::new();

    for (field, variants) in NUMERIC_KEYS {
        for variant in *variants {
            if let Some(value) = upper.get(*variant)
                && let Some(number) = parse_number(value)
            {
                record.insert((*field).to_string(), json!(number));
                break;
            }
        }
    }
    for (field, keys) in [
        ("eye", &["EYE", "SIDE"][..]),
        ("captured_at", &["DATE", "EXAM DATE"][..]),
        ("patient_name", &["NAME", "PATIENT"][..]),
        ("patient_id", &["ID", "PATIENT ID"][..]),
    ] {
        for key in keys {
            if let Some(value) = upper.get(*key) {
                record.insert(field.to_string(), json!(value.trim()));
                break;
            }
        }
    }
    if let Some(eye_raw) = record.get("eye").and_then(Value::as_str)
        && let Some(laterality) = parse_laterality(eye_raw)
    {
        record.insert("eye".into(), json!(laterality.to_string()));
    }
    Value::Object(record)
}

#[async_trait]
impl DeviceAdapter for RefractometerAdapter {
    fn device_type(&self) -> DeviceType {
        DeviceType::Refractometer
    }

    fn measurement_type(&self) -> MeasurementType {
        MeasurementType::Refraction
    }

    fn validate(&self, data: &Value) -> ValidationOutcome {
        let mut errors = require_fields(data, &["eye"]);
        if data.get("sphere").is_none() && data.get("k1").is_none() {
            errors.push("sphere or k1 is required".to_string());
        }
        for (field, min, max) in [
            ("sphere", -25.0, 25.0),
            ("cylinder", -10.0, 10.0),
            ("axis", 0.0, 180.0),
            ("addition", 0.25, 4.0),
            ("k1", 30.0, 60.0),
            ("k2", 30.0, 60.0),
        ] {
            if let Some(error) = check_range(data, field, min, max) {
                errors.push(error);
            }
        }
        ValidationOutcome::from_errors(errors)
    }

    fn transform(&self, data: &Value) -> Result<TransformedMeasurement> {
        let sphere = data.get("sphere").and_then(Value::as_f64);
        let cylinder = data.get("cylinder").and_then(Value::as_f64);
        let axis = data.get("axis").and_then(Value::as_f64);
        let k1 = data.get("k1").and_then(Value::as_f64);
        let k2 = data.get("k2").and_then(Value::as_f64);

        if sphere.is_none() && k1.is_none() {
            return Err(IntegrationError::Parse(
                "refraction record without sphere or keratometry".into(),
            ));
        }

        let spherical_equivalent = sphere.map(|s| s + cylinder.unwrap_or(0.0) / 2.0);
        let corneal_astigmatism = match (k1, k2) {
            (Some(k1), Some(k2)) => Some((k1 - k2).abs()),
            _ => None,
        };

        let mut factors = Vec::new();
        if let Some(confidence) = data.get("confidence").and_then(Value::as_f64) {
            factors.push(factor_at_least("device_confidence", confidence, 7.0));
        }
        if let (Some(cylinder), Some(_)) = (cylinder, axis) {
            // Axis accompanies any meaningful cylinder.
            factors.push(factor_at_least(
                "axis_reported",
                if cylinder.abs() > 0.0 { 1.0 } else { 0.0 },
                0.0,
            ));
        }

        let interpretation = spherical_equivalent.map(|se| {
            let base = if se <= -0.5 {
                "Myopia"
            } else if se >= 0.5 {
                "Hyperopia"
            } else {
                "Emmetropia"
            };
            match cylinder {
                Some(c) if c.abs() >= 0.75 => format!("{base} with astigmatism"),
                _ => base.to_string(),
            }
        });

        let mut findings = Vec::new();
        if let Some(se) = spherical_equivalent
            && se <= -6.0
        {
            findings.push(format!("High myopia: spherical equivalent {se:.2} D"));
        }
        if let Some(astigmatism) = corneal_astigmatism
            && astigmatism >= 2.0
        {
            findings.push(format!("High corneal astigmatism: {astigmatism:.2} D"));
        }

        let measurement_date = data
            .get("captured_at")
            .and_then(Value::as_str)
            .and_then(parse_flexible_date)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|naive| naive.and_utc())
            .unwrap_or_else(Utc::now);

        Ok(TransformedMeasurement {
            measurement_type: if sphere.is_some() {
                MeasurementType::Refraction
            } else {
                MeasurementType::Keratometry
            },
            measurement_date,
            eye: data
                .get("eye")
                .and_then(Value::as_str)
                .and_then(parse_laterality),
            values: json!({
                "sphere": sphere,
                "cylinder": cylinder,
                "axis": axis,
                "addition": data.get("addition").and_then(Value::as_f64),
                "spherical_equivalent": spherical_equivalent,
                "k1": k1,
                "k2": k2,
                "corneal_astigmatism": corneal_astigmatism,
            }),
            quality: QualityBlock {
                overall: if factors.is_empty() {
                    100.0
                } else {
                    overall_quality(&factors)
                },
                factors,
            },
            interpretation,
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
            .filter(|r| r.get("sphere").is_some() || r.get("k1").is_some())
            .collect();

        if records.is_empty() {
            return Err(IntegrationError::Parse(format!(
                "no refraction data in {}",
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

    #[test]
    fn csv_rows_become_per_eye_records() {
        let rows = parse_csv("Eye,Sph,Cyl,Ax,K1,K2\nOD,-2.25,-0.75,85,43.2,44.1\nOS,-2.50,-0.50,92,43.0,43.8\n");
        let records: Vec<Value> = rows.iter().map(record_from_map).collect();
        assert_eq!(records[0]["eye"], "OD");
        assert_eq!(records[0]["sphere"], -2.25);
        assert_eq!(records[1]["axis"], 92.0);
    }

    #[test]
    fn spherical_equivalent_and_interpretation() {
        let record = json!({"eye": "OD", "sphere": -2.25, "cylinder": -0.75, "axis": 85.0});
        let transformed = RefractometerAdapter.transform(&record).unwrap();
        let se = transformed.values["spherical_equivalent"].as_f64().unwrap();
        assert!((se - (-2.625)).abs() < 1e-9);
        assert_eq!(
            transformed.interpretation.as_deref(),
            Some("Myopia with astigmatism")
        );
    }

    #[test]
    fn keratometry_only_records_validate() {
        let record = json!({"eye": "OD", "k1": 43.2, "k2": 44.1});
        assert!(RefractometerAdapter.validate(&record).is_valid);
        let transformed = RefractometerAdapter.transform(&record).unwrap();
        assert_eq!(transformed.measurement_type, MeasurementType::Keratometry);
        assert!(
            (transformed.values["corneal_astigmatism"].as_f64().unwrap() - 0.9).abs() < 1e-9
        );
    }

    #[test]
    fn clinical_ranges_enforced() {
        assert!(!RefractometerAdapter.validate(&json!({"eye": "OD", "sphere": -30.0})).is_valid);
        assert!(!RefractometerAdapter.validate(&json!({"eye": "OD", "sphere": -2.0, "axis": 200.0})).is_valid);
        assert!(!RefractometerAdapter.validate(&json!({"sphere": -2.0})).is_valid);
    }
}
