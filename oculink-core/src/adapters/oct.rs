//! OCT adapter.
//!
//! OCT units export flat XML summaries next to their image sets. Only the
//! summary metadata is parsed here; pixel data stays opaque per the
//! integration scope.

use crate::adapters::parse::{parse_flexible_date, parse_laterality, parse_number};
use crate::adapters::{
    DeviceAdapter, ParseContext, TransformedMeasurement, ValidationOutcome, check_range,
    factor_at_least, overall_quality, require_fields,
};
use crate::error::{IntegrationError, Result};
use async_trait::async_trait;
use chrono::Utc;
use oculink_model::{DeviceType, Gender, MeasurementType, PatientInfo, QualityBlock};
use regex::Regex;
use serde_json::{Map, Value, json};
use std::path::Path;

#[derive(Debug, Clone, Copy)]
pub struct OctAdapter;

/// Extract `<Tag>value</Tag>` from flat vendor XML. The summaries are a
/// single level deep, so a full XML stack is not warranted.
fn xml_tag(text: &str, tag: &str) -> Option<String> {
    let pattern = format!(r"(?is)<{tag}[^>]*>\s*([^<]+?)\s*</{tag}>");
    Regex::new(&pattern)
        .ok()?
        .captures(text)
        .map(|c| c[1].trim().to_string())
}

const NUMERIC_TAGS: &[(&str, &[&str])] = &[
    ("central_thickness", &["CentralThickness", "CST", "CentralSubfieldThickness"]),
    ("average_thickness", &["AverageThickness", "AvgThickness"]),
    ("rnfl_average", &["RnflAverage", "RNFL"]),
    ("signal_strength", &["SignalStrength", "Quality", "ScanQuality"]),
];

#[async_trait]
impl DeviceAdapter for OctAdapter {
    fn device_type(&self) -> DeviceType {
        DeviceType::Oct
    }

    fn measurement_type(&self) -> MeasurementType {
        MeasurementType::OctScan
    }

    fn validate(&self, data: &Value) -> ValidationOutcome {
        let mut errors = require_fields(data, &["eye"]);
        for (field, min, max) in [
            ("central_thickness", 100.0, 1200.0),
            ("average_thickness", 100.0, 1200.0),
            ("signal_strength", 0.0, 10.0),
        ] {
            if let Some(error) = check_range(data, field, min, max) {
                errors.push(error);
            }
        }
        ValidationOutcome::from_errors(errors)
    }

    fn transform(&self, data: &Value) -> Result<TransformedMeasurement> {
        let central = data.get("central_thickness").and_then(Value::as_f64);
        let signal = data.get("signal_strength").and_then(Value::as_f64);

        let mut factors = Vec::new();
        if let Some(signal) = signal {
            factors.push(factor_at_least("signal_strength", signal, 6.0));
        }

        let interpretation = central.map(|cst| {
            if cst > 350.0 {
                format!("Increased central thickness ({cst:.0} µm); macular edema suspected")
            } else if cst < 200.0 {
                format!("Decreased central thickness ({cst:.0} µm); atrophy suspected")
            } else {
                format!("Central thickness within normal limits ({cst:.0} µm)")
            }
        });

        let mut findings = Vec::new();
        if let Some(signal) = signal
            && signal < 6.0
        {
            findings.push(format!("Low scan quality: signal strength {signal:.0}/10"));
        }

        let measurement_date = data
            .get("captured_at")
            .and_then(Value::as_str)
            .and_then(parse_flexible_date)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|naive| naive.and_utc())
            .unwrap_or_else(Utc::now);

        Ok(TransformedMeasurement {
            measurement_type: MeasurementType::OctScan,
            measurement_date,
            eye: data
                .get("eye")
                .and_then(Value::as_str)
                .and_then(parse_laterality),
            values: json!({
                "central_thickness": central,
                "average_thickness": data.get("average_thickness").and_then(Value::as_f64),
                "rnfl_average": data.get("rnfl_average").and_then(Value::as_f64),
                "signal_strength": signal,
                "scan_type": data.get("scan_type").cloned().unwrap_or(Value::Null),
            }),
            quality: QualityBlock {
                overall: if factors.is_empty() {
                    0.0
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
        if !text.contains('<') {
            return Err(IntegrationError::Parse(format!(
                "{} is not an OCT XML summary",
                path.display()
            )));
        }

        let mut record = Map::new();
        for (field, tags) in NUMERIC_TAGS {
            for tag in *tags {
                if let Some(raw) = xml_tag(&text, tag)
                    && let Some(number) = parse_number(&raw)
                {
                    record.insert((*field).to_string(), json!(number));
                    break;
                }
            }
        }
        for (field, tags) in [
            ("eye", &["Eye", "Laterality", "Side"][..]),
            ("captured_at", &["StudyDate", "ExamDate", "Date"][..]),
            ("scan_type", &["ScanType", "Protocol"][..]),
            ("patient_id", &["ID", "PatientID"][..]),
            ("last_name", &["LastName", "FamilyName"][..]),
            ("first_name", &["FirstName", "GivenName"][..]),
            ("date_of_birth", &["DOB", "BirthDate", "DateOfBirth"][..]),
            ("gender", &["Sex", "Gender"][..]),
        ] {
            for tag in tags {
                if let Some(value) = xml_tag(&text, tag) {
                    record.insert(field.to_string(), json!(value));
                    break;
                }
            }
        }
        if let Some(eye_raw) = record.get("eye").and_then(Value::as_str)
            && let Some(laterality) = parse_laterality(eye_raw)
        {
            record.insert("eye".into(), json!(laterality.to_string()));
        }

        if !record.contains_key("central_thickness") && !record.contains_key("rnfl_average") {
            return Err(IntegrationError::Parse(format!(
                "no OCT metrics in {}",
                path.display()
            )));
        }
        Ok(vec![Value::Object(record)])
    }

    fn extract_patient_demographics(&self, parsed: &Value) -> Option<PatientInfo> {
        let mut info = PatientInfo {
            last_name: parsed
                .get("last_name")
                .and_then(Value::as_str)
                .map(str::to_string),
            first_name: parsed
                .get("first_name")
                .and_then(Value::as_str)
                .map(str::to_string),
            patient_id: parsed
                .get("patient_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            date_of_birth: parsed
                .get("date_of_birth")
                .and_then(Value::as_str)
                .and_then(parse_flexible_date),
            ..Default::default()
        };
        info.gender = parsed
            .get("gender")
            .and_then(Value::as_str)
            .and_then(|raw| match raw.to_ascii_uppercase().as_str() {
                "M" | "MALE" | "H" | "HOMME" => Some(Gender::Male),
                "F" | "FEMALE" | "FEMME" => Some(Gender::Female),
                _ => None,
            });
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

    const XML: &str = r#"<?xml version="1.0"?>
<OctSummary>
  <PatientID>A12345</PatientID>
  <LastName>DUPONT</LastName>
  <FirstName>Jean</FirstName>
  <DOB>1980-01-15</DOB>
  <Sex>M</Sex>
  <StudyDate>2023-09-05</StudyDate>
  <Eye>OD</Eye>
  <ScanType>Macular Cube</ScanType>
  <CentralThickness>264</CentralThickness>
  <AverageThickness>289</AverageThickness>
  <SignalStrength>8</SignalStrength>
</OctSummary>
"#;

    fn ctx() -> ParseContext {
        ParseContext::for_type(DeviceType::Oct)
    }

    #[tokio::test]
    async fn parses_summary_xml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.xml");
        tokio::fs::write(&path, XML).await.unwrap();

        let records = OctAdapter.parse_file(&path, &ctx()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["central_thickness"], 264.0);
        assert_eq!(records[0]["signal_strength"], 8.0);
        assert_eq!(records[0]["eye"], "OD");
    }

    #[tokio::test]
    async fn demographics_carry_full_confidence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.xml");
        tokio::fs::write(&path, XML).await.unwrap();

        let records = OctAdapter.parse_file(&path, &ctx()).await.unwrap();
        let info = OctAdapter.extract_patient_demographics(&records[0]).unwrap();
        assert_eq!(info.last_name.as_deref(), Some("DUPONT"));
        assert_eq!(info.gender, Some(Gender::Male));
        assert_eq!(info.laterality, Some(Laterality::OD));
        assert!((info.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn edema_interpretation() {
        let record = json!({"eye": "OD", "central_thickness": 412.0, "signal_strength": 7.0});
        let transformed = OctAdapter.transform(&record).unwrap();
        assert!(transformed.interpretation.unwrap().contains("macular edema"));
    }
}
