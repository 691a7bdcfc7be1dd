//! Filename-based identity extraction.
//!
//! Clinics configure devices to emit `LAST_FIRST_ID_DATE[...]` names, but
//! every vendor deviates somewhere. The parser works token-wise: find the
//! date and id by shape, take the leading alphabetic tokens as names, and
//! score what was recovered additively.

use crate::adapters::parse::{parse_flexible_date, parse_laterality};
use chrono::NaiveDate;
use oculink_model::{ExtractionMethod, Gender, PatientInfo};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;

/// Confidence contribution per recovered field, capped at 1.0.
const WEIGHT_LAST_NAME: f64 = 0.30;
const WEIGHT_FIRST_NAME: f64 = 0.20;
const WEIGHT_PATIENT_ID: f64 = 0.25;
const WEIGHT_DOB: f64 = 0.25;

/// Tokens that look like names but are device vocabulary.
const STOP_TOKENS: &[&str] = &[
    "OCT", "IOP", "FUNDUS", "RETINO", "SCAN", "IMG", "IMAGE", "EXPORT", "EXAM", "TEST",
    "TONO", "SPECULAR", "CEM", "ARK", "REF", "TOPO", "REPORT", "CAPTURE", "MACULA", "RNFL",
    "OD", "OS", "OU", "OG", "LEFT", "RIGHT",
];

static ID_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z]{0,3}\d{3,12}$").expect("static regex"));
static NAME_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-zÀ-ÿ]{2,}$").expect("static regex"));

fn is_stop_token(token: &str) -> bool {
    STOP_TOKENS.contains(&token.to_ascii_uppercase().as_str())
}

fn token_date(token: &str) -> Option<NaiveDate> {
    if token.len() == 8 && token.bytes().all(|b| b.is_ascii_digit()) {
        return parse_flexible_date(token);
    }
    parse_flexible_date(&token.replace('-', "/"))
}

/// Parse one filename into a partial [`PatientInfo`]. Returns `None` when
/// nothing identifying was found.
pub fn parse_filename(path: &Path) -> Option<PatientInfo> {
    let stem = path.file_stem()?.to_str()?;
    let tokens: Vec<&str> = stem
        .split(['_', '-', ' '])
        .filter(|t| !t.is_empty())
        .collect();

    let mut info = PatientInfo::default();
    let mut names: Vec<&str> = Vec::new();

    for token in &tokens {
        if info.date_of_birth.is_none()
            && let Some(date) = token_date(token)
        {
            info.date_of_birth = Some(date);
            continue;
        }
        if info.patient_id.is_none()
            && ID_TOKEN.is_match(token)
            && token.bytes().any(|b| b.is_ascii_digit())
        {
            info.patient_id = Some((*token).to_string());
            continue;
        }
        if token.len() == 1 && info.gender.is_none() {
            match token.to_ascii_uppercase().as_str() {
                "M" | "H" => {
                    info.gender = Some(Gender::Male);
                    continue;
                }
                "F" => {
                    info.gender = Some(Gender::Female);
                    continue;
                }
                _ => {}
            }
        }
        if names.len() < 2 && NAME_TOKEN.is_match(token) && !is_stop_token(token) {
            names.push(token);
        }
    }

    if let Some(last) = names.first() {
        info.last_name = Some((*last).to_string());
    }
    if let Some(first) = names.get(1) {
        info.first_name = Some((*first).to_string());
    }
    info.laterality = parse_laterality(stem);

    if info.is_empty() {
        return None;
    }

    let mut confidence: f64 = 0.0;
    if info.last_name.is_some() {
        confidence += WEIGHT_LAST_NAME;
    }
    if info.first_name.is_some() {
        confidence += WEIGHT_FIRST_NAME;
    }
    if info.patient_id.is_some() {
        confidence += WEIGHT_PATIENT_ID;
    }
    if info.date_of_birth.is_some() {
        confidence += WEIGHT_DOB;
    }
    info.confidence = confidence.min(1.0);
    info.method = Some(ExtractionMethod::Filename);
    Some(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use oculink_model::Laterality;

    #[test]
    fn full_convention_scores_one() {
        let info = parse_filename(Path::new("DUPONT_JEAN_A12345_19800115.jpg")).unwrap();
        assert_eq!(info.last_name.as_deref(), Some("DUPONT"));
        assert_eq!(info.first_name.as_deref(), Some("JEAN"));
        assert_eq!(info.patient_id.as_deref(), Some("A12345"));
        assert_eq!(
            info.date_of_birth,
            Some(NaiveDate::from_ymd_opt(1980, 1, 15).unwrap())
        );
        assert!((info.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn device_tokens_are_not_names() {
        let info = parse_filename(Path::new("DUPONT_JEAN_A12345_19800115_M_OCT.dcm")).unwrap();
        assert_eq!(info.last_name.as_deref(), Some("DUPONT"));
        assert_eq!(info.first_name.as_deref(), Some("JEAN"));
        assert_eq!(info.gender, Some(Gender::Male));
    }

    #[test]
    fn partial_names_score_partially() {
        let info = parse_filename(Path::new("MARTIN_capture.jpg")).unwrap();
        assert_eq!(info.last_name.as_deref(), Some("MARTIN"));
        assert!(info.first_name.is_none());
        assert!((info.confidence - 0.30).abs() < 1e-9);
    }

    #[test]
    fn laterality_from_suffix() {
        let info = parse_filename(Path::new("LEROY_fundus_OD.jpg")).unwrap();
        assert_eq!(info.laterality, Some(Laterality::OD));
    }

    #[test]
    fn meaningless_names_yield_none() {
        assert!(parse_filename(Path::new("IMG_1.jpg")).is_none());
        assert!(parse_filename(Path::new("20230905120000.jpg")).is_none());
    }
}
