use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Eye designation carried by findings and measurements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Laterality {
    /// Oculus dexter, right eye.
    OD,
    /// Oculus sinister, left eye.
    OS,
    /// Oculus uterque, both eyes.
    OU,
}

impl fmt::Display for Laterality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Laterality::OD => "OD",
            Laterality::OS => "OS",
            Laterality::OU => "OU",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
    Other,
}

/// Which extraction strategy produced a [`PatientInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExtractionMethod {
    #[serde(rename = "structured-meta")]
    StructuredMeta,
    #[serde(rename = "adapter")]
    Adapter,
    #[serde(rename = "filename")]
    Filename,
    #[serde(rename = "ocr")]
    Ocr,
    #[serde(rename = "filename_partial")]
    FilenamePartial,
}

impl fmt::Display for ExtractionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExtractionMethod::StructuredMeta => "structured-meta",
            ExtractionMethod::Adapter => "adapter",
            ExtractionMethod::Filename => "filename",
            ExtractionMethod::Ocr => "ocr",
            ExtractionMethod::FilenamePartial => "filename_partial",
        };
        write!(f, "{s}")
    }
}

/// Best-effort patient identity extracted from a device file.
///
/// Every field is optional; `confidence` reports how much of the identity the
/// winning strategy recovered, in `[0, 1]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatientInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_of_birth: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<Gender>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub laterality: Option<Laterality>,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<ExtractionMethod>,
}

impl PatientInfo {
    /// True when no identifying field was recovered at all.
    pub fn is_empty(&self) -> bool {
        self.first_name.is_none()
            && self.last_name.is_none()
            && self.patient_id.is_none()
            && self.date_of_birth.is_none()
    }

    /// Fill holes in `self` from `other` without overwriting present fields.
    pub fn merge_missing_from(&mut self, other: &PatientInfo) {
        if self.first_name.is_none() {
            self.first_name = other.first_name.clone();
        }
        if self.last_name.is_none() {
            self.last_name = other.last_name.clone();
        }
        if self.patient_id.is_none() {
            self.patient_id = other.patient_id.clone();
        }
        if self.date_of_birth.is_none() {
            self.date_of_birth = other.date_of_birth;
        }
        if self.gender.is_none() {
            self.gender = other.gender;
        }
        if self.laterality.is_none() {
            self.laterality = other.laterality;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_fills_holes_only() {
        let mut primary = PatientInfo {
            last_name: Some("DUPONT".into()),
            confidence: 0.6,
            ..Default::default()
        };
        let secondary = PatientInfo {
            last_name: Some("MARTIN".into()),
            first_name: Some("Jean".into()),
            ..Default::default()
        };
        primary.merge_missing_from(&secondary);
        assert_eq!(primary.last_name.as_deref(), Some("DUPONT"));
        assert_eq!(primary.first_name.as_deref(), Some("Jean"));
    }
}
