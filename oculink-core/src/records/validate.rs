//! Clinical range checks shared by the granular update operations.

use crate::error::{IntegrationError, Result};
use once_cell::sync::Lazy;
use regex::Regex;

fn check(field: &'static str, value: f64, min: f64, max: f64) -> Result<f64> {
    if (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(IntegrationError::validation(
            field,
            format!("{value} not in [{min}, {max}]"),
        ))
    }
}

/// Sphere: −25 to +25 dioptres.
pub fn validate_sphere(value: f64) -> Result<f64> {
    check("sphere", value, -25.0, 25.0)
}

/// Cylinder: −10 to +10 dioptres.
pub fn validate_cylinder(value: f64) -> Result<f64> {
    check("cylinder", value, -10.0, 10.0)
}

/// Axis: 0 to 180 degrees.
pub fn validate_axis(value: f64) -> Result<f64> {
    check("axis", value, 0.0, 180.0)
}

/// Addition: +0.25 to +4.00 dioptres.
pub fn validate_addition(value: f64) -> Result<f64> {
    check("addition", value, 0.25, 4.0)
}

/// Intraocular pressure: 0 to 60 mmHg.
pub fn validate_iop(value: f64) -> Result<f64> {
    check("iop", value, 0.0, 60.0)
}

static VA_FORMATS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        // Monoyer decimal notation: 0.05 .. 2.0
        Regex::new(r"^[0-2](?:[.,]\d{1,2})?$").expect("static regex"),
        // Fractions, Monoyer tenths or Snellen-style n/m
        Regex::new(r"^\d{1,2}/\d{1,3}$").expect("static regex"),
        // Parinaud reading scale
        Regex::new(r"^P\d{1,2}$").expect("static regex"),
        // Low-vision descriptors
        Regex::new(r"(?i)^(cld|vbm|pl|pl[+-]|hm|cf)$").expect("static regex"),
    ]
});

/// Visual acuity accepts Monoyer decimals, `n/m` fractions, and Parinaud.
pub fn validate_visual_acuity(value: &str) -> Result<&str> {
    let trimmed = value.trim();
    if VA_FORMATS.iter().any(|format| format.is_match(trimmed)) {
        Ok(value)
    } else {
        Err(IntegrationError::validation(
            "visualAcuity",
            format!("unrecognized notation: {value:?}"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dioptre_ranges() {
        assert!(validate_sphere(-25.0).is_ok());
        assert!(validate_sphere(25.5).is_err());
        assert!(validate_cylinder(-10.5).is_err());
        assert!(validate_axis(180.0).is_ok());
        assert!(validate_axis(181.0).is_err());
        assert!(validate_addition(0.25).is_ok());
        assert!(validate_addition(0.0).is_err());
    }

    #[test]
    fn visual_acuity_notations() {
        for ok in ["10/10", "8/10", "20/40", "P2", "1.0", "0,8", "CLD", "PL+"] {
            assert!(validate_visual_acuity(ok).is_ok(), "rejected {ok}");
        }
        for bad in ["perfect", "10\\10", "200/10/10", ""] {
            assert!(validate_visual_acuity(bad).is_err(), "accepted {bad}");
        }
    }
}
