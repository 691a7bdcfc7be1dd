//! Shared parsing utilities for device output files.
//!
//! Ophthalmology devices export flat CSV or loosely structured key-value
//! text; delimiters vary per vendor (`:`, `=`, tab) and decimals may use
//! commas. Device-specific key maps live in the adapters.

use chrono::NaiveDate;
use oculink_model::Laterality;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

/// Parse delimiter-separated values with a header row. Detects `,` vs `;`
/// from the header; quoted fields carry embedded delimiters.
pub fn parse_csv(text: &str) -> Vec<HashMap<String, String>> {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let Some(header_line) = lines.next() else {
        return Vec::new();
    };
    let delimiter = if header_line.matches(';').count() > header_line.matches(',').count() {
        ';'
    } else {
        ','
    };
    let headers: Vec<String> = split_delimited(header_line, delimiter)
        .into_iter()
        .map(|h| h.trim().to_string())
        .collect();

    lines
        .map(|line| {
            split_delimited(line, delimiter)
                .into_iter()
                .enumerate()
                .filter_map(|(i, value)| {
                    headers
                        .get(i)
                        .map(|h| (h.clone(), value.trim().to_string()))
                })
                .collect()
        })
        .collect()
}

fn split_delimited(line: &str, delimiter: char) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in line.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c == delimiter && !in_quotes => {
                fields.push(std::mem::take(&mut current));
            }
            c => current.push(c),
        }
    }
    fields.push(current);
    fields
}

/// Parse key-value text tolerating `:`, `=`, and tab delimiters. Keys are
/// upper-cased for lookup; later duplicates win.
pub fn parse_key_values(text: &str) -> HashMap<String, String> {
    let mut values = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
            continue;
        }
        let split = line
            .split_once('\t')
            .or_else(|| line.split_once(':'))
            .or_else(|| line.split_once('='));
        if let Some((key, value)) = split {
            let key = key.trim().to_ascii_uppercase();
            let value = value.trim().to_string();
            if !key.is_empty() && !value.is_empty() {
                values.insert(key, value);
            }
        }
    }
    values
}

/// Parse a numeric value, accepting comma decimals and trailing units
/// (`"2 512 cells/mm2"`, `"543,2 µm"`).
pub fn parse_number(raw: &str) -> Option<f64> {
    static NUMBER: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"-?\d+(?:[.,]\d+)?").expect("static regex"));
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let m = NUMBER.find(&compact)?;
    m.as_str().replace(',', ".").parse().ok()
}

/// Accepted date shapes: `YYYYMMDD`, `DD/MM/YYYY`, `YYYY-MM-DD`.
pub fn parse_flexible_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    for format in ["%Y%m%d", "%d/%m/%Y", "%Y-%m-%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return Some(date);
        }
    }
    None
}

/// Scan a string for a laterality token: OD/OS/OU plus French and English
/// eye words.
pub fn parse_laterality(raw: &str) -> Option<Laterality> {
    static TOKENS: Lazy<Vec<(Regex, Laterality)>> = Lazy::new(|| {
        vec![
            (
                Regex::new(r"(?i)\b(od|right|droit|droite|r)\b").expect("static regex"),
                Laterality::OD,
            ),
            (
                Regex::new(r"(?i)\b(os|og|left|gauche|l)\b").expect("static regex"),
                Laterality::OS,
            ),
            (
                Regex::new(r"(?i)\b(ou|both|binocular|deux\s+yeux)\b").expect("static regex"),
                Laterality::OU,
            ),
        ]
    });
    for (pattern, laterality) in TOKENS.iter() {
        if pattern.is_match(raw) {
            return Some(*laterality);
        }
    }
    None
}

/// Split a device-reported patient name. `"DUPONT, Jean"` and
/// `"DUPONT Jean"` both yield `(Some("DUPONT"), Some("Jean"))`.
pub fn split_patient_name(raw: &str) -> (Option<String>, Option<String>) {
    let raw = raw.trim();
    if raw.is_empty() {
        return (None, None);
    }
    if let Some((last, first)) = raw.split_once(',') {
        let last = last.trim();
        let first = first.trim();
        return (
            (!last.is_empty()).then(|| last.to_string()),
            (!first.is_empty()).then(|| first.to_string()),
        );
    }
    let mut parts = raw.split_whitespace();
    let last = parts.next().map(|s| s.to_string());
    let first: String = parts.collect::<Vec<_>>().join(" ");
    (last, (!first.is_empty()).then_some(first))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patient_names_split_both_shapes() {
        assert_eq!(
            split_patient_name("DUPONT, Jean"),
            (Some("DUPONT".into()), Some("Jean".into()))
        );
        assert_eq!(
            split_patient_name("DUPONT Jean Marie"),
            (Some("DUPONT".into()), Some("Jean Marie".into()))
        );
        assert_eq!(split_patient_name(""), (None, None));
    }

    #[test]
    fn csv_with_semicolons_and_quotes() {
        let rows = parse_csv("Name;ECD;CV\n\"DUPONT; Jean\";2512;32\nMARTIN;1890;45\n");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["Name"], "DUPONT; Jean");
        assert_eq!(rows[1]["ECD"], "1890");
    }

    #[test]
    fn key_values_accept_mixed_delimiters() {
        let text = "ECD: 2512\nCV=32\nHEX\t58\n# comment\nEYE : OD\n";
        let values = parse_key_values(text);
        assert_eq!(values["ECD"], "2512");
        assert_eq!(values["CV"], "32");
        assert_eq!(values["HEX"], "58");
        assert_eq!(values["EYE"], "OD");
    }

    #[test]
    fn numbers_tolerate_units_and_comma_decimals() {
        assert_eq!(parse_number("2512 cells/mm2"), Some(2512.0));
        assert_eq!(parse_number("543,2 µm"), Some(543.2));
        assert_eq!(parse_number("-3.25 D"), Some(-3.25));
        assert_eq!(parse_number("2 512"), Some(2512.0));
        assert_eq!(parse_number("n/a"), None);
    }

    #[test]
    fn flexible_dates() {
        let expected = NaiveDate::from_ymd_opt(1980, 1, 15).unwrap();
        assert_eq!(parse_flexible_date("19800115"), Some(expected));
        assert_eq!(parse_flexible_date("15/01/1980"), Some(expected));
        assert_eq!(parse_flexible_date("1980-01-15"), Some(expected));
        assert_eq!(parse_flexible_date("next tuesday"), None);
    }

    #[test]
    fn laterality_tokens_in_both_languages() {
        assert_eq!(parse_laterality("OD"), Some(Laterality::OD));
        assert_eq!(parse_laterality("oeil gauche"), Some(Laterality::OS));
        assert_eq!(parse_laterality("Right eye"), Some(Laterality::OD));
        assert_eq!(parse_laterality("both eyes"), Some(Laterality::OU));
        assert_eq!(parse_laterality("macula"), None);
    }
}
