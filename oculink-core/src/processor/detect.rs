//! Device-type inference from file paths.
//!
//! Used when the caller has no device context (ad-hoc uploads, archive
//! sweeps). Manufacturer names and filename conventions are both weak
//! signals, so the result is a hint, never an identity.

use oculink_model::DeviceType;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;

/// Manufacturer / model substrings → device category.
const MAKER_TOKENS: &[(&str, DeviceType)] = &[
    ("cirrus", DeviceType::Oct),
    ("spectralis", DeviceType::Oct),
    ("triton", DeviceType::Oct),
    ("optovue", DeviceType::Oct),
    ("cem-530", DeviceType::SpecularMicroscope),
    ("cem530", DeviceType::SpecularMicroscope),
    ("konan", DeviceType::SpecularMicroscope),
    ("tomey em", DeviceType::SpecularMicroscope),
    ("nonmyd", DeviceType::FundusCamera),
    ("cr-2", DeviceType::FundusCamera),
    ("visucam", DeviceType::FundusCamera),
    ("nt-510", DeviceType::Tonometer),
    ("nt510", DeviceType::Tonometer),
    ("ora", DeviceType::Tonometer),
    ("ark-1", DeviceType::Refractometer),
    ("ark1", DeviceType::Refractometer),
    ("kr-800", DeviceType::Refractometer),
    ("kr800", DeviceType::Refractometer),
];

static TYPE_PATTERNS: Lazy<Vec<(Regex, DeviceType)>> = Lazy::new(|| {
    [
        (r"(?i)\boct\b|macul|rnfl", DeviceType::Oct),
        (r"(?i)specular|endoth|\bcem\b", DeviceType::SpecularMicroscope),
        (r"(?i)fundus|retino|\bcfp\b", DeviceType::FundusCamera),
        (r"(?i)\biop\b|tono|pression", DeviceType::Tonometer),
        (r"(?i)\bark\b|\bkr\b|refract|autoref", DeviceType::Refractometer),
        (r"(?i)kerato|topo", DeviceType::Keratometer),
    ]
    .into_iter()
    .map(|(pattern, device_type)| {
        (Regex::new(pattern).expect("static regex"), device_type)
    })
    .collect()
});

/// Infer a device type from a path, checking manufacturer tokens first,
/// then filename conventions.
pub fn infer_device_type(path: &Path) -> Option<DeviceType> {
    let haystack = path.to_string_lossy().to_ascii_lowercase();

    for (token, device_type) in MAKER_TOKENS {
        if haystack.contains(token) {
            return Some(*device_type);
        }
    }
    for (pattern, device_type) in TYPE_PATTERNS.iter() {
        if pattern.is_match(&haystack) {
            return Some(*device_type);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manufacturer_tokens_win() {
        assert_eq!(
            infer_device_type(Path::new("/exports/CEM-530/DUPONT.txt")),
            Some(DeviceType::SpecularMicroscope)
        );
        assert_eq!(
            infer_device_type(Path::new("cirrus/export_macula.xml")),
            Some(DeviceType::Oct)
        );
    }

    #[test]
    fn filename_conventions() {
        assert_eq!(
            infer_device_type(Path::new("DUPONT_JEAN_A12345_19800115_M_OCT.dcm")),
            Some(DeviceType::Oct)
        );
        assert_eq!(
            infer_device_type(Path::new("iop_20230905.txt")),
            Some(DeviceType::Tonometer)
        );
        assert_eq!(infer_device_type(Path::new("DUPONT_JEAN.jpg")), None);
    }
}
