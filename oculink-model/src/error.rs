use std::fmt;

/// Errors raised while constructing or validating model values.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelError {
    /// An opaque identifier did not match the store's id format.
    InvalidId { field: &'static str, value: String },
    /// A numeric field fell outside its clinical range.
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    /// A required field was absent.
    MissingField(&'static str),
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::InvalidId { field, value } => {
                write!(f, "invalid id for {field}: {value:?}")
            }
            ModelError::OutOfRange {
                field,
                value,
                min,
                max,
            } => write!(f, "{field} out of range: {value} not in [{min}, {max}]"),
            ModelError::MissingField(field) => {
                write!(f, "missing required field: {field}")
            }
        }
    }
}

impl std::error::Error for ModelError {}

pub type Result<T> = std::result::Result<T, ModelError>;
