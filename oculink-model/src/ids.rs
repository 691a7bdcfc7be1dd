use crate::error::{ModelError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The document store hands out opaque ids; we only check shape, never
/// meaning. Accepted: 12-64 chars of `[A-Za-z0-9_-]`.
fn is_valid_opaque_id(value: &str) -> bool {
    (12..=64).contains(&value.len())
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

macro_rules! opaque_id {
    ($(#[$doc:meta])* $name:ident, $field:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Validate and wrap a raw store id.
            pub fn parse(value: impl Into<String>) -> Result<Self> {
                let value = value.into();
                if is_valid_opaque_id(&value) {
                    Ok(Self(value))
                } else {
                    Err(ModelError::InvalidId {
                        field: $field,
                        value,
                    })
                }
            }

            /// Wrap without validation. Only for values that already came out
            /// of the store.
            pub fn from_trusted(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

opaque_id!(
    /// Identifier of a device document in the external store.
    DeviceId,
    "deviceId"
);
opaque_id!(
    /// Identifier of a patient record.
    PatientId,
    "patientId"
);
opaque_id!(
    /// Identifier of an exam document.
    ExamId,
    "examId"
);
opaque_id!(
    /// Identifier of a clinical record targeted by granular updates.
    RecordId,
    "recordId"
);
opaque_id!(
    /// Identifier of the operator performing a change.
    UserId,
    "userId"
);
