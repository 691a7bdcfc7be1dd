use crate::device::DeviceType;
use crate::ids::PatientId;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A patient record the indexer considers a plausible match for a folder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientCandidate {
    pub patient: PatientId,
    pub display_name: String,
    /// Heuristic match score in `[0, 1]`.
    pub score: f64,
}

/// Folder the indexer could not resolve, staged for operator review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnmatchedFolderTicket {
    pub folder_name: String,
    pub device_type: DeviceType,
    #[serde(default)]
    pub suggestions: Vec<PatientCandidate>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl UnmatchedFolderTicket {
    pub const TTL_DAYS: i64 = 7;

    pub fn new(
        folder_name: impl Into<String>,
        device_type: DeviceType,
        suggestions: Vec<PatientCandidate>,
    ) -> Self {
        let now = Utc::now();
        Self {
            folder_name: folder_name.into(),
            device_type,
            suggestions,
            created_at: now,
            expires_at: now + Duration::days(Self::TTL_DAYS),
        }
    }
}
