//! Job model for the durable priority queue.

use crate::error::{IntegrationError, Result};
use chrono::{DateTime, Utc};
use oculink_model::{DeviceId, PatientId, SourceChannel};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Work types the queue executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    FileProcess,
    PatientMatch,
    FolderIndex,
    BatchImport,
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobType::FileProcess => "file_process",
            JobType::PatientMatch => "patient_match",
            JobType::FolderIndex => "folder_index",
            JobType::BatchImport => "batch_import",
        };
        write!(f, "{name}")
    }
}

/// Priority band, 1 (highest) through 10 (lowest).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct JobPriority(u8);

impl JobPriority {
    pub const HIGHEST: JobPriority = JobPriority(1);
    pub const LOWEST: JobPriority = JobPriority(10);

    pub fn new(band: u8) -> Result<Self> {
        if (1..=10).contains(&band) {
            Ok(Self(band))
        } else {
            Err(IntegrationError::validation(
                "priority",
                format!("{band} outside 1..=10"),
            ))
        }
    }

    pub fn as_u8(self) -> u8 {
        self.0
    }

    /// All bands, highest first — the worker's pop order.
    pub fn descending() -> impl Iterator<Item = JobPriority> {
        (1..=10).map(JobPriority)
    }
}

impl Default for JobPriority {
    fn default() -> Self {
        JobPriority(5)
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Structured payload per job type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum JobPayload {
    FileProcess(FileProcessJob),
    PatientMatch(PatientMatchJob),
    FolderIndex(FolderIndexJob),
    BatchImport(BatchImportJob),
}

impl JobPayload {
    pub fn job_type(&self) -> JobType {
        match self {
            JobPayload::FileProcess(_) => JobType::FileProcess,
            JobPayload::PatientMatch(_) => JobType::PatientMatch,
            JobPayload::FolderIndex(_) => JobType::FolderIndex,
            JobPayload::BatchImport(_) => JobType::BatchImport,
        }
    }

    /// Rehydrate a payload from the split `(jobType, data)` form used by the
    /// queue-admin HTTP surface.
    pub fn from_parts(job_type: JobType, data: Value) -> Result<Self> {
        let payload = match job_type {
            JobType::FileProcess => JobPayload::FileProcess(serde_json::from_value(data)?),
            JobType::PatientMatch => JobPayload::PatientMatch(serde_json::from_value(data)?),
            JobType::FolderIndex => JobPayload::FolderIndex(serde_json::from_value(data)?),
            JobType::BatchImport => JobPayload::BatchImport(serde_json::from_value(data)?),
        };
        Ok(payload)
    }
}

/// Process one remote file end to end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileProcessJob {
    pub device: DeviceId,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient: Option<PatientId>,
    pub source: SourceChannel,
}

/// Resolve one folder name to a patient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientMatchJob {
    pub device: DeviceId,
    pub folder_path: String,
}

/// Enumerate a device subtree and feed folders through the indexer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderIndexJob {
    pub device: DeviceId,
    #[serde(default)]
    pub base_path: String,
}

/// Sequential `file_process` over a list, collecting per-file outcomes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchImportJob {
    pub device: DeviceId,
    pub paths: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient: Option<PatientId>,
    pub source: SourceChannel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Delayed,
    Processing,
    Completed,
    Failed,
}

/// One execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAttempt {
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Queue-persisted job envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub payload: JobPayload,
    pub priority: JobPriority,
    /// Maximum retries after the initial attempt.
    pub retries: u32,
    pub retries_left: u32,
    pub timeout_ms: u64,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempts: Vec<JobAttempt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

/// Caller knobs for `add_job`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddJobOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<JobPriority>,
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

pub const DEFAULT_RETRIES: u32 = 3;
pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;

/// Device-local unique id: `<type>_<epochMs>_<random>`.
pub fn generate_job_id(job_type: JobType) -> String {
    let epoch_ms = Utc::now().timestamp_millis();
    let suffix: u32 = rand::rng().random_range(0..0xFFFF_FF);
    format!("{job_type}_{epoch_ms}_{suffix:06x}")
}

impl Job {
    pub fn new(payload: JobPayload, options: &AddJobOptions) -> Self {
        let retries = options.retries.unwrap_or(DEFAULT_RETRIES);
        let now = Utc::now();
        let (status, scheduled_for) = if options.delay_ms > 0 {
            (
                JobStatus::Delayed,
                Some(now + chrono::Duration::milliseconds(options.delay_ms as i64)),
            )
        } else {
            (JobStatus::Pending, None)
        };
        Self {
            id: generate_job_id(payload.job_type()),
            payload,
            priority: options.priority.unwrap_or_default(),
            retries,
            retries_left: retries,
            timeout_ms: options.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS),
            status,
            created_at: now,
            scheduled_for,
            attempts: Vec::new(),
            completed_at: None,
            failed_at: None,
            result: None,
        }
    }

    pub fn job_type(&self) -> JobType {
        self.payload.job_type()
    }

    /// Backoff before the next retry, computed from how many attempts have
    /// already failed: `2^(retries - retriesLeft) · 1000` ms.
    pub fn retry_delay_ms(&self) -> u64 {
        let failed_so_far = self.retries.saturating_sub(self.retries_left);
        2u64.saturating_pow(failed_so_far) * 1000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> JobPayload {
        JobPayload::FileProcess(FileProcessJob {
            device: DeviceId::from_trusted("device-000000000001"),
            path: "exports/img.dcm".into(),
            patient: None,
            source: SourceChannel::ScheduledSync,
        })
    }

    #[test]
    fn job_id_carries_type_prefix() {
        let id = generate_job_id(JobType::FileProcess);
        assert!(id.starts_with("file_process_"));
        let id = generate_job_id(JobType::BatchImport);
        assert!(id.starts_with("batch_import_"));
    }

    #[test]
    fn retry_delays_double_per_failed_attempt() {
        let mut job = Job::new(payload(), &AddJobOptions::default());
        assert_eq!(job.retries, 3);
        // First failure: no retries consumed yet.
        assert_eq!(job.retry_delay_ms(), 1000);
        job.retries_left = 2;
        assert_eq!(job.retry_delay_ms(), 2000);
        job.retries_left = 1;
        assert_eq!(job.retry_delay_ms(), 4000);
    }

    #[test]
    fn priority_bounds() {
        assert!(JobPriority::new(0).is_err());
        assert!(JobPriority::new(11).is_err());
        assert_eq!(JobPriority::new(1).unwrap(), JobPriority::HIGHEST);
        let order: Vec<u8> = JobPriority::descending().map(|p| p.as_u8()).collect();
        assert_eq!(order, (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn delayed_jobs_get_scheduled_for() {
        let options = AddJobOptions {
            delay_ms: 5000,
            ..Default::default()
        };
        let job = Job::new(payload(), &options);
        assert_eq!(job.status, JobStatus::Delayed);
        assert!(job.scheduled_for.is_some());
    }

    #[test]
    fn payload_round_trips_through_parts() {
        let data = serde_json::json!({
            "device": "device-000000000001",
            "path": "exports/img.dcm",
            "source": "webhook",
        });
        let payload = JobPayload::from_parts(JobType::FileProcess, data).unwrap();
        assert_eq!(payload.job_type(), JobType::FileProcess);
    }
}
