//! Core data model definitions shared across Oculink crates.
#![allow(missing_docs)]

pub mod device;
pub mod error;
pub mod folder;
pub mod ids;
pub mod log;
pub mod measurement;
pub mod patient;

// Intentionally curated re-exports for downstream consumers.
pub use device::{
    ConnectionProtocol, Device, DeviceStatus, DeviceType, IntegrationState,
    ShareCredentials, SyncOutcome,
};
pub use error::{ModelError, Result as ModelResult};
pub use folder::{PatientCandidate, UnmatchedFolderTicket};
pub use ids::{DeviceId, ExamId, PatientId, RecordId, UserId};
pub use log::{
    CreatedRecords, ErrorDetails, ErrorSeverity, InitiatedBy,
    IntegrationLogEntry, IntegrationStatus, ProcessingCounts, SourceInfo,
    WebhookAudit,
};
pub use measurement::{
    DeviceImage, DeviceMeasurement, MeasurementType, QualityBlock,
    QualityFactor, SourceChannel,
};
pub use patient::{ExtractionMethod, Gender, Laterality, PatientInfo};
