//! Ports to the external document store.
//!
//! The store itself (schemas, validation, transactions) is an external
//! collaborator; the core only speaks through these traits. One trait per
//! concern so fakes stay small in tests.

use crate::error::Result;
use async_trait::async_trait;
use oculink_model::{
    Device, DeviceId, DeviceImage, DeviceMeasurement, DeviceType, IntegrationLogEntry,
    IntegrationState, PatientCandidate, PatientId, UnmatchedFolderTicket, UserId,
};

/// Read devices, write their integration-state fields.
///
/// The core has write authority over [`IntegrationState`] only; everything
/// else on the device document belongs to the store.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn get(&self, id: &DeviceId) -> Result<Option<Device>>;
    async fn list_active(&self) -> Result<Vec<Device>>;
    async fn update_integration(&self, id: &DeviceId, state: &IntegrationState) -> Result<()>;
}

/// Sink for normalized measurement and image records.
#[async_trait]
pub trait MeasurementSink: Send + Sync {
    /// Returns the created record id.
    async fn save_measurement(&self, measurement: &DeviceMeasurement) -> Result<String>;
    async fn save_image(&self, image: &DeviceImage) -> Result<String>;
}

/// Append-only audit trail of ingestion attempts.
#[async_trait]
pub trait IntegrationLogStore: Send + Sync {
    async fn append(&self, entry: &IntegrationLogEntry) -> Result<String>;
}

/// Patient lookup used by the folder indexer and file processor.
#[async_trait]
pub trait PatientDirectory: Send + Sync {
    /// Resolve a device-local legacy identifier to a patient.
    async fn find_by_legacy_id(&self, legacy_id: &str) -> Result<Option<PatientCandidate>>;
    /// Name-based candidate search; `first_name` narrows when present.
    async fn search_by_name(
        &self,
        last_name: &str,
        first_name: Option<&str>,
    ) -> Result<Vec<PatientCandidate>>;
    /// Stored folder-name → patient mapping, if one was saved earlier.
    async fn folder_mapping(&self, folder_name: &str) -> Result<Option<PatientId>>;
    async fn save_folder_mapping(
        &self,
        folder_name: &str,
        patient: &PatientId,
        device_type: DeviceType,
        linked_by: Option<&UserId>,
    ) -> Result<()>;
}

/// Staging area for folders the indexer could not resolve. Entries expire
/// per the ticket's own TTL; the store enforces it.
#[async_trait]
pub trait UnmatchedFolderStore: Send + Sync {
    async fn stage(&self, ticket: &UnmatchedFolderTicket) -> Result<()>;
    async fn list(&self) -> Result<Vec<UnmatchedFolderTicket>>;
}
