//! Shared fakes for integration tests: a scripted SMB transport and
//! in-memory implementations of the document-store ports.
#![allow(dead_code)]

use async_trait::async_trait;
use oculink_core::error::{IntegrationError, Result};
use oculink_core::ports::{
    DeviceStore, IntegrationLogStore, MeasurementSink, PatientDirectory, UnmatchedFolderStore,
};
use oculink_core::smb::{DirectoryListing, RemoteEntry, SmbTransport, join_remote};
use oculink_model::{
    ConnectionProtocol, Device, DeviceId, DeviceImage, DeviceMeasurement, DeviceType,
    IntegrationLogEntry, IntegrationState, PatientCandidate, PatientId, ShareCredentials,
    UnmatchedFolderTicket, UserId,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Scripted SMB transport: an in-memory tree plus a configurable number of
/// initial probe failures.
#[derive(Default)]
pub struct FakeTransport {
    pub fail_probes: AtomicU32,
    pub probe_delay_ms: u64,
    pub tree: Mutex<HashMap<String, Vec<(String, bool, u64)>>>,
    pub file_contents: Mutex<HashMap<String, Vec<u8>>>,
}

impl FakeTransport {
    pub fn with_tree(entries: &[(&str, &[(&str, bool, u64)])]) -> Self {
        let tree = entries
            .iter()
            .map(|(path, children)| {
                (
                    path.to_string(),
                    children
                        .iter()
                        .map(|(name, is_dir, size)| (name.to_string(), *is_dir, *size))
                        .collect(),
                )
            })
            .collect();
        Self {
            tree: Mutex::new(tree),
            ..Default::default()
        }
    }
}

#[async_trait]
impl SmbTransport for FakeTransport {
    async fn probe(&self, _creds: &ShareCredentials) -> Result<()> {
        if self.probe_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.probe_delay_ms)).await;
        }
        let remaining = self.fail_probes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_probes.fetch_sub(1, Ordering::SeqCst);
            return Err(IntegrationError::Transport("NT_STATUS_IO_TIMEOUT".into()));
        }
        Ok(())
    }

    async fn list_directory(
        &self,
        _creds: &ShareCredentials,
        path: &str,
    ) -> Result<DirectoryListing> {
        let tree = self.tree.lock().unwrap();
        let children = tree
            .get(path)
            .ok_or_else(|| IntegrationError::Transport(format!("no such directory: {path}")))?;
        let mut listing = DirectoryListing::default();
        for (name, is_dir, size) in children {
            let full = join_remote(path, name);
            if *is_dir {
                listing.directories.push(RemoteEntry::directory(full, None));
            } else {
                listing.files.push(RemoteEntry::file(full, *size, None));
            }
        }
        Ok(listing.sorted())
    }

    async fn fetch_file(
        &self,
        _creds: &ShareCredentials,
        path: &str,
        local: &Path,
    ) -> Result<u64> {
        let contents = self
            .file_contents
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .unwrap_or_else(|| b"fake-bytes".to_vec());
        tokio::fs::write(local, &contents).await?;
        Ok(contents.len() as u64)
    }

    async fn store_file(
        &self,
        _creds: &ShareCredentials,
        _local: &Path,
        _path: &str,
    ) -> Result<()> {
        Ok(())
    }

    async fn exists(&self, _creds: &ShareCredentials, path: &str) -> Result<bool> {
        Ok(self.file_contents.lock().unwrap().contains_key(path))
    }

    async fn make_directory(&self, _creds: &ShareCredentials, _path: &str) -> Result<()> {
        Ok(())
    }

    async fn remove_file(&self, _creds: &ShareCredentials, _path: &str) -> Result<()> {
        Ok(())
    }
}

/// In-memory device store recording integration-state writes.
#[derive(Default)]
pub struct FakeDeviceStore {
    pub devices: Mutex<HashMap<DeviceId, Device>>,
}

impl FakeDeviceStore {
    pub fn with_device(device: Device) -> Self {
        let store = Self::default();
        store
            .devices
            .lock()
            .unwrap()
            .insert(device.id.clone(), device);
        store
    }

    pub fn integration(&self, id: &DeviceId) -> IntegrationState {
        self.devices
            .lock()
            .unwrap()
            .get(id)
            .map(|d| d.integration.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DeviceStore for FakeDeviceStore {
    async fn get(&self, id: &DeviceId) -> Result<Option<Device>> {
        Ok(self.devices.lock().unwrap().get(id).cloned())
    }

    async fn list_active(&self) -> Result<Vec<Device>> {
        Ok(self
            .devices
            .lock()
            .unwrap()
            .values()
            .filter(|d| d.active)
            .cloned()
            .collect())
    }

    async fn update_integration(&self, id: &DeviceId, state: &IntegrationState) -> Result<()> {
        if let Some(device) = self.devices.lock().unwrap().get_mut(id) {
            device.integration = state.clone();
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeLogStore {
    pub entries: Mutex<Vec<IntegrationLogEntry>>,
}

#[async_trait]
impl IntegrationLogStore for FakeLogStore {
    async fn append(&self, entry: &IntegrationLogEntry) -> Result<String> {
        let mut entries = self.entries.lock().unwrap();
        entries.push(entry.clone());
        Ok(format!("log-{:016}", entries.len()))
    }
}

#[derive(Default)]
pub struct FakeSink {
    pub measurements: Mutex<Vec<DeviceMeasurement>>,
    pub images: Mutex<Vec<DeviceImage>>,
}

#[async_trait]
impl MeasurementSink for FakeSink {
    async fn save_measurement(&self, measurement: &DeviceMeasurement) -> Result<String> {
        let mut measurements = self.measurements.lock().unwrap();
        measurements.push(measurement.clone());
        Ok(format!("measurement-{:06}", measurements.len()))
    }

    async fn save_image(&self, image: &DeviceImage) -> Result<String> {
        let mut images = self.images.lock().unwrap();
        images.push(image.clone());
        Ok(format!("image-{:010}", images.len()))
    }
}

#[derive(Default)]
pub struct FakeDirectory {
    pub legacy: Mutex<HashMap<String, PatientCandidate>>,
    pub mappings: Mutex<HashMap<String, PatientId>>,
}

#[async_trait]
impl PatientDirectory for FakeDirectory {
    async fn find_by_legacy_id(&self, legacy_id: &str) -> Result<Option<PatientCandidate>> {
        Ok(self.legacy.lock().unwrap().get(legacy_id).cloned())
    }

    async fn search_by_name(
        &self,
        _last_name: &str,
        _first_name: Option<&str>,
    ) -> Result<Vec<PatientCandidate>> {
        Ok(Vec::new())
    }

    async fn folder_mapping(&self, folder_name: &str) -> Result<Option<PatientId>> {
        Ok(self.mappings.lock().unwrap().get(folder_name).cloned())
    }

    async fn save_folder_mapping(
        &self,
        folder_name: &str,
        patient: &PatientId,
        _device_type: DeviceType,
        _linked_by: Option<&UserId>,
    ) -> Result<()> {
        self.mappings
            .lock()
            .unwrap()
            .insert(folder_name.to_string(), patient.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeUnmatched {
    pub tickets: Mutex<Vec<UnmatchedFolderTicket>>,
}

#[async_trait]
impl UnmatchedFolderStore for FakeUnmatched {
    async fn stage(&self, ticket: &UnmatchedFolderTicket) -> Result<()> {
        self.tickets.lock().unwrap().push(ticket.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<UnmatchedFolderTicket>> {
        Ok(self.tickets.lock().unwrap().clone())
    }
}

/// A pollable SMB device fixture.
pub fn smb_device(id: &str, secret: Option<&str>) -> Device {
    Device {
        id: DeviceId::from_trusted(id),
        name: format!("fixture {id}"),
        device_type: DeviceType::SpecularMicroscope,
        manufacturer: Some("Nidek".into()),
        model: Some("CEM-530".into()),
        protocol: ConnectionProtocol::Smb,
        share: Some(ShareCredentials {
            host: "nas-01.clinic.local".into(),
            share: "exports".into(),
            domain: None,
            username: "guest".into(),
            password: String::new(),
            auto_close_timeout: 30,
        }),
        export_path: String::new(),
        mount_path: None,
        webhook_secret: secret.map(str::to_string),
        integration: IntegrationState::default(),
        active: true,
    }
}
