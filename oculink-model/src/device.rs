use crate::ids::DeviceId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ophthalmology device categories the integration core understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceType {
    Oct,
    Refractometer,
    Tonometer,
    FundusCamera,
    SpecularMicroscope,
    Keratometer,
    ArchiveNas,
    Other,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceType::Oct => "oct",
            DeviceType::Refractometer => "refractometer",
            DeviceType::Tonometer => "tonometer",
            DeviceType::FundusCamera => "fundus-camera",
            DeviceType::SpecularMicroscope => "specular-microscope",
            DeviceType::Keratometer => "keratometer",
            DeviceType::ArchiveNas => "archive-nas",
            DeviceType::Other => "other",
        };
        write!(f, "{name}")
    }
}

/// How the device hands files to the clinic network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionProtocol {
    Smb,
    Webhook,
    FolderSync,
    Api,
    Manual,
}

/// Integration status surfaced to device list views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceStatus {
    Connected,
    Disconnected,
    Error,
    Pending,
    NotConfigured,
}

/// SMB share coordinates and credentials for one device.
///
/// `username = "guest"` with an empty password is a valid configuration for
/// devices exporting anonymous shares.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareCredentials {
    pub host: String,
    pub share: String,
    #[serde(default)]
    pub domain: Option<String>,
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Seconds of idle time before the transport closes the session.
    #[serde(default = "default_auto_close_timeout")]
    pub auto_close_timeout: u64,
}

fn default_auto_close_timeout() -> u64 {
    30
}

/// Outcome of the most recent sync attempt, kept on the device document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOutcome {
    Success,
    Failed,
}

/// Mutable integration-state fields. The external store owns the device
/// document; the core has write authority over these fields only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegrationState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<DeviceStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<ConnectionProtocol>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_connection: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_webhook: Option<DateTime<Utc>>,
    #[serde(default)]
    pub consecutive_errors: u32,
    #[serde(default)]
    pub webhook_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_status: Option<SyncOutcome>,
}

/// Device document as read from the external store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub protocol: ConnectionProtocol,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub share: Option<ShareCredentials>,
    /// Base path inside the share the device writes exports to.
    #[serde(default)]
    pub export_path: String,
    /// Locally mounted path for the share, when one exists on this host.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mount_path: Option<String>,
    /// Shared secret used to verify inbound webhook signatures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_secret: Option<String>,
    #[serde(default)]
    pub integration: IntegrationState,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl Device {
    /// Devices the scheduled poller considers: active, SMB-configured.
    pub fn is_pollable(&self) -> bool {
        self.active && self.protocol == ConnectionProtocol::Smb && self.share.is_some()
    }
}
