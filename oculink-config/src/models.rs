use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub ocr: OcrConfig,
    pub smb: SmbSection,
    pub sync: SyncSection,
    pub queue: QueueSection,
    /// Directory for the SMB file cache; a temp dir when unset.
    pub cache_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8087,
        }
    }
}

/// Redis is optional: without it the job queue degrades to the in-process
/// fallback.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    pub base_url: String,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5005".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmbSection {
    /// Path to the smbclient binary.
    pub client_path: String,
    pub command_timeout_secs: u64,
    pub cache_timeout_secs: u64,
    pub auto_reconnect: bool,
    pub reconnect: ReconnectSettings,
}

impl Default for SmbSection {
    fn default() -> Self {
        Self {
            client_path: "smbclient".to_string(),
            command_timeout_secs: 30,
            cache_timeout_secs: 300,
            auto_reconnect: true,
            reconnect: ReconnectSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    pub poll_interval_minutes: u64,
    pub watch_interval_secs: u64,
    /// Start the scheduled poller at boot.
    pub auto_start: bool,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            poll_interval_minutes: 5,
            watch_interval_secs: 30,
            auto_start: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    pub concurrency: usize,
    pub seen_ttl_secs: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            concurrency: 3,
            seen_ttl_secs: 300,
        }
    }
}
