//! SMB connection pool: one handle per device, health tracking, bounded
//! exponential-backoff reconnect, and the read-through file cache.

use crate::error::{IntegrationError, Result};
use crate::events::{Broadcaster, DeviceEvent};
use crate::smb::command::SmbTransport;
use crate::smb::file_cache::FileCache;
use crate::smb::scan::{DirectoryLister, ScanOptions, ScanResult, scan_recursive};
use crate::smb::watch::{WatchHandle, start_polling_watcher};
use crate::smb::{DirectoryListing, normalize_remote_path};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use oculink_model::{Device, DeviceId, ShareCredentials};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Exponential backoff parameters for the reconnect loop.
#[derive(Debug, Clone, Serialize)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry `n` (1-based): `min(base · mult^(n-1), max)`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(retry.saturating_sub(1) as i32);
        let delay_ms = (self.base_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(delay_ms as u64)
    }
}

#[derive(Debug, Clone)]
struct ConnectionHealth {
    healthy: bool,
    last_check: DateTime<Utc>,
    last_error: Option<String>,
    consecutive_failures: u32,
}

impl ConnectionHealth {
    fn healthy_now() -> Self {
        Self {
            healthy: true,
            last_check: Utc::now(),
            last_error: None,
            consecutive_failures: 0,
        }
    }
}

/// Per-device connection state. At most one handle per device id.
#[derive(Debug, Clone)]
struct ConnectionHandle {
    creds: ShareCredentials,
    connected_at: DateTime<Utc>,
    health: ConnectionHealth,
    reconnect_attempts: u32,
}

/// Pool configuration knobs.
#[derive(Debug, Clone)]
pub struct SmbPoolConfig {
    pub cache_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub auto_reconnect: bool,
}

impl Default for SmbPoolConfig {
    fn default() -> Self {
        Self {
            cache_timeout: Duration::from_secs(300),
            reconnect: ReconnectPolicy::default(),
            auto_reconnect: true,
        }
    }
}

/// Result of a cached file read. The local path stays valid for the cache
/// timeout measured from return time.
#[derive(Debug, Clone)]
pub struct FileReadResult {
    pub local_path: PathBuf,
    pub size: u64,
    pub from_cache: bool,
}

/// Pool statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub connections: usize,
    pub healthy_connections: usize,
    pub cached_files: usize,
    pub file_reads: u64,
    pub cache_hits: u64,
    pub reconnects: u64,
    pub recent_errors: Vec<String>,
}

const ERROR_RING_CAPACITY: usize = 100;

/// Pooled SMB access for every configured device.
#[derive(Clone)]
pub struct SmbClientPool {
    transport: Arc<dyn SmbTransport>,
    connections: Arc<RwLock<HashMap<DeviceId, ConnectionHandle>>>,
    cache: FileCache,
    broadcaster: Broadcaster,
    config: SmbPoolConfig,
    file_reads: Arc<AtomicU64>,
    cache_hits: Arc<AtomicU64>,
    reconnects: Arc<AtomicU64>,
    // Errors are recorded here as well as raised, so the process never dies
    // to an unobserved failure.
    errors: Arc<RwLock<VecDeque<String>>>,
}

impl std::fmt::Debug for SmbClientPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmbClientPool")
            .field("connections", &"<map>")
            .field("config", &self.config)
            .finish()
    }
}

impl SmbClientPool {
    pub fn new(
        transport: Arc<dyn SmbTransport>,
        cache: FileCache,
        broadcaster: Broadcaster,
        config: SmbPoolConfig,
    ) -> Self {
        Self {
            transport,
            connections: Arc::new(RwLock::new(HashMap::new())),
            cache,
            broadcaster,
            config,
            file_reads: Arc::new(AtomicU64::new(0)),
            cache_hits: Arc::new(AtomicU64::new(0)),
            reconnects: Arc::new(AtomicU64::new(0)),
            errors: Arc::new(RwLock::new(VecDeque::with_capacity(ERROR_RING_CAPACITY))),
        }
    }

    pub fn cache(&self) -> &FileCache {
        &self.cache
    }

    fn share_credentials(device: &Device) -> Result<ShareCredentials> {
        device.share.clone().ok_or_else(|| {
            IntegrationError::validation("share", format!("device {} has no SMB share", device.id))
        })
    }

    async fn record_error(&self, message: String) {
        warn!(error = %message, "smb pool error");
        let mut errors = self.errors.write().await;
        if errors.len() == ERROR_RING_CAPACITY {
            errors.pop_front();
        }
        errors.push_back(message);
    }

    /// Get a usable credential snapshot for the device, establishing or
    /// re-establishing the connection as needed. `skip_retry` bypasses the
    /// reconnect loop (used by probes that report rather than recover).
    async fn acquire(&self, device: &Device, skip_retry: bool) -> Result<ShareCredentials> {
        {
            let connections = self.connections.read().await;
            if let Some(handle) = connections.get(&device.id)
                && handle.health.healthy
            {
                return Ok(handle.creds.clone());
            }
        }
        self.connect(device, skip_retry).await
    }

    /// Probe-and-register loop. A loop, not recursion: attempts are bounded
    /// by the policy, so the call stack stays flat.
    async fn connect(&self, device: &Device, skip_retry: bool) -> Result<ShareCredentials> {
        let creds = Self::share_credentials(device)?;
        let policy = self.config.reconnect.clone();
        let mut attempt: u32 = 1;

        loop {
            match self.transport.probe(&creds).await {
                Ok(()) => {
                    if attempt > 1 {
                        self.reconnects.fetch_add(1, Ordering::Relaxed);
                        self.broadcaster.publish(DeviceEvent::Reconnected {
                            device: device.id.clone(),
                            attempts: attempt,
                        });
                        info!(device = %device.id, attempts = attempt, "smb reconnected");
                    }
                    let mut connections = self.connections.write().await;
                    connections.insert(
                        device.id.clone(),
                        ConnectionHandle {
                            creds: creds.clone(),
                            connected_at: Utc::now(),
                            health: ConnectionHealth::healthy_now(),
                            reconnect_attempts: 0,
                        },
                    );
                    return Ok(creds);
                }
                Err(e) => {
                    self.mark_unhealthy(&device.id, &creds, &e).await;
                    self.record_error(format!("connect {}: {e}", device.id)).await;

                    if skip_retry || !self.config.auto_reconnect {
                        return Err(e);
                    }
                    if attempt >= policy.max_attempts {
                        self.broadcaster.publish(DeviceEvent::ReconnectFailed {
                            device: device.id.clone(),
                            attempts: attempt,
                            error: e.to_string(),
                        });
                        return Err(IntegrationError::ReconnectExhausted {
                            device: device.id.to_string(),
                            attempts: attempt,
                        });
                    }

                    let delay = policy.delay_for(attempt);
                    attempt += 1;
                    self.broadcaster.publish(DeviceEvent::Reconnecting {
                        device: device.id.clone(),
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                    });
                    debug!(device = %device.id, attempt, delay_ms = delay.as_millis() as u64, "smb reconnect backoff");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn mark_unhealthy(&self, device: &DeviceId, creds: &ShareCredentials, error: &IntegrationError) {
        let mut connections = self.connections.write().await;
        let handle = connections
            .entry(device.clone())
            .or_insert_with(|| ConnectionHandle {
                creds: creds.clone(),
                connected_at: Utc::now(),
                health: ConnectionHealth::healthy_now(),
                reconnect_attempts: 0,
            });
        handle.health.healthy = false;
        handle.health.last_check = Utc::now();
        handle.health.last_error = Some(error.to_string());
        handle.health.consecutive_failures += 1;
        handle.reconnect_attempts += 1;
    }

    /// Run one transport operation, degrading the handle's health on
    /// transport failure so the next use reconnects.
    async fn run_op<T, F, Fut>(&self, device: &Device, op: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn SmbTransport>, ShareCredentials) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let creds = self.acquire(device, false).await?;
        match op(self.transport.clone(), creds.clone()).await {
            Ok(value) => Ok(value),
            Err(e) => {
                if e.is_transient() {
                    self.mark_unhealthy(&device.id, &creds, &e).await;
                }
                self.record_error(format!("{}: {e}", device.id)).await;
                Err(e)
            }
        }
    }

    /// One-shot connectivity probe without the reconnect loop.
    pub async fn test_connection(&self, device: &Device) -> Result<()> {
        self.acquire(device, true).await.map(|_| ())
    }

    pub async fn list_directory(&self, device: &Device, subpath: &str) -> Result<DirectoryListing> {
        let path = normalize_remote_path(subpath);
        self.run_op(device, |transport, creds| async move {
            transport.list_directory(&creds, &path).await
        })
        .await
    }

    /// Read a remote file through the cache.
    pub async fn read_file(&self, device: &Device, filepath: &str) -> Result<FileReadResult> {
        let path = normalize_remote_path(filepath);
        self.file_reads.fetch_add(1, Ordering::Relaxed);

        if let Some(local_path) = self.cache.get(&device.id, &path).await {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            let size = tokio::fs::metadata(&local_path).await.map(|m| m.len()).unwrap_or(0);
            debug!(device = %device.id, path = %path, "smb read served from cache");
            return Ok(FileReadResult {
                local_path,
                size,
                from_cache: true,
            });
        }

        let local_path = self.cache.local_path_for(&path);
        let fetch_path = path.clone();
        let fetch_local = local_path.clone();
        let size = self
            .run_op(device, |transport, creds| async move {
                transport.fetch_file(&creds, &fetch_path, &fetch_local).await
            })
            .await?;

        self.cache.insert(&device.id, &path, local_path.clone()).await;
        Ok(FileReadResult {
            local_path,
            size,
            from_cache: false,
        })
    }

    pub async fn write_file(&self, device: &Device, local: &Path, filepath: &str) -> Result<()> {
        let path = normalize_remote_path(filepath);
        let local = local.to_path_buf();
        self.run_op(device, |transport, creds| async move {
            transport.store_file(&creds, &local, &path).await
        })
        .await
    }

    pub async fn file_exists(&self, device: &Device, filepath: &str) -> Result<bool> {
        let path = normalize_remote_path(filepath);
        self.run_op(device, |transport, creds| async move {
            transport.exists(&creds, &path).await
        })
        .await
    }

    pub async fn mkdir(&self, device: &Device, dirpath: &str) -> Result<()> {
        let path = normalize_remote_path(dirpath);
        self.run_op(device, |transport, creds| async move {
            transport.make_directory(&creds, &path).await
        })
        .await
    }

    pub async fn unlink(&self, device: &Device, filepath: &str) -> Result<()> {
        let path = normalize_remote_path(filepath);
        self.run_op(device, |transport, creds| async move {
            transport.remove_file(&creds, &path).await
        })
        .await
    }

    /// Bounded recursive scan rooted at `base`.
    pub async fn scan_directory_recursive(
        &self,
        device: &Device,
        base: &str,
        options: &ScanOptions,
    ) -> Result<ScanResult> {
        // Establish the connection up front so auth failures surface as an
        // error instead of an empty result.
        self.acquire(device, false).await?;
        let lister = PoolLister {
            pool: self.clone(),
            device: device.clone(),
        };
        Ok(scan_recursive(&lister, &normalize_remote_path(base), options).await)
    }

    /// Files modified strictly after `since`, full-depth scan.
    pub async fn find_new_files(
        &self,
        device: &Device,
        base: &str,
        since: DateTime<Utc>,
    ) -> Result<ScanResult> {
        let options = ScanOptions {
            modified_after: Some(since),
            ..ScanOptions::default()
        };
        self.scan_directory_recursive(device, base, &options).await
    }

    /// Start a polling change watcher on `base`. SMB has no inotify, so
    /// change detection is scan + diff.
    pub async fn start_watching(
        &self,
        device: &Device,
        base: &str,
        interval: Duration,
    ) -> Result<WatchHandle> {
        self.acquire(device, false).await?;
        let lister = PoolLister {
            pool: self.clone(),
            device: device.clone(),
        };
        Ok(start_polling_watcher(
            Arc::new(lister),
            normalize_remote_path(base),
            interval,
        ))
    }

    pub async fn close_connection(&self, device: &DeviceId) {
        if self.connections.write().await.remove(device).is_some() {
            info!(device = %device, "smb connection closed");
        }
    }

    /// Close every handle and clear the file cache.
    pub async fn close_all(&self) {
        let count = {
            let mut connections = self.connections.write().await;
            let count = connections.len();
            connections.clear();
            count
        };
        let cleared = self.cache.clear().await;
        info!(connections = count, cached_files = cleared, "smb pool closed");
    }

    /// Drop the handle and re-run the connect loop.
    pub async fn force_reconnect(&self, device: &Device) -> Result<()> {
        self.close_connection(&device.id).await;
        self.connect(device, false).await.map(|_| ())
    }

    pub async fn get_stats(&self) -> PoolStats {
        let connections = self.connections.read().await;
        let healthy = connections.values().filter(|h| h.health.healthy).count();
        PoolStats {
            connections: connections.len(),
            healthy_connections: healthy,
            cached_files: self.cache.len().await,
            file_reads: self.file_reads.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            recent_errors: self.errors.read().await.iter().cloned().collect(),
        }
    }

    /// Consecutive-failure count for a device, for status views.
    pub async fn consecutive_failures(&self, device: &DeviceId) -> u32 {
        self.connections
            .read()
            .await
            .get(device)
            .map(|h| h.health.consecutive_failures)
            .unwrap_or(0)
    }

    /// Age of the connection handle, if one exists.
    pub async fn connected_since(&self, device: &DeviceId) -> Option<DateTime<Utc>> {
        self.connections
            .read()
            .await
            .get(device)
            .map(|h| h.connected_at)
    }
}

/// Lister bound to one device through the pool.
struct PoolLister {
    pool: SmbClientPool,
    device: Device,
}

#[async_trait]
impl DirectoryLister for PoolLister {
    async fn list(&self, path: &str) -> Result<DirectoryListing> {
        self.pool.list_directory(&self.device, path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_delays_are_monotone_and_clamped() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(4000));
        // Far retries clamp to the ceiling.
        assert_eq!(policy.delay_for(10), Duration::from_millis(60_000));

        let mut previous = Duration::ZERO;
        for retry in 1..=12 {
            let delay = policy.delay_for(retry);
            assert!(delay >= previous);
            previous = delay;
        }
    }
}
