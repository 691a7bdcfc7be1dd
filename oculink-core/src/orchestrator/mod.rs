//! Sync orchestrator.
//!
//! Drives per-device ingestion from four triggers: the scheduled poller,
//! SMB polling watchers, locally mounted filesystem watchers, and inbound
//! webhooks. A per-device single-flight guard keeps concurrent syncs from
//! overlapping; every state change goes out through the broadcaster.

pub mod fs_watcher;

pub use fs_watcher::{LocalWatchHandle, start_local_watcher};

use crate::error::{IntegrationError, Result};
use crate::events::{Broadcaster, DeviceEvent, FileEvent};
use crate::ports::{DeviceStore, IntegrationLogStore};
use crate::queue::{
    AddJobOptions, BatchImportJob, DeviceSyncQueue, FileProcessJob, FolderIndexJob, JobPayload,
    JobPriority, PatientMatchJob,
};
use crate::smb::{RemoteEntry, ScanOptions, SmbClientPool, WatchEvent};
use crate::webhook;
use chrono::{DateTime, Utc};
use oculink_model::{
    Device, DeviceId, DeviceStatus, InitiatedBy, IntegrationLogEntry, IntegrationStatus,
    PatientId, SourceChannel, SyncOutcome, WebhookAudit,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

const FULL_SCAN_DEPTH: u32 = 5;
const FULL_SCAN_MAX_FILES: usize = 1000;
/// Webhook event types the dispatcher understands. Everything else is
/// logged and dropped.
const WEBHOOK_EVENT_TYPES: &[&str] = &[
    "file_created",
    "file_modified",
    "exam_complete",
    "folder_created",
];

/// Orchestrator tuning.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub poll_interval: Duration,
    /// Interval for the SMB polling watchers.
    pub watch_interval: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5 * 60),
            watch_interval: Duration::from_secs(30),
        }
    }
}

/// Per-device sync state, kept in memory.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceSyncState {
    pub syncing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_result: Option<SyncSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    pub files_queued: u32,
    pub files_skipped: u32,
    pub directories_seen: u32,
    pub duration_ms: u64,
}

/// Result of one `sync_device` call.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub device: DeviceId,
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<SyncSummary>,
}

/// Outcome of webhook ingestion, mapped to HTTP by the server layer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Processed { event_type: String },
    InvalidSignature,
    UnknownDevice,
}

/// Everything the webhook handler knows about the request.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub device_id: DeviceId,
    pub signature: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub payload: Value,
    pub source_ip: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Clone)]
pub struct SyncOrchestrator {
    devices: Arc<dyn DeviceStore>,
    pool: SmbClientPool,
    queue: DeviceSyncQueue,
    logs: Arc<dyn IntegrationLogStore>,
    broadcaster: Broadcaster,
    settings: Arc<RwLock<SyncSettings>>,
    sync_states: Arc<RwLock<HashMap<DeviceId, DeviceSyncState>>>,
    scheduler_running: Arc<AtomicBool>,
    local_watchers: Arc<RwLock<HashMap<DeviceId, fs_watcher::LocalWatchHandle>>>,
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator").finish()
    }
}

impl SyncOrchestrator {
    pub fn new(
        devices: Arc<dyn DeviceStore>,
        pool: SmbClientPool,
        queue: DeviceSyncQueue,
        logs: Arc<dyn IntegrationLogStore>,
        broadcaster: Broadcaster,
        settings: SyncSettings,
    ) -> Self {
        Self {
            devices,
            pool,
            queue,
            logs,
            broadcaster,
            settings: Arc::new(RwLock::new(settings)),
            sync_states: Arc::new(RwLock::new(HashMap::new())),
            scheduler_running: Arc::new(AtomicBool::new(false)),
            local_watchers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn poll_interval(&self) -> Duration {
        self.settings.read().await.poll_interval
    }

    /// Takes effect on the scheduler's next sleep.
    pub async fn set_poll_interval(&self, interval: Duration) {
        self.settings.write().await.poll_interval = interval;
        info!(interval_secs = interval.as_secs(), "poll interval updated");
    }

    /// Start the scheduled poller. Idempotent.
    pub fn start_scheduler(&self) {
        if self.scheduler_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let orchestrator = self.clone();
        tokio::spawn(async move {
            let initial_interval_secs = orchestrator.poll_interval().await.as_secs();
            info!(
                interval_secs = initial_interval_secs,
                "auto-sync scheduler started"
            );
            while orchestrator.scheduler_running.load(Ordering::SeqCst) {
                let interval = orchestrator.poll_interval().await;
                tokio::time::sleep(interval).await;
                if !orchestrator.scheduler_running.load(Ordering::SeqCst) {
                    break;
                }
                orchestrator.sync_all().await;
            }
            info!("auto-sync scheduler stopped");
        });
    }

    pub fn stop_scheduler(&self) {
        self.scheduler_running.store(false, Ordering::SeqCst);
    }

    pub fn scheduler_running(&self) -> bool {
        self.scheduler_running.load(Ordering::SeqCst)
    }

    /// One tick over the fleet. Per-device failures stay isolated.
    pub async fn sync_all(&self) -> Vec<SyncReport> {
        let devices = match self.devices.list_active().await {
            Ok(devices) => devices,
            Err(e) => {
                error!(error = %e, "device enumeration failed");
                return Vec::new();
            }
        };

        let mut reports = Vec::new();
        let (mut succeeded, mut failed, mut skipped) = (0u32, 0u32, 0u32);
        for device in devices.iter().filter(|d| d.is_pollable()) {
            match self.sync_device(device).await {
                Ok(report) => {
                    if report.skipped {
                        skipped += 1;
                    } else {
                        succeeded += 1;
                    }
                    reports.push(report);
                }
                Err(e) => {
                    failed += 1;
                    warn!(device = %device.id, error = %e, "device sync failed");
                    reports.push(SyncReport {
                        device: device.id.clone(),
                        skipped: false,
                        summary: None,
                    });
                }
            }
        }

        self.broadcaster.publish(DeviceEvent::SyncCycleComplete {
            devices: reports.len() as u32,
            succeeded,
            failed,
            skipped,
        });
        reports
    }

    /// Sync one device. Re-entrant calls while a sync is active return
    /// `skipped = true` without touching the device.
    pub async fn sync_device(&self, device: &Device) -> Result<SyncReport> {
        {
            let mut states = self.sync_states.write().await;
            let state = states.entry(device.id.clone()).or_default();
            if state.syncing {
                debug!(device = %device.id, "sync already in flight, skipping");
                return Ok(SyncReport {
                    device: device.id.clone(),
                    skipped: true,
                    summary: None,
                });
            }
            state.syncing = true;
            state.started_at = Some(Utc::now());
        }

        let result = self.run_sync(device).await;

        let mut states = self.sync_states.write().await;
        let state = states.entry(device.id.clone()).or_default();
        state.syncing = false;
        match result {
            Ok(summary) => {
                state.last_sync = Some(Utc::now());
                state.last_error = None;
                state.last_result = Some(summary.clone());
                Ok(SyncReport {
                    device: device.id.clone(),
                    skipped: false,
                    summary: Some(summary),
                })
            }
            Err(e) => {
                state.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn run_sync(&self, device: &Device) -> Result<SyncSummary> {
        let started = std::time::Instant::now();
        self.broadcaster.publish(DeviceEvent::SyncStarted {
            device: device.id.clone(),
        });

        if let Err(e) = self.pool.test_connection(device).await {
            self.record_sync_failure(device, &e).await;
            return Err(e);
        }

        let scan = match device.integration.last_sync {
            Some(last_sync) => {
                self.pool
                    .find_new_files(device, &device.export_path, last_sync)
                    .await
            }
            None => {
                let options = ScanOptions::shallow(FULL_SCAN_DEPTH, FULL_SCAN_MAX_FILES);
                self.pool
                    .scan_directory_recursive(device, &device.export_path, &options)
                    .await
            }
        };
        let scan = match scan {
            Ok(scan) => scan,
            Err(e) => {
                self.record_sync_failure(device, &e).await;
                return Err(e);
            }
        };

        let mut files_queued = 0u32;
        let mut files_skipped = 0u32;
        for file in &scan.files {
            if self.is_duplicate(device, file).await {
                files_skipped += 1;
                continue;
            }
            self.enqueue_file_process(
                device,
                &file.path,
                None,
                JobPriority::new(5).expect("static priority"),
                SourceChannel::ScheduledSync,
            )
            .await?;
            files_queued += 1;
        }

        if !scan.directories.is_empty() {
            self.queue
                .add_job(
                    JobPayload::FolderIndex(FolderIndexJob {
                        device: device.id.clone(),
                        base_path: device.export_path.clone(),
                    }),
                    AddJobOptions {
                        priority: Some(JobPriority::new(7).expect("static priority")),
                        ..Default::default()
                    },
                )
                .await?;
        }

        let mut integration = device.integration.clone();
        integration.status = Some(DeviceStatus::Connected);
        integration.method = Some(device.protocol);
        integration.last_sync = Some(Utc::now());
        integration.last_connection = Some(Utc::now());
        integration.consecutive_errors = 0;
        integration.last_sync_status = Some(SyncOutcome::Success);
        self.devices.update_integration(&device.id, &integration).await?;

        let summary = SyncSummary {
            files_queued,
            files_skipped,
            directories_seen: scan.directories.len() as u32,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            device = %device.id,
            files_queued,
            files_skipped,
            directories = summary.directories_seen,
            "device sync completed"
        );
        self.broadcaster.publish(DeviceEvent::SyncCompleted {
            device: device.id.clone(),
            files_queued,
            directories_seen: summary.directories_seen,
        });
        Ok(summary)
    }

    async fn record_sync_failure(&self, device: &Device, error: &IntegrationError) {
        self.broadcaster.publish(DeviceEvent::SyncError {
            device: device.id.clone(),
            error: error.to_string(),
        });
        let mut integration = device.integration.clone();
        integration.status = Some(DeviceStatus::Error);
        integration.consecutive_errors = integration.consecutive_errors.saturating_add(1);
        integration.last_sync_status = Some(SyncOutcome::Failed);
        if let Err(e) = self.devices.update_integration(&device.id, &integration).await {
            error!(device = %device.id, error = %e, "failed to record sync failure");
        }
    }

    /// Dedup: a fingerprint marker in Redis (short TTL), with the file
    /// cache as the signal when Redis is absent.
    async fn is_duplicate(&self, device: &Device, file: &RemoteEntry) -> bool {
        if self.pool.cache().get(&device.id, &file.path).await.is_some() {
            return true;
        }
        let mtime = file.modified.map(|m| m.timestamp()).unwrap_or(0);
        match self
            .queue
            .try_mark_seen(device.id.as_str(), &file.path, mtime)
            .await
        {
            Ok(fresh) => !fresh,
            Err(e) => {
                debug!(error = %e, "dedup marker unavailable, enqueueing anyway");
                false
            }
        }
    }

    async fn enqueue_file_process(
        &self,
        device: &Device,
        path: &str,
        patient: Option<PatientId>,
        priority: JobPriority,
        source: SourceChannel,
    ) -> Result<()> {
        self.queue
            .add_job(
                JobPayload::FileProcess(FileProcessJob {
                    device: device.id.clone(),
                    path: path.to_string(),
                    patient,
                    source,
                }),
                AddJobOptions {
                    priority: Some(priority),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    /// Priority for a watcher-detected file: structured formats preempt
    /// generic ones.
    fn watcher_priority(path: &str) -> JobPriority {
        let structured = path
            .rsplit('.')
            .next()
            .map(|ext| {
                matches!(
                    ext.to_ascii_lowercase().as_str(),
                    "xml" | "dcm" | "dicom" | "dic"
                )
            })
            .unwrap_or(false);
        JobPriority::new(if structured { 2 } else { 5 }).expect("static priority")
    }

    /// Attach an SMB polling watcher to a device and pump its events into
    /// the queue and broadcaster.
    pub async fn start_device_watcher(&self, device: &Device) -> Result<()> {
        let watch_interval = self.settings.read().await.watch_interval;
        let mut handle = self
            .pool
            .start_watching(device, &device.export_path, watch_interval)
            .await?;
        let orchestrator = self.clone();
        let device = device.clone();
        tokio::spawn(async move {
            while let Some(event) = handle.events.recv().await {
                match event {
                    WatchEvent::Added(entry) | WatchEvent::Changed(entry) => {
                        orchestrator.broadcaster.publish(FileEvent::Detected {
                            device: device.id.clone(),
                            path: entry.path.clone(),
                            size: entry.size,
                        });
                        let priority = Self::watcher_priority(&entry.path);
                        if let Err(e) = orchestrator
                            .enqueue_file_process(
                                &device,
                                &entry.path,
                                None,
                                priority,
                                SourceChannel::Watcher,
                            )
                            .await
                        {
                            error!(device = %device.id, error = %e, "watcher enqueue failed");
                        }
                    }
                    WatchEvent::Removed { path } => {
                        orchestrator.broadcaster.publish(FileEvent::Removed {
                            device: device.id.clone(),
                            path,
                        });
                    }
                    WatchEvent::Error(message) => {
                        warn!(device = %device.id, error = %message, "smb watcher error");
                    }
                }
            }
        });
        Ok(())
    }

    /// Webhook ingress. The server layer translates the outcome to HTTP
    /// (401 / 404 / 200).
    pub async fn handle_webhook(&self, request: WebhookRequest) -> Result<WebhookOutcome> {
        let Some(device) = self.devices.get(&request.device_id).await? else {
            return Ok(WebhookOutcome::UnknownDevice);
        };

        let body = webhook::canonical_body(&request.payload);
        let signature = request.signature.as_deref().unwrap_or_default();
        let secret = device.webhook_secret.as_deref().unwrap_or_default();
        let verified = webhook::verify(&body, signature, secret);

        let event_type = request
            .payload
            .get("eventType")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();

        let mut entry = IntegrationLogEntry::begin(
            device.id.clone(),
            device.device_type.to_string(),
            event_type.clone(),
            "webhook",
            InitiatedBy::Device,
        );
        entry.source.ip_address = request.source_ip.clone();
        entry.source.user_agent = request.user_agent.clone();
        entry.webhook = Some(WebhookAudit {
            signature: signature.to_string(),
            signature_verified: verified,
            headers: request.headers.clone(),
            payload: request.payload.clone(),
        });

        if !verified {
            let entry = entry.fail("INVALID_SIGNATURE", "webhook signature verification failed");
            if let Err(e) = self.logs.append(&entry).await {
                error!(device = %device.id, error = %e, "integration log write failed");
            }
            let mut integration = device.integration.clone();
            integration.consecutive_errors = integration.consecutive_errors.saturating_add(1);
            integration.last_sync_status = Some(SyncOutcome::Failed);
            self.devices.update_integration(&device.id, &integration).await?;
            warn!(device = %device.id, "webhook rejected: invalid signature");
            return Ok(WebhookOutcome::InvalidSignature);
        }

        let dispatched = self.dispatch_webhook_event(&device, &event_type, &request.payload).await;
        let entry = match &dispatched {
            Ok(()) => entry.complete(IntegrationStatus::Success),
            Err(e) => entry.fail("DISPATCH_FAILED", e.to_string()),
        };
        if let Err(e) = self.logs.append(&entry).await {
            error!(device = %device.id, error = %e, "integration log write failed");
        }

        let mut integration = device.integration.clone();
        match &dispatched {
            Ok(()) => {
                integration.last_webhook = Some(Utc::now());
                integration.webhook_count = integration.webhook_count.saturating_add(1);
                integration.consecutive_errors = 0;
                integration.last_sync_status = Some(SyncOutcome::Success);
            }
            Err(_) => {
                integration.consecutive_errors = integration.consecutive_errors.saturating_add(1);
                integration.last_sync_status = Some(SyncOutcome::Failed);
            }
        }
        self.devices.update_integration(&device.id, &integration).await?;
        dispatched?;

        self.broadcaster.publish(DeviceEvent::WebhookReceived {
            device: device.id.clone(),
            event_type: event_type.clone(),
        });
        Ok(WebhookOutcome::Processed { event_type })
    }

    async fn dispatch_webhook_event(
        &self,
        device: &Device,
        event_type: &str,
        payload: &Value,
    ) -> Result<()> {
        if !WEBHOOK_EVENT_TYPES.contains(&event_type) {
            info!(device = %device.id, event_type, "unhandled webhook event type, ignoring");
            return Ok(());
        }

        let patient = payload
            .get("patientId")
            .and_then(Value::as_str)
            .and_then(|raw| PatientId::parse(raw).ok());

        match event_type {
            "file_created" | "file_modified" => {
                let path = payload
                    .get("filePath")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        IntegrationError::validation("filePath", "missing from webhook payload")
                    })?;
                self.enqueue_file_process(
                    device,
                    path,
                    patient,
                    JobPriority::HIGHEST,
                    SourceChannel::Webhook,
                )
                .await
            }
            "exam_complete" => {
                let paths: Vec<String> = payload
                    .get("files")
                    .and_then(Value::as_array)
                    .map(|files| {
                        files
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                self.queue
                    .add_job(
                        JobPayload::BatchImport(BatchImportJob {
                            device: device.id.clone(),
                            paths,
                            patient,
                            source: SourceChannel::Webhook,
                        }),
                        AddJobOptions {
                            priority: Some(JobPriority::HIGHEST),
                            ..Default::default()
                        },
                    )
                    .await
                    .map(|_| ())
            }
            "folder_created" => {
                let folder = payload
                    .get("folderPath")
                    .or_else(|| payload.get("folderName"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        IntegrationError::validation("folderPath", "missing from webhook payload")
                    })?;
                self.queue
                    .add_job(
                        JobPayload::PatientMatch(PatientMatchJob {
                            device: device.id.clone(),
                            folder_path: folder.to_string(),
                        }),
                        AddJobOptions {
                            priority: Some(JobPriority::new(2).expect("static priority")),
                            ..Default::default()
                        },
                    )
                    .await
                    .map(|_| ())
            }
            _ => unreachable!("filtered above"),
        }
    }

    /// Attach watchers for every active device: an SMB polling watcher per
    /// pollable share, and an inotify watcher where a share is also mounted
    /// locally on a real filesystem. Returns (smb, local) counts.
    pub async fn start_watchers(&self) -> (usize, usize) {
        let devices = match self.devices.list_active().await {
            Ok(devices) => devices,
            Err(e) => {
                error!(error = %e, "device enumeration failed, no watchers started");
                return (0, 0);
            }
        };

        let mut smb_started = 0;
        let mut local_started = 0;
        for device in devices {
            if device.is_pollable() {
                match self.start_device_watcher(&device).await {
                    Ok(()) => smb_started += 1,
                    Err(e) => warn!(device = %device.id, error = %e, "smb watcher not started"),
                }
            }
            if let Some(mount_path) = device.mount_path.clone() {
                match fs_watcher::start_local_watcher(
                    device.clone(),
                    &mount_path,
                    self.queue.clone(),
                    self.broadcaster.clone(),
                ) {
                    Ok(handle) => {
                        self.local_watchers.write().await.insert(device.id.clone(), handle);
                        local_started += 1;
                    }
                    Err(e) => {
                        info!(device = %device.id, error = %e, "local watcher not started");
                    }
                }
            }
        }
        info!(smb_started, local_started, "device watchers attached");
        (smb_started, local_started)
    }

    /// Snapshot of the in-memory sync states.
    pub async fn sync_states(&self) -> HashMap<DeviceId, DeviceSyncState> {
        self.sync_states.read().await.clone()
    }

    /// Cooperative shutdown: scheduler, watchers, workers, SMB handles,
    /// caches.
    pub async fn shutdown(&self) {
        info!("orchestrator shutting down");
        self.stop_scheduler();
        for (_, watcher) in self.local_watchers.write().await.drain() {
            watcher.stop();
        }
        self.queue.stop_processing();
        self.pool.close_all().await;
    }
}
