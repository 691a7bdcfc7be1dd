//! Built-in job handlers.
//!
//! These wire the queue to the rest of the core: SMB reads, the strategy
//! chain, adapters, and the folder indexer. Everything arrives through one
//! [`HandlerContext`] built at startup, so no handler reaches for global
//! state.

use crate::adapters::{AdapterService, ParseContext};
use crate::error::{IntegrationError, Result};
use crate::events::{Broadcaster, FileEvent};
use crate::indexer::PatientFolderIndexer;
use crate::ports::{DeviceStore, PatientDirectory};
use crate::processor::{ProcessorOptions, UniversalFileProcessor};
use crate::queue::job::{Job, JobPayload, JobType};
use crate::queue::worker::{DeviceSyncQueue, JobHandler, payload_mismatch};
use crate::smb::SmbClientPool;
use async_trait::async_trait;
use oculink_model::{Device, InitiatedBy, PatientId, SourceChannel};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Minimum name-heuristic score for resolving extracted identity to a
/// patient record without operator review.
const NAME_RESOLUTION_SCORE: f64 = 0.85;

/// Shared dependencies for every built-in handler.
pub struct HandlerContext {
    pub devices: Arc<dyn DeviceStore>,
    pub directory: Arc<dyn PatientDirectory>,
    pub pool: SmbClientPool,
    pub processor: UniversalFileProcessor,
    pub adapters: AdapterService,
    pub indexer: PatientFolderIndexer,
    pub broadcaster: Broadcaster,
}

impl std::fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerContext").finish()
    }
}

fn initiated_by(source: SourceChannel) -> InitiatedBy {
    match source {
        SourceChannel::Webhook | SourceChannel::Watcher => InitiatedBy::Device,
        SourceChannel::ScheduledSync => InitiatedBy::Scheduled,
        SourceChannel::Manual => InitiatedBy::Manual,
    }
}

async fn resolve_device(ctx: &HandlerContext, id: &oculink_model::DeviceId) -> Result<Device> {
    ctx.devices
        .get(id)
        .await?
        .ok_or_else(|| IntegrationError::NotFound(format!("device {id}")))
}

/// Resolve the extracted identity to a patient record: explicit id from the
/// job, device-local id via the directory, then a strong unique name hit.
async fn resolve_patient(
    ctx: &HandlerContext,
    explicit: Option<&PatientId>,
    info: Option<&oculink_model::PatientInfo>,
) -> Result<Option<PatientId>> {
    if let Some(patient) = explicit {
        return Ok(Some(patient.clone()));
    }
    let Some(info) = info else {
        return Ok(None);
    };

    if let Some(device_local_id) = &info.patient_id
        && let Some(candidate) = ctx.directory.find_by_legacy_id(device_local_id).await?
    {
        return Ok(Some(candidate.patient));
    }

    if let Some(last_name) = &info.last_name {
        let candidates = ctx
            .directory
            .search_by_name(last_name, info.first_name.as_deref())
            .await?;
        let strong: Vec<_> = candidates
            .iter()
            .filter(|c| c.score >= NAME_RESOLUTION_SCORE)
            .collect();
        if let [only] = strong.as_slice() {
            return Ok(Some(only.patient.clone()));
        }
    }
    Ok(None)
}

/// End-to-end processing of one remote file: download, extract identity,
/// parse with the device adapter, persist when a patient resolved.
async fn process_single_file(
    ctx: &HandlerContext,
    device: &Device,
    path: &str,
    explicit_patient: Option<&PatientId>,
    source: SourceChannel,
) -> Result<Value> {
    let read = ctx.pool.read_file(device, path).await?;
    debug!(device = %device.id, path, from_cache = read.from_cache, "file downloaded");

    let options = ProcessorOptions {
        device_type_hint: Some(device.device_type),
        use_ocr: true,
    };
    let output = ctx.processor.process_file(&read.local_path, &options).await;
    let patient = resolve_patient(ctx, explicit_patient, output.patient_info.as_ref()).await?;

    // Records come from the processor's adapter pass when it ran, otherwise
    // from a direct parse.
    let records: Vec<Value> = match output.raw_data.clone() {
        Some(Value::Array(records)) => records,
        _ => match ctx.adapters.registry().lookup(device.device_type) {
            Some(adapter) => {
                let mut parse_ctx = ParseContext::for_device(device, source);
                parse_ctx.patient = patient.clone();
                adapter
                    .parse_file(&read.local_path, &parse_ctx)
                    .await
                    .unwrap_or_default()
            }
            None => Vec::new(),
        },
    };

    let mut measurements = 0u32;
    let mut persist_error: Option<String> = None;
    if let Some(patient) = &patient
        && !records.is_empty()
    {
        let outcome = ctx
            .adapters
            .process(device, &records, patient, None, source, initiated_by(source))
            .await;
        measurements = outcome
            .measurement_ids
            .as_ref()
            .map(|ids| ids.len() as u32)
            .unwrap_or(0);
        persist_error = outcome.error.map(|e| e.message);
    }

    // Image captures additionally get a file-handoff record.
    let mut image_id = None;
    let is_image = path
        .rsplit('.')
        .next()
        .map(|ext| {
            matches!(
                ext.to_ascii_lowercase().as_str(),
                "jpg" | "jpeg" | "png" | "tif" | "tiff" | "bmp"
            )
        })
        .unwrap_or(false);
    if is_image && let Some(patient) = &patient {
        let image = oculink_model::DeviceImage {
            device: device.id.clone(),
            patient: patient.clone(),
            exam: None,
            file_name: path.rsplit('/').next().unwrap_or(path).to_string(),
            content_path: read.local_path.to_string_lossy().into_owned(),
            eye: output.patient_info.as_ref().and_then(|info| info.laterality),
            captured_at: chrono::Utc::now(),
            source_channel: source,
        };
        match ctx.adapters.save_image(&image).await {
            Ok(id) => image_id = Some(id),
            Err(e) => warn!(device = %device.id, path, error = %e, "image record not saved"),
        }
    }

    ctx.broadcaster.publish(FileEvent::Processed {
        device: device.id.clone(),
        path: path.to_string(),
        measurements,
    });

    Ok(json!({
        "path": path,
        "from_cache": read.from_cache,
        "patient": patient.as_ref().map(|p| p.as_str()),
        "patient_resolved": patient.is_some(),
        "patient_info": output.patient_info,
        "method": output.method,
        "confidence": output.confidence,
        "records_parsed": records.len(),
        "measurements": measurements,
        "image_id": image_id,
        "persist_error": persist_error,
    }))
}

struct FileProcessHandler {
    ctx: Arc<HandlerContext>,
}

#[async_trait]
impl JobHandler for FileProcessHandler {
    async fn handle(&self, job: &Job) -> Result<Value> {
        let JobPayload::FileProcess(payload) = &job.payload else {
            return Err(payload_mismatch(job));
        };
        let device = resolve_device(&self.ctx, &payload.device).await?;
        process_single_file(
            &self.ctx,
            &device,
            &payload.path,
            payload.patient.as_ref(),
            payload.source,
        )
        .await
    }
}

struct PatientMatchHandler {
    ctx: Arc<HandlerContext>,
}

#[async_trait]
impl JobHandler for PatientMatchHandler {
    async fn handle(&self, job: &Job) -> Result<Value> {
        let JobPayload::PatientMatch(payload) = &job.payload else {
            return Err(payload_mismatch(job));
        };
        let device = resolve_device(&self.ctx, &payload.device).await?;
        let outcome = self
            .ctx
            .indexer
            .index_folder(&device, &payload.folder_path)
            .await?;
        Ok(serde_json::to_value(outcome)?)
    }
}

struct FolderIndexHandler {
    ctx: Arc<HandlerContext>,
}

#[async_trait]
impl JobHandler for FolderIndexHandler {
    async fn handle(&self, job: &Job) -> Result<Value> {
        let JobPayload::FolderIndex(payload) = &job.payload else {
            return Err(payload_mismatch(job));
        };
        let device = resolve_device(&self.ctx, &payload.device).await?;
        let (seen, matched) = self
            .ctx
            .indexer
            .index_device_folder(&self.ctx.pool, &device, &payload.base_path)
            .await?;
        info!(device = %device.id, seen, matched, "folder index pass finished");
        Ok(json!({"folders_seen": seen, "folders_matched": matched}))
    }
}

struct BatchImportHandler {
    ctx: Arc<HandlerContext>,
}

#[async_trait]
impl JobHandler for BatchImportHandler {
    async fn handle(&self, job: &Job) -> Result<Value> {
        let JobPayload::BatchImport(payload) = &job.payload else {
            return Err(payload_mismatch(job));
        };
        let device = resolve_device(&self.ctx, &payload.device).await?;

        let mut results = Vec::with_capacity(payload.paths.len());
        let mut succeeded = 0u32;
        for path in &payload.paths {
            match process_single_file(
                &self.ctx,
                &device,
                path,
                payload.patient.as_ref(),
                payload.source,
            )
            .await
            {
                Ok(result) => {
                    succeeded += 1;
                    results.push(json!({"path": path, "ok": true, "result": result}));
                }
                Err(e) => {
                    warn!(device = %device.id, path, error = %e, "batch item failed");
                    results.push(json!({"path": path, "ok": false, "error": e.to_string()}));
                }
            }
        }

        Ok(json!({
            "total": payload.paths.len(),
            "succeeded": succeeded,
            "failed": payload.paths.len() as u32 - succeeded,
            "results": results,
        }))
    }
}

/// Register every built-in handler on the queue.
pub async fn register_builtin_handlers(queue: &DeviceSyncQueue, ctx: Arc<HandlerContext>) {
    queue
        .register_handler(JobType::FileProcess, Arc::new(FileProcessHandler { ctx: ctx.clone() }))
        .await;
    queue
        .register_handler(JobType::PatientMatch, Arc::new(PatientMatchHandler { ctx: ctx.clone() }))
        .await;
    queue
        .register_handler(JobType::FolderIndex, Arc::new(FolderIndexHandler { ctx: ctx.clone() }))
        .await;
    queue
        .register_handler(JobType::BatchImport, Arc::new(BatchImportHandler { ctx }))
        .await;
}
