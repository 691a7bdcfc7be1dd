//! The device-sync queue engine: enqueue, delayed-job promotion, worker
//! dispatch, retry/backoff, dead-lettering, and the Redis-absent fallback.

use crate::error::{IntegrationError, Result};
use crate::events::{Broadcaster, JobEvent};
use crate::queue::job::{AddJobOptions, Job, JobAttempt, JobPayload, JobPriority, JobStatus, JobType};
use crate::queue::store::QueueStore;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Implementors execute one job type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<Value>;
}

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Concurrent jobs per process.
    pub concurrency: usize,
    /// Worker sleep when every priority list is empty.
    pub idle_sleep: Duration,
    /// Delayed-set promotion interval.
    pub delayed_poll: Duration,
    /// TTL of the scanned-file dedup marker.
    pub seen_ttl: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            idle_sleep: Duration::from_secs(1),
            delayed_poll: Duration::from_secs(5),
            seen_ttl: Duration::from_secs(300),
        }
    }
}

/// Receipt returned to `add_job` callers.
#[derive(Debug, Clone, Serialize)]
pub struct AddJobReceipt {
    pub job_id: String,
    pub status: JobStatus,
}

/// Stats snapshot; `durable` is false when running on the in-process
/// fallback, i.e. at-least-once delivery is degraded to best-effort.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub durable: bool,
    pub processing: bool,
    pub active_jobs: usize,
    pub pending: u64,
    pub delayed: u64,
    pub failed: u64,
    pub processed_total: u64,
    pub failed_total: u64,
    pub handlers: Vec<String>,
}

const LOCAL_JOB_CAP: usize = 256;

/// Durable priority job queue with ten bands and an in-process fallback.
#[derive(Clone)]
pub struct DeviceSyncQueue {
    store: Option<Arc<dyn QueueStore>>,
    handlers: Arc<RwLock<HashMap<JobType, Arc<dyn JobHandler>>>>,
    broadcaster: Broadcaster,
    config: QueueConfig,
    processing: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
    processed_total: Arc<AtomicU64>,
    failed_total: Arc<AtomicU64>,
    /// Fallback-mode jobs, kept so `get_job` still answers when degraded.
    local_jobs: Arc<RwLock<HashMap<String, Job>>>,
}

impl std::fmt::Debug for DeviceSyncQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSyncQueue")
            .field("durable", &self.store.is_some())
            .field("config", &self.config)
            .finish()
    }
}

impl DeviceSyncQueue {
    pub fn with_store(
        store: Arc<dyn QueueStore>,
        broadcaster: Broadcaster,
        config: QueueConfig,
    ) -> Self {
        Self {
            store: Some(store),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            broadcaster,
            config,
            processing: Arc::new(AtomicBool::new(false)),
            active: Arc::new(AtomicUsize::new(0)),
            processed_total: Arc::new(AtomicU64::new(0)),
            failed_total: Arc::new(AtomicU64::new(0)),
            local_jobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Degraded mode: jobs run synchronously in-process at enqueue time.
    pub fn without_redis(broadcaster: Broadcaster, config: QueueConfig) -> Self {
        warn!("Redis unavailable: job queue running in non-durable fallback mode");
        Self {
            store: None,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            broadcaster,
            config,
            processing: Arc::new(AtomicBool::new(false)),
            active: Arc::new(AtomicUsize::new(0)),
            processed_total: Arc::new(AtomicU64::new(0)),
            failed_total: Arc::new(AtomicU64::new(0)),
            local_jobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn is_durable(&self) -> bool {
        self.store.is_some()
    }

    pub async fn register_handler(&self, job_type: JobType, handler: Arc<dyn JobHandler>) {
        self.handlers.write().await.insert(job_type, handler);
    }

    /// Enqueue a job. With Redis attached the receipt reports `pending` or
    /// `delayed`; in fallback mode the job has already run and the receipt
    /// carries its terminal status.
    pub async fn add_job(
        &self,
        payload: JobPayload,
        options: AddJobOptions,
    ) -> Result<AddJobReceipt> {
        let job = Job::new(payload, &options);

        self.broadcaster.publish(JobEvent::Added {
            job_id: job.id.clone(),
            job_type: job.job_type().to_string(),
            priority: job.priority.as_u8(),
        });

        let Some(store) = &self.store else {
            return self.run_inline(job).await;
        };

        store.save_job(&job).await?;
        match job.scheduled_for {
            Some(ready_at) => {
                store
                    .schedule_delayed(&job.id, ready_at.timestamp_millis())
                    .await?;
            }
            None => store.push_ready(&job).await?,
        }
        debug!(job_id = %job.id, priority = %job.priority, "job enqueued");
        Ok(AddJobReceipt {
            job_id: job.id,
            status: job.status,
        })
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        match &self.store {
            Some(store) => store.load_job(id).await,
            None => Ok(self.local_jobs.read().await.get(id).cloned()),
        }
    }

    pub async fn get_stats(&self) -> QueueStats {
        let (pending, delayed, failed) = match &self.store {
            Some(store) => {
                let mut pending = 0u64;
                for priority in JobPriority::descending() {
                    pending += store.queue_depth(priority).await.unwrap_or(0);
                }
                (
                    pending,
                    store.delayed_count().await.unwrap_or(0),
                    store.failed_ids().await.map(|ids| ids.len() as u64).unwrap_or(0),
                )
            }
            None => (0, 0, 0),
        };
        let handlers = self
            .handlers
            .read()
            .await
            .keys()
            .map(|t| t.to_string())
            .collect();
        QueueStats {
            durable: self.store.is_some(),
            processing: self.processing.load(Ordering::SeqCst),
            active_jobs: self.active.load(Ordering::SeqCst),
            pending,
            delayed,
            failed,
            processed_total: self.processed_total.load(Ordering::Relaxed),
            failed_total: self.failed_total.load(Ordering::Relaxed),
            handlers,
        }
    }

    /// Start the delayed-job mover and the worker dispatch loop. No-op when
    /// Redis is unavailable or processing is already running.
    pub fn start_processing(&self) {
        if self.store.is_none() {
            info!("start_processing is a no-op without Redis");
            return;
        }
        if self.processing.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(concurrency = self.config.concurrency, "job queue processing started");

        let mover = self.clone();
        tokio::spawn(async move {
            while mover.processing.load(Ordering::SeqCst) {
                if let Err(e) = mover.promote_due(Utc::now().timestamp_millis()).await {
                    error!(error = %e, "delayed-job promotion failed");
                }
                tokio::time::sleep(mover.config.delayed_poll).await;
            }
        });

        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher.dispatch_loop().await;
        });
    }

    /// Cooperative stop: in-flight jobs finish or time out.
    pub fn stop_processing(&self) {
        if self.processing.swap(false, Ordering::SeqCst) {
            info!("job queue processing stopping");
        }
    }

    /// Move every due delayed job onto its priority list.
    pub(crate) async fn promote_due(&self, now_ms: i64) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let due = store.due_delayed(now_ms).await?;
        let mut moved = 0;
        for id in due {
            match store.load_job(&id).await? {
                Some(mut job) => {
                    job.status = JobStatus::Pending;
                    store.save_job(&job).await?;
                    store.push_ready(&job).await?;
                    moved += 1;
                }
                None => {
                    warn!(job_id = %id, "delayed job document expired");
                }
            }
            store.remove_delayed(&id).await?;
        }
        Ok(moved)
    }

    async fn dispatch_loop(&self) {
        while self.processing.load(Ordering::SeqCst) {
            if self.active.load(Ordering::SeqCst) >= self.config.concurrency {
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
            match self.pop_next().await {
                Ok(Some(job)) => {
                    self.active.fetch_add(1, Ordering::SeqCst);
                    let queue = self.clone();
                    tokio::spawn(async move {
                        queue.process_job(job).await;
                        queue.active.fetch_sub(1, Ordering::SeqCst);
                    });
                }
                Ok(None) => tokio::time::sleep(self.config.idle_sleep).await,
                Err(e) => {
                    // Pop failures are transient (Redis hiccup); keep looping.
                    error!(error = %e, "job pop failed");
                    tokio::time::sleep(self.config.idle_sleep).await;
                }
            }
        }
        info!("job queue dispatch loop exited");
    }

    /// First non-empty priority list wins, scanning 1 → 10.
    pub(crate) async fn pop_next(&self) -> Result<Option<Job>> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        for priority in JobPriority::descending() {
            while let Some(id) = store.pop_ready(priority).await? {
                match store.load_job(&id).await? {
                    Some(job) => return Ok(Some(job)),
                    None => warn!(job_id = %id, "popped job document expired"),
                }
            }
        }
        Ok(None)
    }

    pub(crate) async fn process_job(&self, mut job: Job) {
        let handler = {
            let handlers = self.handlers.read().await;
            handlers.get(&job.job_type()).cloned()
        };
        let Some(handler) = handler else {
            let message = format!("No handler registered for {}", job.job_type());
            self.fail_job(&mut job, message).await;
            return;
        };

        job.status = JobStatus::Processing;
        job.attempts.push(JobAttempt {
            started_at: Utc::now(),
            error: None,
        });
        let attempt = job.attempts.len() as u32;
        self.save(&job).await;
        self.broadcaster.publish(JobEvent::Started {
            job_id: job.id.clone(),
            job_type: job.job_type().to_string(),
            attempt,
        });

        let started = std::time::Instant::now();
        let outcome =
            tokio::time::timeout(Duration::from_millis(job.timeout_ms), handler.handle(&job))
                .await;

        match outcome {
            Ok(Ok(result)) => {
                job.status = JobStatus::Completed;
                job.completed_at = Some(Utc::now());
                job.result = Some(result);
                self.save(&job).await;
                self.processed_total.fetch_add(1, Ordering::Relaxed);
                self.broadcaster.publish(JobEvent::Completed {
                    job_id: job.id.clone(),
                    job_type: job.job_type().to_string(),
                    duration_ms: started.elapsed().as_millis() as u64,
                });
            }
            Ok(Err(e)) => self.handle_failure(&mut job, e.to_string()).await,
            Err(_) => {
                let message = format!("timed out after {}ms", job.timeout_ms);
                self.handle_failure(&mut job, message).await;
            }
        }
    }

    async fn handle_failure(&self, job: &mut Job, message: String) {
        if let Some(attempt) = job.attempts.last_mut() {
            attempt.error = Some(message.clone());
        }

        if job.retries_left > 0 {
            // Delay derives from attempts already failed, before this
            // retry is consumed: 1s, 2s, 4s, ...
            let delay_ms = job.retry_delay_ms();
            job.retries_left -= 1;
            job.status = JobStatus::Delayed;
            let ready_at = Utc::now() + chrono::Duration::milliseconds(delay_ms as i64);
            job.scheduled_for = Some(ready_at);
            self.save(job).await;
            if let Some(store) = &self.store
                && let Err(e) = store
                    .schedule_delayed(&job.id, ready_at.timestamp_millis())
                    .await
            {
                error!(job_id = %job.id, error = %e, "failed to schedule retry");
            }
            warn!(job_id = %job.id, delay_ms, retries_left = job.retries_left, error = %message, "job retry scheduled");
            self.broadcaster.publish(JobEvent::Retry {
                job_id: job.id.clone(),
                job_type: job.job_type().to_string(),
                retries_left: job.retries_left,
                delay_ms,
            });
        } else {
            self.fail_job(job, message).await;
        }
    }

    async fn fail_job(&self, job: &mut Job, message: String) {
        job.status = JobStatus::Failed;
        job.failed_at = Some(Utc::now());
        if job.attempts.is_empty() {
            job.attempts.push(JobAttempt {
                started_at: Utc::now(),
                error: Some(message.clone()),
            });
        } else if let Some(attempt) = job.attempts.last_mut()
            && attempt.error.is_none()
        {
            attempt.error = Some(message.clone());
        }
        self.save(job).await;
        if let Some(store) = &self.store
            && let Err(e) = store.push_failed(&job.id).await
        {
            error!(job_id = %job.id, error = %e, "failed to dead-letter job");
        }
        self.failed_total.fetch_add(1, Ordering::Relaxed);
        error!(job_id = %job.id, error = %message, "job failed");
        self.broadcaster.publish(JobEvent::Failed {
            job_id: job.id.clone(),
            job_type: job.job_type().to_string(),
            error: message,
        });
    }

    async fn save(&self, job: &Job) {
        match &self.store {
            Some(store) => {
                if let Err(e) = store.save_job(job).await {
                    error!(job_id = %job.id, error = %e, "failed to persist job state");
                }
            }
            None => {
                let mut local = self.local_jobs.write().await;
                if local.len() >= LOCAL_JOB_CAP && !local.contains_key(&job.id) {
                    let oldest = local
                        .values()
                        .min_by_key(|j| j.created_at)
                        .map(|j| j.id.clone());
                    if let Some(oldest) = oldest {
                        local.remove(&oldest);
                    }
                }
                local.insert(job.id.clone(), job.clone());
            }
        }
    }

    /// Fallback path: run the handler right here, best-effort.
    async fn run_inline(&self, mut job: Job) -> Result<AddJobReceipt> {
        self.active.fetch_add(1, Ordering::SeqCst);
        self.process_job_inline(&mut job).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(AddJobReceipt {
            status: job.status,
            job_id: job.id,
        })
    }

    async fn process_job_inline(&self, job: &mut Job) {
        let handler = {
            let handlers = self.handlers.read().await;
            handlers.get(&job.job_type()).cloned()
        };
        let Some(handler) = handler else {
            self.fail_job(job, format!("No handler registered for {}", job.job_type()))
                .await;
            return;
        };

        job.status = JobStatus::Processing;
        job.attempts.push(JobAttempt {
            started_at: Utc::now(),
            error: None,
        });
        self.broadcaster.publish(JobEvent::Started {
            job_id: job.id.clone(),
            job_type: job.job_type().to_string(),
            attempt: 1,
        });

        let started = std::time::Instant::now();
        let outcome =
            tokio::time::timeout(Duration::from_millis(job.timeout_ms), handler.handle(job)).await;
        match outcome {
            Ok(Ok(result)) => {
                job.status = JobStatus::Completed;
                job.completed_at = Some(Utc::now());
                job.result = Some(result);
                self.save(job).await;
                self.processed_total.fetch_add(1, Ordering::Relaxed);
                self.broadcaster.publish(JobEvent::Completed {
                    job_id: job.id.clone(),
                    job_type: job.job_type().to_string(),
                    duration_ms: started.elapsed().as_millis() as u64,
                });
            }
            Ok(Err(e)) => self.fail_job(job, e.to_string()).await,
            Err(_) => {
                let message = format!("timed out after {}ms", job.timeout_ms);
                self.fail_job(job, message).await;
            }
        }
    }

    /// Reload every dead-lettered job, reset its retry budget, and requeue
    /// it; then drop the DLQ. Returns how many were requeued.
    pub async fn retry_all_failed(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let ids = store.failed_ids().await?;
        let mut requeued = 0;
        for id in &ids {
            match store.load_job(id).await? {
                Some(mut job) => {
                    job.retries_left = job.retries;
                    job.status = JobStatus::Pending;
                    job.failed_at = None;
                    job.scheduled_for = None;
                    store.save_job(&job).await?;
                    store.push_ready(&job).await?;
                    requeued += 1;
                }
                None => warn!(job_id = %id, "dead-lettered job document expired"),
            }
        }
        store.clear_failed().await?;
        info!(requeued, total = ids.len(), "dead-letter queue retried");
        Ok(requeued)
    }

    /// Drop the DLQ, returning how many ids it held.
    pub async fn clear_failed_jobs(&self) -> Result<u64> {
        match &self.store {
            Some(store) => store.clear_failed().await,
            None => Ok(0),
        }
    }

    /// Plant the short-TTL dedup marker for a scanned file. Returns true
    /// when this `(device, path, mtime)` fingerprint is new. Without Redis
    /// the marker is skipped and the caller falls back to its cache check.
    pub async fn try_mark_seen(&self, device: &str, path: &str, mtime: i64) -> Result<bool> {
        match &self.store {
            Some(store) => {
                let key = crate::queue::store::QueueKeys::seen(device, path, mtime);
                store.mark_seen(&key, self.config.seen_ttl.as_secs()).await
            }
            None => Ok(true),
        }
    }
}

/// Convenience used by handlers when the payload shape does not match the
/// registered type.
pub fn payload_mismatch(job: &Job) -> IntegrationError {
    IntegrationError::Internal(format!(
        "handler received mismatched payload for job {}",
        job.id
    ))
}
