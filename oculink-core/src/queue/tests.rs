use crate::error::{IntegrationError, Result};
use crate::events::{Broadcaster, CoreEvent, JobEvent};
use crate::queue::job::*;
use crate::queue::store::QueueStore;
use crate::queue::worker::{DeviceSyncQueue, JobHandler, QueueConfig};
use async_trait::async_trait;
use chrono::Utc;
use oculink_model::{DeviceId, SourceChannel};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// In-memory stand-in for the Redis store, mirroring its list/zset/ttl
/// semantics closely enough to drive the worker logic.
#[derive(Default)]
struct MemoryStore {
    jobs: Mutex<HashMap<String, Job>>,
    queues: Mutex<HashMap<u8, VecDeque<String>>>,
    delayed: Mutex<Vec<(String, i64)>>,
    failed: Mutex<Vec<String>>,
    seen: Mutex<HashSet<String>>,
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn save_job(&self, job: &Job) -> Result<()> {
        self.jobs.lock().unwrap().insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn load_job(&self, id: &str) -> Result<Option<Job>> {
        Ok(self.jobs.lock().unwrap().get(id).cloned())
    }

    async fn push_ready(&self, job: &Job) -> Result<()> {
        self.queues
            .lock()
            .unwrap()
            .entry(job.priority.as_u8())
            .or_default()
            .push_front(job.id.clone());
        Ok(())
    }

    async fn pop_ready(&self, priority: JobPriority) -> Result<Option<String>> {
        Ok(self
            .queues
            .lock()
            .unwrap()
            .get_mut(&priority.as_u8())
            .and_then(|queue| queue.pop_back()))
    }

    async fn schedule_delayed(&self, id: &str, ready_at_ms: i64) -> Result<()> {
        self.delayed.lock().unwrap().push((id.to_string(), ready_at_ms));
        Ok(())
    }

    async fn due_delayed(&self, now_ms: i64) -> Result<Vec<String>> {
        Ok(self
            .delayed
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, ready)| *ready <= now_ms)
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn remove_delayed(&self, id: &str) -> Result<()> {
        self.delayed.lock().unwrap().retain(|(queued, _)| queued != id);
        Ok(())
    }

    async fn push_failed(&self, id: &str) -> Result<()> {
        let mut failed = self.failed.lock().unwrap();
        failed.insert(0, id.to_string());
        failed.truncate(1000);
        Ok(())
    }

    async fn failed_ids(&self) -> Result<Vec<String>> {
        Ok(self.failed.lock().unwrap().clone())
    }

    async fn clear_failed(&self) -> Result<u64> {
        let mut failed = self.failed.lock().unwrap();
        let count = failed.len() as u64;
        failed.clear();
        Ok(count)
    }

    async fn queue_depth(&self, priority: JobPriority) -> Result<u64> {
        Ok(self
            .queues
            .lock()
            .unwrap()
            .get(&priority.as_u8())
            .map(|q| q.len() as u64)
            .unwrap_or(0))
    }

    async fn delayed_count(&self) -> Result<u64> {
        Ok(self.delayed.lock().unwrap().len() as u64)
    }

    async fn mark_seen(&self, key: &str, _ttl_secs: u64) -> Result<bool> {
        Ok(self.seen.lock().unwrap().insert(key.to_string()))
    }
}

struct FailingHandler;

#[async_trait]
impl JobHandler for FailingHandler {
    async fn handle(&self, _job: &Job) -> Result<Value> {
        Err(IntegrationError::Transport("share unreachable".into()))
    }
}

struct CountingHandler {
    calls: AtomicU32,
}

#[async_trait]
impl JobHandler for CountingHandler {
    async fn handle(&self, _job: &Job) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({"ok": true}))
    }
}

struct SlowHandler;

#[async_trait]
impl JobHandler for SlowHandler {
    async fn handle(&self, _job: &Job) -> Result<Value> {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(Value::Null)
    }
}

fn device() -> DeviceId {
    DeviceId::from_trusted("device-000000000001")
}

fn file_process(path: &str) -> JobPayload {
    JobPayload::FileProcess(FileProcessJob {
        device: device(),
        path: path.to_string(),
        patient: None,
        source: SourceChannel::ScheduledSync,
    })
}

fn folder_index() -> JobPayload {
    JobPayload::FolderIndex(FolderIndexJob {
        device: device(),
        base_path: String::new(),
    })
}

fn queue_with_memory() -> (DeviceSyncQueue, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::default());
    let queue = DeviceSyncQueue::with_store(
        store.clone(),
        Broadcaster::new(256),
        QueueConfig::default(),
    );
    (queue, store)
}

fn opts(priority: u8) -> AddJobOptions {
    AddJobOptions {
        priority: Some(JobPriority::new(priority).unwrap()),
        ..Default::default()
    }
}

#[tokio::test]
async fn priority_one_preempts_twenty_band_seven_jobs() {
    let (queue, _) = queue_with_memory();
    for _ in 0..20 {
        queue.add_job(folder_index(), opts(7)).await.unwrap();
    }
    queue.add_job(file_process("exports/a.dcm"), opts(1)).await.unwrap();

    let next = queue.pop_next().await.unwrap().expect("a job is ready");
    assert_eq!(next.job_type(), JobType::FileProcess);
    assert_eq!(next.priority.as_u8(), 1);
}

#[tokio::test]
async fn fifo_within_a_priority_band() {
    let (queue, _) = queue_with_memory();
    let mut expected = Vec::new();
    for i in 0..3 {
        let receipt = queue
            .add_job(file_process(&format!("exports/{i}.dcm")), opts(5))
            .await
            .unwrap();
        expected.push(receipt.job_id);
    }

    for expected_id in expected {
        let job = queue.pop_next().await.unwrap().unwrap();
        assert_eq!(job.id, expected_id);
    }
}

#[tokio::test]
async fn retries_back_off_then_dead_letter() {
    let store = Arc::new(MemoryStore::default());
    let broadcaster = Broadcaster::new(256);
    let queue = DeviceSyncQueue::with_store(
        store.clone(),
        broadcaster.clone(),
        QueueConfig::default(),
    );
    queue
        .register_handler(JobType::FileProcess, Arc::new(FailingHandler))
        .await;
    // Subscribe before driving so no event is missed.
    let mut events = broadcaster.subscribe();

    let receipt = queue
        .add_job(file_process("exports/poison.dcm"), opts(5))
        .await
        .unwrap();

    // Drive attempt + promotion cycles by hand; the far-future clock skips
    // the real 1s/2s/4s waits.
    for _ in 0..4 {
        queue
            .promote_due(Utc::now().timestamp_millis() + 3_600_000)
            .await
            .unwrap();
        if let Some(job) = queue.pop_next().await.unwrap() {
            queue.process_job(job).await;
        }
    }

    let job = queue.get_job(&receipt.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts.len(), 4, "initial + 3 retries");
    assert!(queue_failed_contains(&queue, &receipt.job_id).await);

    let mut retry_delays = Vec::new();
    let mut failed_seen = false;
    while let Ok(event) = events.try_recv() {
        match event {
            CoreEvent::Job(JobEvent::Retry { delay_ms, .. }) => retry_delays.push(delay_ms),
            CoreEvent::Job(JobEvent::Failed { .. }) => failed_seen = true,
            _ => {}
        }
    }
    assert_eq!(retry_delays, vec![1000, 2000, 4000]);
    assert!(failed_seen);
}

async fn queue_failed_contains(queue: &DeviceSyncQueue, id: &str) -> bool {
    let stats = queue.get_stats().await;
    stats.failed > 0 && queue.get_job(id).await.unwrap().is_some()
}

#[tokio::test]
async fn missing_handler_dead_letters_immediately() {
    let (queue, store) = queue_with_memory();
    let receipt = queue
        .add_job(file_process("exports/a.dcm"), opts(5))
        .await
        .unwrap();

    let job = queue.pop_next().await.unwrap().unwrap();
    queue.process_job(job).await;

    let job = queue.get_job(&receipt.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    let last = job.attempts.last().unwrap();
    assert!(last.error.as_deref().unwrap().contains("No handler registered"));
    assert_eq!(store.failed_ids().await.unwrap(), vec![receipt.job_id]);
}

#[tokio::test]
async fn timeout_counts_as_a_failed_attempt() {
    let (queue, _) = queue_with_memory();
    queue
        .register_handler(JobType::FileProcess, Arc::new(SlowHandler))
        .await;

    let receipt = queue
        .add_job(
            file_process("exports/slow.dcm"),
            AddJobOptions {
                priority: Some(JobPriority::new(5).unwrap()),
                retries: Some(0),
                timeout_ms: Some(50),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let job = queue.pop_next().await.unwrap().unwrap();
    queue.process_job(job).await;

    let job = queue.get_job(&receipt.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(
        job.attempts[0]
            .error
            .as_deref()
            .unwrap()
            .contains("timed out after 50ms")
    );
}

#[tokio::test]
async fn delayed_jobs_surface_only_after_promotion() {
    let (queue, _) = queue_with_memory();
    queue
        .add_job(
            file_process("exports/later.dcm"),
            AddJobOptions {
                priority: Some(JobPriority::new(5).unwrap()),
                delay_ms: 60_000,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert!(queue.pop_next().await.unwrap().is_none());

    let moved = queue
        .promote_due(Utc::now().timestamp_millis() + 120_000)
        .await
        .unwrap();
    assert_eq!(moved, 1);

    let job = queue.pop_next().await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
}

#[tokio::test]
async fn retry_all_failed_requeues_and_clears_dlq() {
    let (queue, store) = queue_with_memory();
    let receipt = queue
        .add_job(file_process("exports/a.dcm"), opts(5))
        .await
        .unwrap();
    let job = queue.pop_next().await.unwrap().unwrap();
    // No handler → straight to the DLQ.
    queue.process_job(job).await;
    assert_eq!(store.failed_ids().await.unwrap().len(), 1);

    let requeued = queue.retry_all_failed().await.unwrap();
    assert_eq!(requeued, 1);
    assert!(store.failed_ids().await.unwrap().is_empty());

    let job = queue.pop_next().await.unwrap().unwrap();
    assert_eq!(job.id, receipt.job_id);
    assert_eq!(job.retries_left, job.retries);
}

#[tokio::test]
async fn fallback_runs_jobs_synchronously_and_reports_non_durable() {
    let queue = DeviceSyncQueue::without_redis(Broadcaster::new(64), QueueConfig::default());
    let handler = Arc::new(CountingHandler {
        calls: AtomicU32::new(0),
    });
    queue
        .register_handler(JobType::FileProcess, handler.clone())
        .await;

    let receipt = queue
        .add_job(file_process("exports/a.dcm"), opts(5))
        .await
        .unwrap();
    assert_eq!(receipt.status, JobStatus::Completed);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

    let job = queue.get_job(&receipt.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    let stats = queue.get_stats().await;
    assert!(!stats.durable);
    assert_eq!(stats.processed_total, 1);

    // start_processing must be a no-op without Redis.
    queue.start_processing();
    assert!(!queue.get_stats().await.processing);
}

#[tokio::test]
async fn seen_marker_dedupes_within_ttl() {
    let (queue, _) = queue_with_memory();
    assert!(queue.try_mark_seen("dev", "exports/a.dcm", 100).await.unwrap());
    assert!(!queue.try_mark_seen("dev", "exports/a.dcm", 100).await.unwrap());
    // A different mtime is a different fingerprint.
    assert!(queue.try_mark_seen("dev", "exports/a.dcm", 101).await.unwrap());
}
