//! Queue persistence.
//!
//! Redis is the single source of truth for job state; the trait exists so
//! the worker logic can be exercised against an in-memory double in tests.

use crate::error::Result;
use crate::queue::job::{Job, JobPriority};
use async_trait::async_trait;
use redis::{AsyncCommands, aio::ConnectionManager};
use tracing::info;

/// Key layout under the `device_sync:` prefix.
pub struct QueueKeys;

impl QueueKeys {
    pub fn job(id: &str) -> String {
        format!("device_sync:job:{id}")
    }

    pub fn queue(priority: JobPriority) -> String {
        format!("device_sync:queue:{priority}")
    }

    pub const DELAYED: &'static str = "device_sync:delayed";
    pub const FAILED: &'static str = "device_sync:failed";
    pub fn seen(device: &str, path: &str, mtime: i64) -> String {
        format!("device_sync:seen:{device}:{path}:{mtime}")
    }
}

/// Job documents expire after a day.
pub const JOB_TTL_SECS: u64 = 24 * 60 * 60;
/// Dead-letter list cap.
pub const FAILED_CAP: isize = 1000;

/// Operations the worker and scheduler need from the backing store.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn save_job(&self, job: &Job) -> Result<()>;
    async fn load_job(&self, id: &str) -> Result<Option<Job>>;
    /// LPUSH onto the job's priority list (FIFO with `pop_ready`).
    async fn push_ready(&self, job: &Job) -> Result<()>;
    /// RPOP from one priority list.
    async fn pop_ready(&self, priority: JobPriority) -> Result<Option<String>>;
    /// Insert into the delayed set at an absolute ready-time (epoch ms).
    async fn schedule_delayed(&self, id: &str, ready_at_ms: i64) -> Result<()>;
    /// Ids whose ready-time has passed.
    async fn due_delayed(&self, now_ms: i64) -> Result<Vec<String>>;
    async fn remove_delayed(&self, id: &str) -> Result<()>;
    /// LPUSH onto the dead-letter list, trimmed to [`FAILED_CAP`].
    async fn push_failed(&self, id: &str) -> Result<()>;
    async fn failed_ids(&self) -> Result<Vec<String>>;
    /// Delete the dead-letter list, returning how many ids it held.
    async fn clear_failed(&self) -> Result<u64>;
    async fn queue_depth(&self, priority: JobPriority) -> Result<u64>;
    async fn delayed_count(&self) -> Result<u64>;
    /// Short-TTL dedup marker for scanned files; true when freshly set.
    async fn mark_seen(&self, key: &str, ttl_secs: u64) -> Result<bool>;
}

/// Production store on Redis.
#[derive(Clone)]
pub struct RedisQueueStore {
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisQueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisQueueStore")
            .field("connection", &"ConnectionManager")
            .finish()
    }
}

impl RedisQueueStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        info!("Connecting to Redis job queue at {}", redis_url);
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Successfully connected to Redis job queue");
        Ok(Self { conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    async fn save_job(&self, job: &Job) -> Result<()> {
        let json = serde_json::to_string(job)?;
        let _: () = self
            .conn()
            .set_ex(QueueKeys::job(&job.id), json, JOB_TTL_SECS)
            .await?;
        Ok(())
    }

    async fn load_job(&self, id: &str) -> Result<Option<Job>> {
        let json: Option<String> = self.conn().get(QueueKeys::job(id)).await?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn push_ready(&self, job: &Job) -> Result<()> {
        let _: () = self
            .conn()
            .lpush(QueueKeys::queue(job.priority), &job.id)
            .await?;
        Ok(())
    }

    async fn pop_ready(&self, priority: JobPriority) -> Result<Option<String>> {
        let id: Option<String> = self.conn().rpop(QueueKeys::queue(priority), None).await?;
        Ok(id)
    }

    async fn schedule_delayed(&self, id: &str, ready_at_ms: i64) -> Result<()> {
        let _: () = self
            .conn()
            .zadd(QueueKeys::DELAYED, id, ready_at_ms)
            .await?;
        Ok(())
    }

    async fn due_delayed(&self, now_ms: i64) -> Result<Vec<String>> {
        let ids: Vec<String> = self
            .conn()
            .zrangebyscore(QueueKeys::DELAYED, 0i64, now_ms)
            .await?;
        Ok(ids)
    }

    async fn remove_delayed(&self, id: &str) -> Result<()> {
        let _: () = self.conn().zrem(QueueKeys::DELAYED, id).await?;
        Ok(())
    }

    async fn push_failed(&self, id: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn.lpush(QueueKeys::FAILED, id).await?;
        let _: () = conn.ltrim(QueueKeys::FAILED, 0, FAILED_CAP - 1).await?;
        Ok(())
    }

    async fn failed_ids(&self) -> Result<Vec<String>> {
        let ids: Vec<String> = self.conn().lrange(QueueKeys::FAILED, 0, -1).await?;
        Ok(ids)
    }

    async fn clear_failed(&self) -> Result<u64> {
        let mut conn = self.conn();
        let count: u64 = conn.llen(QueueKeys::FAILED).await?;
        let _: () = conn.del(QueueKeys::FAILED).await?;
        Ok(count)
    }

    async fn queue_depth(&self, priority: JobPriority) -> Result<u64> {
        let depth: u64 = self.conn().llen(QueueKeys::queue(priority)).await?;
        Ok(depth)
    }

    async fn delayed_count(&self) -> Result<u64> {
        let count: u64 = self.conn().zcard(QueueKeys::DELAYED).await?;
        Ok(count)
    }

    async fn mark_seen(&self, key: &str, ttl_secs: u64) -> Result<bool> {
        // SET NX EX — true when we planted the marker, false when present.
        let set: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut self.conn())
            .await?;
        Ok(set.is_some())
    }
}
