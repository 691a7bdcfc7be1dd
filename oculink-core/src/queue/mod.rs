//! Durable priority job queue.
//!
//! Redis-backed: ten priority lists (`LPUSH`/`RPOP`), a delayed sorted set
//! scored by absolute ready-time, per-job retries with exponential backoff,
//! hard timeouts, and a bounded dead-letter list. When Redis is absent the
//! queue degrades to synchronous in-process execution and reports
//! `durable: false` in its stats.

pub mod handlers;
pub mod job;
pub mod store;
pub mod worker;

#[cfg(test)]
mod tests;

pub use job::{
    AddJobOptions, BatchImportJob, FileProcessJob, FolderIndexJob, Job, JobAttempt, JobPayload,
    JobPriority, JobStatus, JobType, PatientMatchJob,
};
pub use store::{QueueKeys, QueueStore, RedisQueueStore};
pub use worker::{AddJobReceipt, DeviceSyncQueue, JobHandler, QueueConfig, QueueStats};
