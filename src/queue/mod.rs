/// Job Queue Layer
///
/// Defines the contract the engine needs from a message broker and ships an
/// in-memory broker implementing it. Delivery is at-least-once: consumers must
/// treat redelivered jobs as duplicates of work that may already be done.

// Job kinds, priorities, backoff and typed payloads
pub mod types;

// In-process broker with delays, priorities and visibility timeouts
pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

pub use memory::MemoryJobQueue;
pub use types::{
    BackoffKind, BackoffPolicy, CleanupJob, JobOptions, JobPriority, JobType, NackOutcome,
    NodeJob, QueueJob, QueueStats, TriggerJob,
};

/// Broker contract used by the engine, the trigger manager and the workers
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a job, honoring `options.delay_ms`
    async fn enqueue(&self, job: QueueJob) -> Result<String>;

    /// Enqueue a job that becomes deliverable after `delay`
    async fn enqueue_delayed(&self, job: QueueJob, delay: Duration) -> Result<String>;

    /// Reserve the next deliverable job, highest priority first
    async fn dequeue(&self) -> Result<Option<QueueJob>>;

    /// Mark a delivered job as done
    async fn ack(&self, job_id: &str) -> Result<()>;

    /// Report a failed delivery; the broker applies the job's backoff policy
    async fn nack(&self, job_id: &str, reason: &str) -> Result<NackOutcome>;

    async fn stats(&self) -> Result<QueueStats>;
}
