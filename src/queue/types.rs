/// Queue job types
///
/// Work items exchanged between the engine, the trigger manager and the
/// broker: job kinds, priorities, retry/backoff policy and the typed payloads
/// carried inside the opaque `payload` field.

use crate::funnel::WebhookPayload;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Kind of work a job represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    /// Run one node of an execution
    ExecuteNode,
    /// Resume an execution suspended at a DELAY/WAIT node
    ProcessDelay,
    /// Redelivery of a node job after a retryable failure
    RetryFailed,
    /// Start an execution from a trigger occurrence
    TriggerWebhook,
    /// Remove a finished execution after its retention window
    Cleanup,
}

/// Scheduling priority; only affects ordering under contention
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Urgent = 3,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Fixed,
    #[default]
    Exponential,
}

/// Delay policy between retries of the same job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub kind: BackoffKind,
    /// Base delay in milliseconds
    pub delay_ms: u64,
    /// Upper bound for exponential growth
    pub max_delay_ms: u64,
}

impl BackoffPolicy {
    pub fn fixed(delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            delay_ms,
            max_delay_ms: delay_ms,
        }
    }

    pub fn exponential(delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay_ms,
            max_delay_ms,
        }
    }

    /// Delay before the given retry (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let millis = match self.kind {
            BackoffKind::Fixed => self.delay_ms,
            BackoffKind::Exponential => {
                let exponent = retry.saturating_sub(1).min(32);
                self.delay_ms
                    .saturating_mul(1u64 << exponent)
                    .min(self.max_delay_ms.max(self.delay_ms))
            }
        };
        Duration::from_millis(millis)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::exponential(1000, 5 * 60 * 1000)
    }
}

/// Per-job delivery options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Initial delay before the job becomes available
    pub delay_ms: u64,
    /// Retries allowed after the first attempt
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
    /// How long the broker keeps the record of a finished job
    pub retention_ms: u64,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            delay_ms: 0,
            max_retries: 0,
            backoff: BackoffPolicy::default(),
            retention_ms: 60 * 60 * 1000,
        }
    }
}

/// A unit of work held by the broker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueJob {
    pub id: String,
    pub job_type: JobType,
    pub priority: JobPriority,
    /// Typed payload serialized as JSON; see `NodeJob`, `TriggerJob`, `CleanupJob`
    pub payload: Value,
    pub options: JobOptions,
    /// Retries performed so far
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    /// Earliest time the job may be delivered
    pub available_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl QueueJob {
    pub fn new(job_type: JobType, payload: Value) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_type,
            priority: JobPriority::default(),
            payload,
            options: JobOptions::default(),
            retry_count: 0,
            created_at: now,
            available_at: now,
            last_error: None,
        }
    }

    /// Build a job from a serializable payload
    pub fn with_payload<T: Serialize>(job_type: JobType, payload: &T) -> Result<Self> {
        Ok(Self::new(job_type, serde_json::to_value(payload)?))
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    /// Decode the typed payload
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            anyhow::anyhow!("Invalid payload for {:?} job {}: {}", self.job_type, self.id, e)
        })
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.options.max_retries
    }

    /// Attempt number of the current delivery (1-based)
    pub fn attempt(&self) -> u32 {
        self.retry_count + 1
    }
}

/// Result of negatively acknowledging a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NackOutcome {
    /// The job was rescheduled as a `retry-failed` delivery
    Retrying { retry_count: u32, delay: Duration },
    /// Retries are exhausted; the job moved to the dead-letter list
    DeadLettered,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Jobs deliverable now
    pub ready: usize,
    /// Jobs waiting for their delay to elapse
    pub delayed: usize,
    /// Delivered but not yet acknowledged
    pub in_flight: usize,
    pub completed: u64,
    pub dead_lettered: usize,
}

/// Payload of `execute-node`, `retry-failed` and `process-delay` jobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeJob {
    pub execution_id: String,
    pub node_id: String,
    /// Node the path arrived from; merge joins count arrivals by it
    #[serde(default)]
    pub from_node_id: Option<String>,
    /// Per-execution dispatch sequence number, the de-duplication key
    pub step: u64,
}

/// Payload of `trigger-webhook` jobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerJob {
    pub trigger_id: String,
    pub payload: WebhookPayload,
}

/// Payload of `cleanup` jobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupJob {
    pub execution_id: String,
}
