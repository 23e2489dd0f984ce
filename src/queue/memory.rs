/// In-process job broker
///
/// Reference implementation of the `JobQueue` contract used by tests and by
/// single-node deployments. Honors priorities, per-job delays, visibility
/// timeouts (an unacknowledged job is delivered again) and retry backoff.

use crate::queue::{JobQueue, JobType, NackOutcome, QueueJob, QueueStats};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;

/// Broker state guarded by a single async mutex
#[derive(Debug, Default)]
struct QueueState {
    /// Monotonic sequence for FIFO ordering within a priority
    seq: u64,
    waiting: Vec<(u64, QueueJob)>,
    in_flight: HashMap<String, InFlight>,
    /// Finished jobs kept until their retention window passes
    history: VecDeque<Finished>,
    dead_letters: Vec<QueueJob>,
    completed: u64,
}

#[derive(Debug)]
struct InFlight {
    job: QueueJob,
    deadline: DateTime<Utc>,
}

#[derive(Debug)]
struct Finished {
    job: QueueJob,
    expires_at: DateTime<Utc>,
}

impl QueueState {
    fn push(&mut self, job: QueueJob) {
        self.seq += 1;
        self.waiting.push((self.seq, job));
    }

    /// Return expired in-flight jobs to the waiting set
    fn reclaim_expired(&mut self, now: DateTime<Utc>) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for job_id in expired {
            if let Some(entry) = self.in_flight.remove(&job_id) {
                tracing::warn!("♻️ Visibility timeout expired, redelivering job {}", job_id);
                self.push(entry.job);
            }
        }
    }

    fn prune_history(&mut self, now: DateTime<Utc>) {
        self.history.retain(|entry| entry.expires_at > now);
    }

    fn finish(&mut self, job: QueueJob, now: DateTime<Utc>) {
        let retention = chrono::Duration::milliseconds(job.options.retention_ms as i64);
        self.history.push_back(Finished {
            job,
            expires_at: now + retention,
        });
    }
}

/// In-memory `JobQueue`
#[derive(Debug)]
pub struct MemoryJobQueue {
    state: Mutex<QueueState>,
    /// How long a delivered job may stay unacknowledged
    visibility_timeout: Duration,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::with_visibility_timeout(Duration::from_secs(60))
    }

    pub fn with_visibility_timeout(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            visibility_timeout,
        }
    }

    /// Jobs that exhausted their retries
    pub async fn dead_letters(&self) -> Vec<QueueJob> {
        self.state.lock().await.dead_letters.clone()
    }

    /// Find a job that is waiting, in flight or still retained after finishing
    pub async fn get_job(&self, job_id: &str) -> Option<QueueJob> {
        let mut state = self.state.lock().await;
        state.prune_history(Utc::now());

        if let Some(entry) = state.in_flight.get(job_id) {
            return Some(entry.job.clone());
        }
        state
            .waiting
            .iter()
            .map(|(_, job)| job)
            .chain(state.history.iter().map(|entry| &entry.job))
            .find(|job| job.id == job_id)
            .cloned()
    }

    /// Waiting jobs of the given type (ready or delayed)
    pub async fn pending_of_type(&self, job_type: JobType) -> Vec<QueueJob> {
        self.state
            .lock()
            .await
            .waiting
            .iter()
            .filter(|(_, job)| job.job_type == job_type)
            .map(|(_, job)| job.clone())
            .collect()
    }
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: QueueJob) -> Result<String> {
        let delay = Duration::from_millis(job.options.delay_ms);
        self.enqueue_delayed(job, delay).await
    }

    async fn enqueue_delayed(&self, mut job: QueueJob, delay: Duration) -> Result<String> {
        let delay = chrono::Duration::from_std(delay)
            .map_err(|e| anyhow::anyhow!("Delay out of range for job {}: {}", job.id, e))?;
        job.available_at = Utc::now() + delay;

        let job_id = job.id.clone();
        tracing::debug!(
            "📥 Enqueued {:?} job {} (priority {:?}, available {})",
            job.job_type,
            job_id,
            job.priority,
            job.available_at.to_rfc3339()
        );
        self.state.lock().await.push(job);
        Ok(job_id)
    }

    async fn dequeue(&self) -> Result<Option<QueueJob>> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        state.reclaim_expired(now);

        let best = state
            .waiting
            .iter()
            .enumerate()
            .filter(|(_, (_, job))| job.available_at <= now)
            .max_by(|(_, (seq_a, a)), (_, (seq_b, b))| {
                a.priority.cmp(&b.priority).then(seq_b.cmp(seq_a))
            })
            .map(|(index, _)| index);

        let Some(index) = best else {
            return Ok(None);
        };

        let (_, job) = state.waiting.swap_remove(index);
        let visibility = chrono::Duration::from_std(self.visibility_timeout)
            .map_err(|e| anyhow::anyhow!("Visibility timeout out of range: {}", e))?;
        state.in_flight.insert(
            job.id.clone(),
            InFlight {
                job: job.clone(),
                deadline: now + visibility,
            },
        );
        Ok(Some(job))
    }

    async fn ack(&self, job_id: &str) -> Result<()> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let entry = state
            .in_flight
            .remove(job_id)
            .ok_or_else(|| anyhow::anyhow!("Cannot ack unknown or expired job: {}", job_id))?;

        state.completed += 1;
        state.finish(entry.job, now);
        state.prune_history(now);
        Ok(())
    }

    async fn nack(&self, job_id: &str, reason: &str) -> Result<NackOutcome> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let mut job = state
            .in_flight
            .remove(job_id)
            .ok_or_else(|| anyhow::anyhow!("Cannot nack unknown or expired job: {}", job_id))?
            .job;

        job.last_error = Some(reason.to_string());

        if !job.can_retry() {
            tracing::warn!(
                "☠️ Job {} exhausted {} retries, dead-lettering: {}",
                job_id,
                job.options.max_retries,
                reason
            );
            state.dead_letters.push(job);
            return Ok(NackOutcome::DeadLettered);
        }

        job.retry_count += 1;
        let delay = job.options.backoff.delay_for(job.retry_count);
        let retry_count = job.retry_count;
        if job.job_type == JobType::ExecuteNode {
            job.job_type = JobType::RetryFailed;
        }
        job.available_at = now
            + chrono::Duration::from_std(delay)
                .map_err(|e| anyhow::anyhow!("Backoff delay out of range: {}", e))?;

        tracing::info!(
            "🔁 Job {} scheduled for retry {}/{} in {:?}",
            job_id,
            retry_count,
            job.options.max_retries,
            delay
        );
        state.push(job);
        Ok(NackOutcome::Retrying { retry_count, delay })
    }

    async fn stats(&self) -> Result<QueueStats> {
        let now = Utc::now();
        let state = self.state.lock().await;
        let ready = state
            .waiting
            .iter()
            .filter(|(_, job)| job.available_at <= now)
            .count();

        Ok(QueueStats {
            ready,
            delayed: state.waiting.len() - ready,
            in_flight: state.in_flight.len(),
            completed: state.completed,
            dead_lettered: state.dead_letters.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{BackoffPolicy, JobOptions, JobPriority};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn job(priority: JobPriority, tag: &str) -> QueueJob {
        QueueJob::new(JobType::ExecuteNode, json!({ "tag": tag })).with_priority(priority)
    }

    #[tokio::test]
    async fn test_dequeue_orders_by_priority_then_fifo() {
        let queue = MemoryJobQueue::new();
        queue.enqueue(job(JobPriority::Low, "low")).await.unwrap();
        queue.enqueue(job(JobPriority::Normal, "normal-1")).await.unwrap();
        queue.enqueue(job(JobPriority::Urgent, "urgent")).await.unwrap();
        queue.enqueue(job(JobPriority::Normal, "normal-2")).await.unwrap();

        let mut actual = Vec::new();
        while let Some(job) = queue.dequeue().await.unwrap() {
            actual.push(job.payload["tag"].as_str().unwrap().to_string());
            queue.ack(&job.id).await.unwrap();
        }

        assert_eq!(actual, vec!["urgent", "normal-1", "normal-2", "low"]);
    }

    #[tokio::test]
    async fn test_delayed_job_is_invisible_until_due() {
        let queue = MemoryJobQueue::new();
        queue
            .enqueue_delayed(job(JobPriority::Normal, "later"), Duration::from_millis(80))
            .await
            .unwrap();

        assert!(queue.dequeue().await.unwrap().is_none());
        assert_eq!(queue.stats().await.unwrap().delayed, 1);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(queue.dequeue().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_nack_retries_then_dead_letters() {
        let queue = MemoryJobQueue::new();
        let fixture = job(JobPriority::Normal, "flaky").with_options(JobOptions {
            max_retries: 1,
            backoff: BackoffPolicy::fixed(0),
            ..JobOptions::default()
        });
        queue.enqueue(fixture).await.unwrap();

        let first = queue.dequeue().await.unwrap().unwrap();
        let outcome = queue.nack(&first.id, "timeout").await.unwrap();
        assert_eq!(
            outcome,
            NackOutcome::Retrying {
                retry_count: 1,
                delay: Duration::from_millis(0)
            }
        );

        let second = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(second.job_type, JobType::RetryFailed);
        assert_eq!(second.retry_count, 1);
        assert_eq!(second.last_error.as_deref(), Some("timeout"));

        let outcome = queue.nack(&second.id, "timeout again").await.unwrap();
        assert_eq!(outcome, NackOutcome::DeadLettered);
        assert_eq!(queue.dead_letters().await.len(), 1);
        assert!(queue.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unacked_job_is_redelivered_after_visibility_timeout() {
        let queue = MemoryJobQueue::with_visibility_timeout(Duration::from_millis(50));
        queue.enqueue(job(JobPriority::Normal, "crash")).await.unwrap();

        let first = queue.dequeue().await.unwrap().unwrap();
        assert!(queue.dequeue().await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(80)).await;
        let again = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(again.id, first.id);
    }

    #[tokio::test]
    async fn test_finished_jobs_are_retained() {
        let queue = MemoryJobQueue::new();
        let id = queue.enqueue(job(JobPriority::Normal, "done")).await.unwrap();
        let delivered = queue.dequeue().await.unwrap().unwrap();
        queue.ack(&delivered.id).await.unwrap();

        assert!(queue.get_job(&id).await.is_some());
        assert_eq!(queue.stats().await.unwrap().completed, 1);
        assert!(queue.ack(&id).await.is_err());
    }
}
