/// Background trigger scheduler
///
/// Registers schedule triggers with tokio-cron-scheduler and turns each tick
/// into a `trigger-webhook` job, so scheduled fires go through the same queue,
/// retry and admission path as every other trigger. One-shot (time-based)
/// triggers become delayed `trigger-webhook` jobs.

use crate::funnel::{Trigger, WebhookPayload};
use crate::queue::{JobPriority, JobQueue, JobType, QueueJob, TriggerJob};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

/// Hot-reload cron scheduler for schedule triggers
pub struct TriggerScheduler {
    scheduler: Arc<RwLock<JobScheduler>>,
    /// trigger id -> scheduler job uuid, for removal on deactivation
    job_uuid_map: Arc<RwLock<HashMap<String, Uuid>>>,
    queue: Arc<dyn JobQueue>,
}

impl TriggerScheduler {
    pub async fn new(queue: Arc<dyn JobQueue>) -> Result<Self> {
        let scheduler = JobScheduler::new().await?;

        Ok(Self {
            scheduler: Arc::new(RwLock::new(scheduler)),
            job_uuid_map: Arc::new(RwLock::new(HashMap::new())),
            queue,
        })
    }

    pub async fn start(&self) -> Result<()> {
        tracing::info!("⏰ Starting trigger scheduler");
        {
            let scheduler = self.scheduler.read().await;
            scheduler.start().await?;
        }
        tracing::info!("✅ Trigger scheduler started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        tracing::info!("⏹️ Stopping trigger scheduler");
        {
            let mut job_uuid_map = self.job_uuid_map.write().await;
            job_uuid_map.clear();
        }
        {
            let mut scheduler = self.scheduler.write().await;
            scheduler.shutdown().await?;
        }
        tracing::info!("✅ Trigger scheduler stopped");
        Ok(())
    }

    /// Add or replace the cron job of a schedule trigger
    ///
    /// Expressions use the six-field form with seconds, e.g. "0 0 9 * * Mon".
    pub async fn schedule_cron(&self, trigger: &Trigger, expression: &str) -> Result<()> {
        self.unschedule(&trigger.id).await;

        let trigger_id = trigger.id.clone();
        let funnel_id = trigger.funnel_id.clone();
        let queue = Arc::clone(&self.queue);

        let job = Job::new_async(expression, move |_uuid, _l| {
            let trigger_id = trigger_id.clone();
            let funnel_id = funnel_id.clone();
            let queue = Arc::clone(&queue);

            Box::pin(async move {
                tracing::debug!("🔔 Schedule tick for trigger {} (funnel {})", trigger_id, funnel_id);
                let payload = WebhookPayload::new("schedule.tick", json!({ "fired_at": Utc::now() }))
                    .with_source("schedule");
                if let Err(e) = enqueue_trigger(queue.as_ref(), &trigger_id, payload, None).await {
                    tracing::error!("❌ Failed to enqueue scheduled fire of {}: {}", trigger_id, e);
                }
            })
        })
        .map_err(|e| anyhow::anyhow!("Invalid cron expression '{}': {}", expression, e))?;

        let job_uuid = {
            let scheduler = self.scheduler.write().await;
            scheduler.add(job).await?
        };
        self.job_uuid_map
            .write()
            .await
            .insert(trigger.id.clone(), job_uuid);

        tracing::info!("🔥 Scheduled trigger {} ({})", trigger.id, expression);
        Ok(())
    }

    /// Enqueue a single delayed fire at `at`; times in the past fire immediately
    pub async fn schedule_once(&self, trigger: &Trigger, at: DateTime<Utc>) -> Result<String> {
        let delay = (at - Utc::now()).to_std().unwrap_or_default();
        let payload = WebhookPayload::new("schedule.at", json!({ "scheduled_for": at }))
            .with_source("schedule");
        let job_id = enqueue_trigger(self.queue.as_ref(), &trigger.id, payload, Some(delay)).await?;
        tracing::info!("⏳ Trigger {} will fire at {}", trigger.id, at.to_rfc3339());
        Ok(job_id)
    }

    /// Remove a trigger's cron job; no-op when none is registered
    pub async fn unschedule(&self, trigger_id: &str) {
        let removed = self.job_uuid_map.write().await.remove(trigger_id);
        if let Some(job_uuid) = removed {
            let scheduler = self.scheduler.read().await;
            if let Err(e) = scheduler.remove(&job_uuid).await {
                tracing::warn!("⚠️ Failed to remove cron job for trigger {}: {}", trigger_id, e);
            } else {
                tracing::debug!("🛑 Removed cron job for trigger {}", trigger_id);
            }
        }
    }

    pub async fn is_scheduled(&self, trigger_id: &str) -> bool {
        self.job_uuid_map.read().await.contains_key(trigger_id)
    }
}

/// Check a cron expression without scheduling anything
pub fn validate_cron(expression: &str) -> Result<()> {
    Job::new(expression, |_uuid, _l| {})
        .map(|_| ())
        .map_err(|e| anyhow::anyhow!("Invalid cron expression '{}': {}", expression, e))
}

/// Enqueue a `trigger-webhook` job for a trigger occurrence
pub async fn enqueue_trigger(
    queue: &dyn JobQueue,
    trigger_id: &str,
    payload: WebhookPayload,
    delay: Option<std::time::Duration>,
) -> Result<String> {
    let job = QueueJob::with_payload(
        JobType::TriggerWebhook,
        &TriggerJob {
            trigger_id: trigger_id.to_string(),
            payload,
        },
    )?
    .with_priority(JobPriority::High);

    match delay {
        Some(delay) => queue.enqueue_delayed(job, delay).await,
        None => queue.enqueue(job).await,
    }
}
