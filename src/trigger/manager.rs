/// Trigger manager
///
/// Owns trigger activation state and turns external occurrences (webhooks,
/// schedule ticks, manual fires, named events) into new executions.

use crate::error::TriggerError;
use crate::funnel::{Funnel, Trigger, TriggerType, WebhookPayload};
use crate::queue::{QueueJob, TriggerJob};
use crate::runtime::context::ExecutionContext;
use crate::runtime::engine::{ExecutionEngine, ExecutionOptions};
use crate::runtime::scheduler::{enqueue_trigger, validate_cron, TriggerScheduler};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Variable key holding the raw trigger payload
pub const TRIGGER_PAYLOAD_KEY: &str = "trigger_payload";

#[derive(Debug, Clone, Serialize)]
pub struct TriggerState {
    pub trigger: Trigger,
    pub active: bool,
}

pub struct TriggerManager {
    engine: Arc<ExecutionEngine>,
    scheduler: Arc<TriggerScheduler>,
    triggers: RwLock<HashMap<String, TriggerState>>,
    /// Normalized webhook path -> trigger id
    webhook_paths: RwLock<HashMap<String, String>>,
}

impl TriggerManager {
    pub fn new(engine: Arc<ExecutionEngine>, scheduler: Arc<TriggerScheduler>) -> Self {
        Self {
            engine,
            scheduler,
            triggers: RwLock::new(HashMap::new()),
            webhook_paths: RwLock::new(HashMap::new()),
        }
    }

    /// Register every trigger of a funnel, activating those marked active
    ///
    /// Triggers of a previous snapshot of the same funnel are deactivated and
    /// replaced.
    pub async fn register_funnel_triggers(&self, funnel: &Funnel) -> Result<Vec<String>, TriggerError> {
        self.unregister_funnel_triggers(&funnel.id).await?;

        let mut activated = Vec::new();
        for trigger in &funnel.triggers {
            let mut trigger = trigger.clone();
            trigger.funnel_id = funnel.id.clone();
            let wants_active = trigger.active;
            self.register_trigger(trigger.clone()).await;
            if wants_active {
                self.activate_trigger(&trigger.id).await?;
                activated.push(trigger.id.clone());
            }
        }

        tracing::info!(
            "🎯 Registered {} triggers for funnel '{}' ({} active)",
            funnel.triggers.len(),
            funnel.id,
            activated.len()
        );
        Ok(activated)
    }

    /// Check that every trigger `register_funnel_triggers` would activate can be
    /// activated, without touching any state
    pub async fn validate_funnel_triggers(&self, funnel: &Funnel) -> Result<(), TriggerError> {
        let slots = self.webhook_paths.read().await;
        let triggers = self.triggers.read().await;
        let mut claimed = HashSet::new();

        for trigger in funnel.triggers.iter().filter(|trigger| trigger.active) {
            check_config(trigger)?;

            if trigger.trigger_type != TriggerType::Webhook {
                continue;
            }
            let Some(path) = trigger.config_str("path").map(normalize_path) else {
                continue;
            };
            let foreign_owner = slots.get(&path).filter(|owner| {
                triggers
                    .get(owner.as_str())
                    .map(|state| state.trigger.funnel_id != funnel.id)
                    .unwrap_or(false)
            });
            if foreign_owner.is_some() || !claimed.insert(path.clone()) {
                return Err(TriggerError::InvalidConfig {
                    trigger_id: trigger.id.clone(),
                    message: format!("webhook path '{}' is already bound", path),
                });
            }
        }
        Ok(())
    }

    /// Deactivate and forget every trigger of a funnel
    pub async fn unregister_funnel_triggers(&self, funnel_id: &str) -> Result<(), TriggerError> {
        let ids: Vec<String> = self
            .triggers
            .read()
            .await
            .values()
            .filter(|state| state.trigger.funnel_id == funnel_id)
            .map(|state| state.trigger.id.clone())
            .collect();

        for id in ids {
            self.deactivate_trigger(&id).await?;
            self.triggers.write().await.remove(&id);
        }
        Ok(())
    }

    /// Register a trigger in the inactive state
    pub async fn register_trigger(&self, mut trigger: Trigger) {
        trigger.active = false;
        self.triggers.write().await.insert(
            trigger.id.clone(),
            TriggerState {
                trigger,
                active: false,
            },
        );
    }

    pub async fn get_trigger(&self, trigger_id: &str) -> Option<TriggerState> {
        self.triggers.read().await.get(trigger_id).cloned()
    }

    pub async fn list_triggers(&self) -> Vec<TriggerState> {
        let mut triggers: Vec<TriggerState> = self.triggers.read().await.values().cloned().collect();
        triggers.sort_by(|a, b| a.trigger.id.cmp(&b.trigger.id));
        triggers
    }

    /// Activate a trigger: schedule it, or open its webhook slot
    pub async fn activate_trigger(&self, trigger_id: &str) -> Result<(), TriggerError> {
        let state = self
            .get_trigger(trigger_id)
            .await
            .ok_or_else(|| TriggerError::NotFound(trigger_id.to_string()))?;
        if state.active {
            return Ok(());
        }

        let trigger = &state.trigger;
        let invalid = |message: String| TriggerError::InvalidConfig {
            trigger_id: trigger.id.clone(),
            message,
        };

        match trigger.trigger_type {
            TriggerType::Schedule => {
                let expression = trigger
                    .config_str("cron")
                    .ok_or_else(|| invalid("schedule trigger requires 'cron'".to_string()))?;
                self.scheduler
                    .schedule_cron(trigger, expression)
                    .await
                    .map_err(|e| invalid(e.to_string()))?;
            }
            TriggerType::TimeBased => {
                let at = trigger
                    .config_str("at")
                    .ok_or_else(|| invalid("time-based trigger requires 'at'".to_string()))?;
                let at = DateTime::parse_from_rfc3339(at)
                    .map_err(|e| invalid(format!("invalid 'at' timestamp: {}", e)))?
                    .with_timezone(&Utc);
                self.scheduler.schedule_once(trigger, at).await?;
            }
            TriggerType::Webhook => {
                if let Some(path) = trigger.config_str("path") {
                    let path = normalize_path(path);
                    let mut slots = self.webhook_paths.write().await;
                    if let Some(owner) = slots.get(&path).filter(|owner| **owner != trigger.id) {
                        return Err(invalid(format!(
                            "webhook path '{}' is already bound to trigger {}",
                            path, owner
                        )));
                    }
                    slots.insert(path, trigger.id.clone());
                }
            }
            TriggerType::Event => {
                if trigger.config_str("event").is_none() {
                    return Err(invalid("event trigger requires 'event'".to_string()));
                }
            }
            TriggerType::Manual | TriggerType::ConditionMet | TriggerType::UserAction => {}
        }

        if let Some(state) = self.triggers.write().await.get_mut(trigger_id) {
            state.active = true;
            state.trigger.active = true;
        }
        tracing::info!(
            "✅ Activated {} trigger {} for funnel '{}'",
            trigger.trigger_type.as_str(),
            trigger.id,
            trigger.funnel_id
        );
        Ok(())
    }

    /// Deactivate a trigger; already-inactive triggers are left as they are
    pub async fn deactivate_trigger(&self, trigger_id: &str) -> Result<(), TriggerError> {
        let state = self
            .get_trigger(trigger_id)
            .await
            .ok_or_else(|| TriggerError::NotFound(trigger_id.to_string()))?;
        if !state.active {
            return Ok(());
        }

        self.scheduler.unschedule(trigger_id).await;
        self.webhook_paths
            .write()
            .await
            .retain(|_, owner| owner != trigger_id);

        if let Some(state) = self.triggers.write().await.get_mut(trigger_id) {
            state.active = false;
            state.trigger.active = false;
        }
        tracing::info!("💤 Deactivated trigger {}", trigger_id);
        Ok(())
    }

    /// Start an execution from an inbound webhook
    ///
    /// The trigger must be active and its funnel registered and active. The
    /// payload's `data` object seeds the variable bag and the whole payload is
    /// kept under `trigger_payload`.
    pub async fn handle_webhook(
        &self,
        trigger_id: &str,
        payload: WebhookPayload,
    ) -> Result<ExecutionContext, TriggerError> {
        let source = payload.source.clone().unwrap_or_else(|| "webhook".to_string());
        let variables = seed_variables(&payload)?;
        self.fire(trigger_id, variables, ExecutionOptions::from_source(source))
            .await
    }

    /// Start an execution by hand with caller-provided variables
    pub async fn fire_manual(
        &self,
        trigger_id: &str,
        variables: HashMap<String, Value>,
    ) -> Result<ExecutionContext, TriggerError> {
        self.fire(trigger_id, variables, ExecutionOptions::from_source("manual"))
            .await
    }

    /// Fire every active EVENT trigger listening for `event`
    ///
    /// Rejected triggers are skipped; infrastructure failures abort.
    pub async fn handle_event(
        &self,
        event: &str,
        payload: WebhookPayload,
    ) -> Result<Vec<ExecutionContext>, TriggerError> {
        let listeners: Vec<String> = self
            .triggers
            .read()
            .await
            .values()
            .filter(|state| state.active && state.trigger.trigger_type == TriggerType::Event)
            .filter(|state| state.trigger.config_str("event") == Some(event))
            .map(|state| state.trigger.id.clone())
            .collect();

        let mut started = Vec::with_capacity(listeners.len());
        for trigger_id in listeners {
            let mut variables = seed_variables(&payload)?;
            variables.insert("event".to_string(), Value::String(event.to_string()));
            match self
                .fire(&trigger_id, variables, ExecutionOptions::from_source("event"))
                .await
            {
                Ok(context) => started.push(context),
                Err(e) if e.is_rejection() => {
                    tracing::warn!("⚠️ Event '{}' skipped trigger {}: {}", event, trigger_id, e)
                }
                Err(e) => return Err(e),
            }
        }
        Ok(started)
    }

    /// Trigger bound to a webhook path
    pub async fn resolve_webhook_path(&self, path: &str) -> Option<String> {
        self.webhook_paths
            .read()
            .await
            .get(&normalize_path(path))
            .cloned()
    }

    /// Accept a webhook for asynchronous processing
    ///
    /// Inactive triggers and funnels are rejected up front; accepted payloads
    /// become `trigger-webhook` jobs.
    pub async fn enqueue_webhook(
        &self,
        trigger_id: &str,
        payload: WebhookPayload,
    ) -> Result<String, TriggerError> {
        let state = self.check_fireable(trigger_id).await?;
        let job_id = enqueue_trigger(self.engine.queue().as_ref(), &state.trigger.id, payload, None).await?;
        tracing::debug!("📨 Webhook for trigger {} queued as job {}", trigger_id, job_id);
        Ok(job_id)
    }

    /// Handle a dequeued `trigger-webhook` job
    ///
    /// Rejections (trigger deactivated since the job was queued) are dropped.
    pub async fn process_trigger_job(&self, job: &QueueJob) -> anyhow::Result<()> {
        let payload: TriggerJob = job.decode()?;
        match self.handle_webhook(&payload.trigger_id, payload.payload).await {
            Ok(context) => {
                tracing::debug!("📨 Trigger job {} started execution {}", job.id, context.id);
                Ok(())
            }
            Err(e) if e.is_rejection() || matches!(e, TriggerError::NotFound(_)) => {
                tracing::info!("⏭️ Dropping trigger job {}: {}", job.id, e);
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("Trigger job {} failed: {}", job.id, e)),
        }
    }

    async fn check_fireable(&self, trigger_id: &str) -> Result<TriggerState, TriggerError> {
        let state = self
            .get_trigger(trigger_id)
            .await
            .ok_or_else(|| TriggerError::NotFound(trigger_id.to_string()))?;
        if !state.active {
            return Err(TriggerError::TriggerInactive(trigger_id.to_string()));
        }
        match self.engine.funnels().get(&state.trigger.funnel_id) {
            Some(compiled) if compiled.funnel.active => Ok(state),
            _ => Err(TriggerError::FunnelInactive(state.trigger.funnel_id.clone())),
        }
    }

    async fn fire(
        &self,
        trigger_id: &str,
        variables: HashMap<String, Value>,
        options: ExecutionOptions,
    ) -> Result<ExecutionContext, TriggerError> {
        let state = self.check_fireable(trigger_id).await?;
        let compiled = self
            .engine
            .funnels()
            .get(&state.trigger.funnel_id)
            .ok_or_else(|| TriggerError::FunnelInactive(state.trigger.funnel_id.clone()))?;

        tracing::info!(
            "🔔 Trigger {} fired for funnel '{}' ({})",
            trigger_id,
            compiled.id(),
            options.source
        );
        let context = self
            .engine
            .execute_funnel_with(&compiled.funnel, trigger_id, variables, options)
            .await?;
        Ok(context)
    }
}

/// Top-level `data` fields plus the whole payload under `trigger_payload`
fn seed_variables(payload: &WebhookPayload) -> Result<HashMap<String, Value>, TriggerError> {
    let mut variables: HashMap<String, Value> = payload
        .data
        .as_object()
        .map(|data| data.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();
    let raw = serde_json::to_value(payload).map_err(anyhow::Error::from)?;
    variables.insert(TRIGGER_PAYLOAD_KEY.to_string(), raw);
    Ok(variables)
}

/// Required configuration per trigger type
fn check_config(trigger: &Trigger) -> Result<(), TriggerError> {
    let invalid = |message: String| TriggerError::InvalidConfig {
        trigger_id: trigger.id.clone(),
        message,
    };
    match trigger.trigger_type {
        TriggerType::Schedule => {
            let expression = trigger
                .config_str("cron")
                .ok_or_else(|| invalid("schedule trigger requires 'cron'".to_string()))?;
            validate_cron(expression).map_err(|e| invalid(e.to_string()))
        }
        TriggerType::TimeBased => {
            let at = trigger
                .config_str("at")
                .ok_or_else(|| invalid("time-based trigger requires 'at'".to_string()))?;
            DateTime::parse_from_rfc3339(at)
                .map(|_| ())
                .map_err(|e| invalid(format!("invalid 'at' timestamp: {}", e)))
        }
        TriggerType::Event if trigger.config_str("event").is_none() => {
            Err(invalid("event trigger requires 'event'".to_string()))
        }
        _ => Ok(()),
    }
}

fn normalize_path(path: &str) -> String {
    format!("/{}", path.trim().trim_matches('/'))
}
