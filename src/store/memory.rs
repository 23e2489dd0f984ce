/// In-memory execution store

use crate::runtime::context::{ExecutionContext, ExecutionStatus};
use crate::store::ExecutionStore;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

#[derive(Debug, Clone)]
struct Lease {
    owner: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct MemoryExecutionStore {
    contexts: RwLock<HashMap<String, ExecutionContext>>,
    leases: Mutex<HashMap<String, Lease>>,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn holds(leases: &HashMap<String, Lease>, execution_id: &str, owner: &str) -> bool {
    leases
        .get(execution_id)
        .map(|lease| lease.owner == owner)
        .unwrap_or(false)
}

fn count_active(contexts: &HashMap<String, ExecutionContext>, funnel_id: Option<&str>) -> usize {
    contexts
        .values()
        .filter(|context| context.status.is_active())
        .filter(|context| funnel_id.map(|id| context.funnel_id == id).unwrap_or(true))
        .count()
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn insert(&self, context: &ExecutionContext) -> Result<()> {
        let mut contexts = self.contexts.write().await;
        if contexts.contains_key(&context.id) {
            return Err(anyhow::anyhow!("Execution already exists: {}", context.id));
        }
        contexts.insert(context.id.clone(), context.clone());
        Ok(())
    }

    async fn save(&self, context: &ExecutionContext, lease_owner: &str) -> Result<bool> {
        let leases = self.leases.lock().await;
        if !holds(&leases, &context.id, lease_owner) {
            return Ok(false);
        }
        let mut contexts = self.contexts.write().await;
        match contexts.get_mut(&context.id) {
            Some(stored) if !stored.status.is_terminal() => {
                *stored = context.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update(
        &self,
        execution_id: &str,
        apply: &(dyn for<'c> Fn(&'c mut ExecutionContext) -> bool + Send + Sync),
    ) -> Result<Option<ExecutionContext>> {
        let mut contexts = self.contexts.write().await;
        let Some(stored) = contexts.get_mut(execution_id) else {
            return Ok(None);
        };
        if stored.status.is_terminal() {
            return Ok(None);
        }
        let mut next = stored.clone();
        if !apply(&mut next) {
            return Ok(None);
        }
        *stored = next.clone();
        Ok(Some(next))
    }

    async fn try_admit(
        &self,
        context: &ExecutionContext,
        lease_owner: &str,
        funnel_limit: Option<usize>,
        global_limit: usize,
    ) -> Result<bool> {
        let leases = self.leases.lock().await;
        if !holds(&leases, &context.id, lease_owner) {
            return Ok(false);
        }
        let mut contexts = self.contexts.write().await;
        let funnel_full = funnel_limit
            .map(|limit| count_active(&contexts, Some(&context.funnel_id)) >= limit)
            .unwrap_or(false);
        if funnel_full || count_active(&contexts, None) >= global_limit {
            return Ok(false);
        }
        match contexts.get_mut(&context.id) {
            Some(stored) if stored.status == ExecutionStatus::Pending => {
                *stored = context.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, execution_id: &str) -> Result<Option<ExecutionContext>> {
        Ok(self.contexts.read().await.get(execution_id).cloned())
    }

    async fn list_active(&self) -> Result<Vec<ExecutionContext>> {
        let mut active: Vec<ExecutionContext> = self
            .contexts
            .read()
            .await
            .values()
            .filter(|context| !context.status.is_terminal())
            .cloned()
            .collect();
        active.sort_by_key(|context| context.start_time);
        Ok(active)
    }

    async fn count_active(&self, funnel_id: Option<&str>) -> Result<usize> {
        Ok(count_active(&*self.contexts.read().await, funnel_id))
    }

    async fn delete(&self, execution_id: &str) -> Result<bool> {
        self.leases.lock().await.remove(execution_id);
        Ok(self.contexts.write().await.remove(execution_id).is_some())
    }

    async fn try_acquire_lease(&self, execution_id: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| anyhow::anyhow!("Lease TTL out of range: {}", e))?;
        let mut leases = self.leases.lock().await;

        if let Some(lease) = leases.get(execution_id) {
            if lease.owner != owner && lease.expires_at > now {
                return Ok(false);
            }
        }
        leases.insert(
            execution_id.to_string(),
            Lease {
                owner: owner.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn release_lease(&self, execution_id: &str, owner: &str) -> Result<()> {
        let mut leases = self.leases.lock().await;
        if holds(&leases, execution_id, owner) {
            leases.remove(execution_id);
        }
        Ok(())
    }
}
