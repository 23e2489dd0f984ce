/// Queue-driven funnel execution engine
///
/// Every node of every execution runs as its own queued job. Processing a job
/// loads the execution context, runs one node, records the outcome, and
/// enqueues follow-up jobs for the routed targets. Suspension (delays, retry
/// backoff, merge joins) is just "save and return": nothing holds a worker
/// while an execution waits.

use crate::config::EngineConfig;
use crate::error::{EngineError, NodeError};
use crate::funnel::{CompiledFunnel, Funnel, FunnelNode, FunnelRegistry, FunnelSettings, NodeType};
use crate::metrics::EngineMetrics;
use crate::queue::{
    BackoffPolicy, CleanupJob, JobOptions, JobPriority, JobQueue, JobType, NodeJob, QueueJob,
};
use crate::runtime::condition::ConditionEvaluator;
use crate::runtime::context::{
    ErrorKind, ExecutionContext, ExecutionError, ExecutionMetadata, ExecutionStatus, LogEvent,
    LogLevel,
};
use crate::runtime::executor::{ActionError, ActionResult, NodeExecutor};
use crate::store::ExecutionStore;
use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Longest backoff between two retries of the same node job
const MAX_RETRY_DELAY_MS: u64 = 5 * 60 * 1000;

/// Caller-supplied metadata for a new execution
#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    /// e.g. "webhook", "schedule", "manual", "api"
    pub source: String,
    pub priority: JobPriority,
    /// Set when the execution is a sub-flow of another execution
    pub parent_execution_id: Option<String>,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            source: "api".to_string(),
            priority: JobPriority::Normal,
            parent_execution_id: None,
        }
    }
}

impl ExecutionOptions {
    pub fn from_source(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Self::default()
        }
    }
}

/// What the worker should do with the job it delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Acknowledge
    Done,
    /// Negatively acknowledge; the queue applies the job's backoff
    Retry { reason: String },
    /// Acknowledge and enqueue an identical job after `delay`
    Requeue { delay: Duration },
}

/// Funnel execution engine
pub struct ExecutionEngine {
    funnels: Arc<FunnelRegistry>,
    store: Arc<dyn ExecutionStore>,
    queue: Arc<dyn JobQueue>,
    metrics: Arc<dyn EngineMetrics>,
    config: EngineConfig,
}

impl ExecutionEngine {
    pub fn new(
        funnels: Arc<FunnelRegistry>,
        store: Arc<dyn ExecutionStore>,
        queue: Arc<dyn JobQueue>,
        metrics: Arc<dyn EngineMetrics>,
        config: EngineConfig,
    ) -> Self {
        Self {
            funnels,
            store,
            queue,
            metrics,
            config,
        }
    }

    pub fn funnels(&self) -> &Arc<FunnelRegistry> {
        &self.funnels
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start an execution of `funnel` for `trigger_id`
    pub async fn execute_funnel(
        &self,
        funnel: &Funnel,
        trigger_id: &str,
        variables: HashMap<String, Value>,
    ) -> Result<ExecutionContext, EngineError> {
        self.execute_funnel_with(funnel, trigger_id, variables, ExecutionOptions::default())
            .await
    }

    /// Start an execution with explicit source, priority and parent
    ///
    /// The context is stored PENDING and the first node job is enqueued; the
    /// returned snapshot reflects that state.
    pub async fn execute_funnel_with(
        &self,
        funnel: &Funnel,
        trigger_id: &str,
        variables: HashMap<String, Value>,
        options: ExecutionOptions,
    ) -> Result<ExecutionContext, EngineError> {
        let compiled = match self.funnels.snapshot(&funnel.id, funnel.version) {
            Some(compiled) => compiled,
            None => self.funnels.install_unchecked(funnel.clone()),
        };

        let entry = compiled
            .entry_node(trigger_id)
            .or_else(|| compiled.funnel.nodes.first().map(|node| node.id.as_str()))
            .map(str::to_string)
            .ok_or_else(|| EngineError::NoEntryNode {
                funnel_id: funnel.id.clone(),
                trigger_id: trigger_id.to_string(),
            })?;

        let metadata = ExecutionMetadata {
            source: options.source.clone(),
            priority: options.priority,
            parent_execution_id: options.parent_execution_id.clone(),
            child_execution_ids: Vec::new(),
        };
        let mut context = ExecutionContext::new(&compiled.funnel, trigger_id, variables, metadata);
        context.log(
            LogLevel::Info,
            LogEvent::Lifecycle,
            None,
            format!(
                "Execution created for funnel {} v{} by trigger {} ({})",
                funnel.id, compiled.version(), trigger_id, options.source
            ),
        );
        check_variable_types(&compiled.funnel, &mut context);

        context.traversal.open_paths = 1;
        let step = context.allocate_step();
        let job = self
            .node_job(
                &compiled.funnel.settings,
                JobType::ExecuteNode,
                context.metadata.priority,
                &NodeJob {
                    execution_id: context.id.clone(),
                    node_id: entry.clone(),
                    from_node_id: None,
                    step,
                },
            )
            .map_err(EngineError::Queue)?;

        self.store.insert(&context).await.map_err(EngineError::Store)?;
        if let Some(parent_id) = &options.parent_execution_id {
            self.link_child(parent_id, &context.id).await;
        }
        self.queue.enqueue(job).await.map_err(EngineError::Queue)?;
        self.metrics.execution_started(&funnel.id);

        tracing::info!(
            "🚀 Execution {} created for funnel '{}' (entry '{}', trigger '{}')",
            context.id,
            funnel.id,
            entry,
            trigger_id
        );
        Ok(context)
    }

    pub async fn get_execution_context(
        &self,
        execution_id: &str,
    ) -> Result<Option<ExecutionContext>, EngineError> {
        self.store.get(execution_id).await.map_err(EngineError::Store)
    }

    /// Cancel an execution; false when it is unknown or already terminal
    ///
    /// In-flight node work is allowed to finish, but nothing is dispatched
    /// afterwards and queued jobs no-op on delivery.
    pub async fn cancel_execution(&self, execution_id: &str) -> Result<bool, EngineError> {
        let cancelled = self
            .store
            .update(execution_id, &|context| {
                context.log(LogLevel::Info, LogEvent::Lifecycle, None, "Execution cancelled by request");
                terminate(context, ExecutionStatus::Cancelled)
            })
            .await
            .map_err(EngineError::Store)?;

        match cancelled {
            Some(context) => {
                self.finished(&context).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Every execution that has not reached a terminal state
    pub async fn get_active_executions(&self) -> Result<Vec<ExecutionContext>, EngineError> {
        self.store.list_active().await.map_err(EngineError::Store)
    }

    /// Process one delivered job
    ///
    /// `trigger-webhook` jobs belong to the trigger manager and are rejected here.
    pub async fn process_job(&self, job: &QueueJob, worker_id: &str) -> Result<JobOutcome> {
        match job.job_type {
            JobType::ExecuteNode | JobType::RetryFailed | JobType::ProcessDelay => {
                let payload: NodeJob = job.decode()?;
                self.process_node_job(job, &payload, worker_id).await
            }
            JobType::Cleanup => {
                let payload: CleanupJob = job.decode()?;
                self.cleanup(&payload.execution_id).await?;
                Ok(JobOutcome::Done)
            }
            JobType::TriggerWebhook => Err(anyhow::anyhow!(
                "Job {} is a trigger job and must be routed to the trigger manager",
                job.id
            )),
        }
    }

    /// Turn a dead-lettered node job into a terminal failure
    pub async fn handle_retries_exhausted(&self, job: &QueueJob, reason: &str) -> Result<()> {
        if !matches!(
            job.job_type,
            JobType::ExecuteNode | JobType::RetryFailed | JobType::ProcessDelay
        ) {
            tracing::warn!("☠️ Dropping dead-lettered {:?} job {}: {}", job.job_type, job.id, reason);
            return Ok(());
        }

        let payload: NodeJob = job.decode()?;
        let attempt = job.attempt();
        let failed = self
            .store
            .update(&payload.execution_id, &|context| {
                let mut error = ExecutionError::new(
                    ErrorKind::RetryExhausted,
                    Some(&payload.node_id),
                    format!(
                        "Node '{}' failed after {} attempts: {}",
                        payload.node_id, attempt, reason
                    ),
                )
                .at_attempt(attempt);
                error.is_retryable = false;
                context.record_error(error);
                context.log(
                    LogLevel::Error,
                    LogEvent::NodeFailed,
                    Some(&payload.node_id),
                    format!("Retries exhausted: {}", reason),
                );
                terminate(context, ExecutionStatus::Failed)
            })
            .await?;

        if let Some(context) = failed {
            tracing::error!(
                "💀 Execution {} failed: node '{}' exhausted its retries",
                context.id,
                payload.node_id
            );
            self.finished(&context).await;
        }
        Ok(())
    }

    /// Remove a terminal execution; active executions are kept
    pub async fn cleanup(&self, execution_id: &str) -> Result<bool> {
        match self.store.get(execution_id).await? {
            Some(context) if context.status.is_terminal() => {
                let deleted = self.store.delete(execution_id).await?;
                tracing::debug!("🧹 Cleaned up execution {}", execution_id);
                Ok(deleted)
            }
            Some(_) => {
                tracing::warn!("🧹 Skipping cleanup of active execution {}", execution_id);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn process_node_job(&self, job: &QueueJob, payload: &NodeJob, worker_id: &str) -> Result<JobOutcome> {
        let leased = self
            .store
            .try_acquire_lease(&payload.execution_id, worker_id, self.config.lease_ttl())
            .await?;
        if !leased {
            tracing::debug!(
                "🔒 Execution {} is leased elsewhere, requeueing job {}",
                payload.execution_id,
                job.id
            );
            return Ok(JobOutcome::Requeue {
                delay: self.config.lease_busy_delay(),
            });
        }

        let heartbeat = self.spawn_heartbeat(&payload.execution_id, worker_id);
        let outcome = self
            .step(&Delivery {
                job,
                payload,
                owner: worker_id,
            })
            .await;
        heartbeat.abort();
        let _ = heartbeat.await;

        if let Err(e) = self.store.release_lease(&payload.execution_id, worker_id).await {
            tracing::warn!("⚠️ Failed to release lease on {}: {}", payload.execution_id, e);
        }
        outcome
    }

    /// Renew `owner`'s lease until the returned task is aborted
    fn spawn_heartbeat(&self, execution_id: &str, owner: &str) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let ttl = self.config.lease_ttl();
        let execution_id = execution_id.to_string();
        let owner = owner.to_string();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval((ttl / 3).max(Duration::from_millis(1)));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.try_acquire_lease(&execution_id, &owner, ttl).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!("💔 {} lost its lease on execution {}", owner, execution_id);
                        break;
                    }
                    Err(e) => tracing::warn!("⚠️ Lease renewal on {} failed: {}", execution_id, e),
                }
            }
        })
    }

    /// Run one node job against the execution it belongs to
    async fn step(&self, delivery: &Delivery<'_>) -> Result<JobOutcome> {
        let Delivery { job, payload, owner } = *delivery;
        let Some(mut context) = self.store.get(&payload.execution_id).await? else {
            tracing::debug!("👻 Execution {} no longer exists, dropping job {}", payload.execution_id, job.id);
            return Ok(JobOutcome::Done);
        };
        if context.status.is_terminal() {
            tracing::debug!(
                "⏹️ Execution {} is {}, job {} is a no-op",
                context.id,
                context.status.as_str(),
                job.id
            );
            return Ok(JobOutcome::Done);
        }
        if context.traversal.completed_steps.contains(&payload.step) {
            tracing::debug!("🔂 Duplicate delivery of step {} for {}", payload.step, context.id);
            return Ok(JobOutcome::Done);
        }

        let compiled = self
            .funnels
            .snapshot(&context.funnel_id, context.funnel_version)
            .or_else(|| self.funnels.get(&context.funnel_id));
        let Some(compiled) = compiled else {
            let error = ExecutionError::structural(
                None,
                format!("Funnel {} is not registered", context.funnel_id),
            );
            return self.fail(&mut context, error, owner).await;
        };
        let settings = &compiled.funnel.settings;

        if context.is_timed_out(settings.max_execution_time_ms, Utc::now()) {
            context.log(
                LogLevel::Warn,
                LogEvent::Lifecycle,
                context.current_node_id.clone().as_deref(),
                format!("Execution exceeded {} ms", settings.max_execution_time_ms),
            );
            tracing::warn!("⏰ Execution {} timed out", context.id);
            return self.finish(&mut context, ExecutionStatus::Timeout, owner).await;
        }

        if context.status == ExecutionStatus::Pending {
            context.transition(ExecutionStatus::Running);
            context.log(LogLevel::Info, LogEvent::Lifecycle, None, "Execution started");
            let admitted = self
                .store
                .try_admit(
                    &context,
                    owner,
                    settings.concurrency_limit(),
                    self.config.max_concurrent_executions,
                )
                .await?;
            if !admitted {
                tracing::debug!(
                    "🚦 Concurrency limit reached, execution {} stays queued",
                    context.id
                );
                return Ok(JobOutcome::Requeue {
                    delay: self.config.admission_delay(),
                });
            }
        }

        let Some(node) = compiled.node(&payload.node_id) else {
            let error = ExecutionError::structural(
                Some(&payload.node_id),
                format!("Node '{}' does not exist in funnel {}", payload.node_id, compiled.id()),
            );
            return self.fail(&mut context, error, owner).await;
        };

        if job.job_type == JobType::ProcessDelay {
            context.traversal.suspended_paths = context.traversal.suspended_paths.saturating_sub(1);
            context.log(
                LogLevel::Info,
                LogEvent::Resumed,
                Some(&node.id),
                "Delay elapsed, resuming",
            );
            tracing::info!("⏯️ Execution {} resumed after delay at '{}'", context.id, node.id);
            return self
                .route(&mut context, &compiled, node, delivery, ActionResult::proceed())
                .await;
        }

        // Entry points route onward without counting as a visit
        if node.node_type == NodeType::Trigger {
            return self
                .route(&mut context, &compiled, node, delivery, ActionResult::proceed())
                .await;
        }

        if node.node_type == NodeType::Merge && !merge_ready(&mut context, &compiled, node, payload) {
            return self.absorb_path(&mut context, delivery).await;
        }

        self.run_node(&mut context, &compiled, node, delivery).await
    }

    /// Close a path that was absorbed by a merge join
    async fn absorb_path(&self, context: &mut ExecutionContext, delivery: &Delivery<'_>) -> Result<JobOutcome> {
        context.traversal.completed_steps.insert(delivery.payload.step);
        self.close_path(context, delivery.owner).await
    }

    async fn run_node(
        &self,
        context: &mut ExecutionContext,
        compiled: &CompiledFunnel,
        node: &FunnelNode,
        delivery: &Delivery<'_>,
    ) -> Result<JobOutcome> {
        let attempt = delivery.job.attempt();
        context.current_node_id = Some(node.id.clone());
        context.log(
            LogLevel::Info,
            LogEvent::NodeEntered,
            Some(&node.id),
            format!("Entering {} node (attempt {})", node.node_type, attempt),
        );
        tracing::info!(
            "📍 Execution {}: node '{}' ({}) attempt {}",
            context.id,
            node.id,
            node.node_type,
            attempt
        );

        let executor = match compiled.executor(&node.id) {
            Some(Ok(executor)) => executor,
            Some(Err(unknown)) => {
                let error = ExecutionError::structural(Some(&node.id), unknown.to_string());
                return self.fail(context, error, delivery.owner).await;
            }
            None => {
                let error = ExecutionError::structural(Some(&node.id), "Node has no compiled entry");
                return self.fail(context, error, delivery.owner).await;
            }
        };

        let started = std::time::Instant::now();
        let outcome = self.invoke(executor, node, context).await;

        let failure = match outcome {
            Ok(result) if result.success => {
                self.metrics.node_succeeded(compiled.id(), node.node_type.as_str());
                context.log(
                    LogLevel::Info,
                    LogEvent::NodeCompleted,
                    Some(&node.id),
                    format!("Completed in {:?}", started.elapsed()),
                );
                if let Some(data) = &result.data {
                    context.log(LogLevel::Debug, LogEvent::NodeCompleted, Some(&node.id), data.to_string());
                }
                apply_variable_updates(context, node, &result);
                return self.route(context, compiled, node, delivery, result).await;
            }
            Ok(result) => {
                let error = result
                    .error
                    .unwrap_or_else(|| ActionError::new("Node reported failure without an error"));
                let kind = if error.is_retryable() {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Runtime
                };
                (kind, error.message)
            }
            Err(error) => {
                let kind = match &error {
                    NodeError::Transient(_) => ErrorKind::Transient,
                    NodeError::Config(_) => ErrorKind::Validation,
                    NodeError::Permanent(_) | NodeError::Other(_) => ErrorKind::Runtime,
                };
                (kind, error.to_string())
            }
        };

        let (kind, message) = failure;
        self.metrics.node_failed(compiled.id(), node.node_type.as_str());
        let error = ExecutionError::new(kind, Some(&node.id), message.clone()).at_attempt(attempt);

        if error.is_retryable {
            context.record_error(error);
            context.log(
                LogLevel::Warn,
                LogEvent::Retrying,
                Some(&node.id),
                format!("Attempt {} failed, retry scheduled: {}", attempt, message),
            );
            tracing::warn!(
                "🔁 Execution {}: node '{}' attempt {} failed: {}",
                context.id,
                node.id,
                attempt,
                message
            );
            if let Some(refused) = self.commit(context, delivery.owner).await? {
                return Ok(refused);
            }
            self.metrics.retry_scheduled(compiled.id());
            return Ok(JobOutcome::Retry { reason: message });
        }

        tracing::error!("❌ Execution {}: node '{}' failed: {}", context.id, node.id, message);
        self.fail(context, error, delivery.owner).await
    }

    /// Run the executor on its own task so a panic cannot take the worker down
    async fn invoke(
        &self,
        executor: Arc<dyn NodeExecutor>,
        node: &FunnelNode,
        context: &ExecutionContext,
    ) -> Result<ActionResult, NodeError> {
        let owned_node = node.clone();
        let snapshot = context.clone();
        let mut handle =
            tokio::spawn(async move { executor.execute(&owned_node, &snapshot).await });

        let timeout = node
            .timeout_ms()
            .or(self.config.default_node_timeout_ms)
            .map(Duration::from_millis);

        let joined = match timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    handle.abort();
                    return Err(NodeError::transient(format!(
                        "node '{}' timed out after {:?}",
                        node.id, limit
                    )));
                }
            },
            None => handle.await,
        };

        match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(NodeError::permanent(format!(
                "executor for node '{}' panicked",
                node.id
            ))),
            Err(e) => Err(NodeError::transient(format!(
                "executor task for node '{}' was cancelled: {}",
                node.id, e
            ))),
        }
    }

    /// Apply routing precedence to a successful result and dispatch follow-up jobs
    async fn route(
        &self,
        context: &mut ExecutionContext,
        compiled: &CompiledFunnel,
        node: &FunnelNode,
        delivery: &Delivery<'_>,
        result: ActionResult,
    ) -> Result<JobOutcome> {
        context.traversal.completed_steps.insert(delivery.payload.step);

        if let Some(delay) = result.delay {
            return self.suspend(context, compiled, node, delivery, delay).await;
        }

        if !result.should_continue || node.node_type.is_terminal() {
            context.log(LogLevel::Info, LogEvent::Routed, Some(&node.id), "Path closed");
            return self.close_path(context, delivery.owner).await;
        }

        let targets = match select_targets(context, compiled, node, &result) {
            Ok(targets) => targets,
            Err(error) => {
                tracing::error!("🧱 Execution {}: {}", context.id, error.message);
                return self.fail(context, error, delivery.owner).await;
            }
        };

        let mut jobs = Vec::with_capacity(targets.len());
        for target in &targets {
            let step = context.allocate_step();
            jobs.push(self.node_job(
                &compiled.funnel.settings,
                JobType::ExecuteNode,
                context.metadata.priority,
                &NodeJob {
                    execution_id: context.id.clone(),
                    node_id: target.clone(),
                    from_node_id: Some(node.id.clone()),
                    step,
                },
            )?);
        }
        context.traversal.open_paths += targets.len() as u32 - 1;
        context.log(
            LogLevel::Info,
            LogEvent::Routed,
            Some(&node.id),
            format!("Routed to {}", targets.join(", ")),
        );
        refresh_status(context);

        if let Some(refused) = self.commit(context, delivery.owner).await? {
            return Ok(refused);
        }
        self.dispatch(context, jobs, delivery.owner).await
    }

    async fn suspend(
        &self,
        context: &mut ExecutionContext,
        compiled: &CompiledFunnel,
        node: &FunnelNode,
        delivery: &Delivery<'_>,
        delay: Duration,
    ) -> Result<JobOutcome> {
        context.traversal.suspended_paths += 1;
        let step = context.allocate_step();
        let job = self.node_job(
            &compiled.funnel.settings,
            JobType::ProcessDelay,
            context.metadata.priority,
            &NodeJob {
                execution_id: context.id.clone(),
                node_id: node.id.clone(),
                from_node_id: delivery.payload.from_node_id.clone(),
                step,
            },
        )?;
        context.log(
            LogLevel::Info,
            LogEvent::Suspended,
            Some(&node.id),
            format!("Suspended for {:?}", delay),
        );
        refresh_status(context);

        if let Some(refused) = self.commit(context, delivery.owner).await? {
            return Ok(refused);
        }
        tracing::info!("⏸️ Execution {} suspended at '{}' for {:?}", context.id, node.id, delay);

        if let Err(e) = self.queue.enqueue_delayed(job, delay).await {
            return self.fail_dispatch(context, e, delivery.owner).await;
        }
        Ok(JobOutcome::Done)
    }

    /// Close the current path; the last path to close ends the execution
    async fn close_path(&self, context: &mut ExecutionContext, owner: &str) -> Result<JobOutcome> {
        context.traversal.open_paths = context.traversal.open_paths.saturating_sub(1);

        if context.traversal.open_paths > 0 {
            refresh_status(context);
            return Ok(self.commit(context, owner).await?.unwrap_or(JobOutcome::Done));
        }

        let stalled: Vec<String> = context
            .traversal
            .merge_arrivals
            .keys()
            .filter(|id| !context.traversal.fired_merges.contains_key(*id))
            .cloned()
            .collect();
        if let Some(merge_id) = stalled.first() {
            let error = ExecutionError::structural(
                Some(merge_id),
                format!("Merge '{}' can never receive all required predecessors", merge_id),
            );
            return self.fail(context, error, owner).await;
        }

        context.current_node_id = None;
        self.finish(context, ExecutionStatus::Completed, owner).await
    }

    async fn dispatch(&self, context: &mut ExecutionContext, jobs: Vec<QueueJob>, owner: &str) -> Result<JobOutcome> {
        for job in jobs {
            if let Err(e) = self.queue.enqueue(job).await {
                return self.fail_dispatch(context, e, owner).await;
            }
        }
        Ok(JobOutcome::Done)
    }

    /// A follow-up job could not be enqueued; the path would be lost, so fail
    async fn fail_dispatch(
        &self,
        context: &mut ExecutionContext,
        error: anyhow::Error,
        owner: &str,
    ) -> Result<JobOutcome> {
        tracing::error!("📭 Execution {}: failed to enqueue follow-up job: {}", context.id, error);
        let error = ExecutionError::new(
            ErrorKind::Runtime,
            context.current_node_id.clone().as_deref(),
            format!("Failed to enqueue follow-up job: {}", error),
        );
        self.fail(context, error, owner).await
    }

    async fn fail(&self, context: &mut ExecutionContext, error: ExecutionError, owner: &str) -> Result<JobOutcome> {
        let node_id = error.node_id.clone();
        context.log(
            LogLevel::Error,
            LogEvent::NodeFailed,
            node_id.as_deref(),
            error.message.clone(),
        );
        context.record_error(error);
        self.finish(context, ExecutionStatus::Failed, owner).await
    }

    /// Move to a terminal state and persist it under the lease
    async fn finish(&self, context: &mut ExecutionContext, status: ExecutionStatus, owner: &str) -> Result<JobOutcome> {
        if !terminate(context, status) {
            return Ok(JobOutcome::Done);
        }
        if let Some(refused) = self.commit(context, owner).await? {
            return Ok(refused);
        }
        self.finished(context).await;
        Ok(JobOutcome::Done)
    }

    /// Persist a step's changes under `owner`'s lease
    ///
    /// `None` when written. Otherwise the outcome the job should settle with:
    /// done when the execution went terminal underneath us, requeued when the
    /// lease was taken over so the step runs again from the stored state.
    async fn commit(&self, context: &ExecutionContext, owner: &str) -> Result<Option<JobOutcome>> {
        if self.store.save(context, owner).await? {
            return Ok(None);
        }
        match self.store.get(&context.id).await? {
            Some(stored) if !stored.status.is_terminal() => {
                tracing::warn!(
                    "💔 Execution {}: {} lost the lease mid-step, redelivering",
                    context.id,
                    owner
                );
                Ok(Some(JobOutcome::Requeue {
                    delay: self.config.lease_busy_delay(),
                }))
            }
            _ => {
                tracing::debug!("⏹️ Execution {} became terminal mid-step, not dispatching", context.id);
                Ok(Some(JobOutcome::Done))
            }
        }
    }

    /// Bookkeeping once a terminal state has been written
    async fn finished(&self, context: &ExecutionContext) {
        self.metrics
            .execution_finished(&context.funnel_id, context.status.as_str());
        tracing::info!(
            "🏁 Execution {} finished as {} after {} ms",
            context.id,
            context.status.as_str(),
            context.elapsed_ms(Utc::now())
        );
        self.schedule_cleanup(&context.id).await;
    }

    async fn schedule_cleanup(&self, execution_id: &str) {
        let job = match QueueJob::with_payload(
            JobType::Cleanup,
            &CleanupJob {
                execution_id: execution_id.to_string(),
            },
        ) {
            Ok(job) => job.with_priority(JobPriority::Low),
            Err(e) => {
                tracing::warn!("⚠️ Could not build cleanup job for {}: {}", execution_id, e);
                return;
            }
        };
        if let Err(e) = self
            .queue
            .enqueue_delayed(job, self.config.execution_retention())
            .await
        {
            tracing::warn!("⚠️ Could not schedule cleanup for {}: {}", execution_id, e);
        }
    }

    /// Record a child on its parent, waiting for the parent's lease
    ///
    /// Gives up after one lease TTL; the link is informational.
    async fn link_child(&self, parent_id: &str, child_id: &str) {
        let owner = format!("link:{}", child_id);
        let result = async {
            let deadline = tokio::time::Instant::now() + self.config.lease_ttl();
            while !self
                .store
                .try_acquire_lease(parent_id, &owner, self.config.lease_ttl())
                .await?
            {
                if tokio::time::Instant::now() >= deadline {
                    return Err(anyhow::anyhow!("parent stayed leased"));
                }
                tokio::time::sleep(self.config.lease_busy_delay()).await;
            }

            let linked = self
                .store
                .update(parent_id, &|parent| {
                    parent.metadata.child_execution_ids.push(child_id.to_string());
                    true
                })
                .await;
            self.store.release_lease(parent_id, &owner).await?;
            linked.map(|_| ())
        }
        .await;
        if let Err(e) = result {
            tracing::warn!("⚠️ Could not link child {} to parent {}: {}", child_id, parent_id, e);
        }
    }

    fn node_job(
        &self,
        settings: &FunnelSettings,
        job_type: JobType,
        priority: JobPriority,
        payload: &NodeJob,
    ) -> Result<QueueJob> {
        let backoff = BackoffPolicy {
            kind: settings.retry_backoff,
            delay_ms: settings.retry_delay_ms,
            max_delay_ms: MAX_RETRY_DELAY_MS.max(settings.retry_delay_ms),
        };
        Ok(QueueJob::with_payload(job_type, payload)?
            .with_priority(priority)
            .with_options(JobOptions {
                max_retries: settings.max_retry_attempts,
                backoff,
                ..JobOptions::default()
            }))
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("config", &self.config)
            .finish()
    }
}

/// A delivered node job, processed under `owner`'s lease
#[derive(Clone, Copy)]
struct Delivery<'a> {
    job: &'a QueueJob,
    payload: &'a NodeJob,
    owner: &'a str,
}

/// Record a merge arrival; true when this delivery is the one that fires the join
///
/// The firing step is remembered, so a retried delivery of that step passes
/// the join again while any later arrival is absorbed.
fn merge_ready(
    context: &mut ExecutionContext,
    compiled: &CompiledFunnel,
    node: &FunnelNode,
    payload: &NodeJob,
) -> bool {
    if let Some(step) = context.traversal.fired_merges.get(&node.id) {
        if *step == payload.step {
            return true;
        }
        context.log(
            LogLevel::Debug,
            LogEvent::MergeWaiting,
            Some(&node.id),
            "Merge already fired, ignoring late arrival",
        );
        return false;
    }

    let from = payload.from_node_id.clone().unwrap_or_default();
    let arrivals = context
        .traversal
        .merge_arrivals
        .entry(node.id.clone())
        .or_default();
    arrivals.insert(from.clone());

    let required = compiled.required_arrivals(&node.id);
    let missing: Vec<&String> = required.iter().filter(|id| !arrivals.contains(*id)).collect();
    if !missing.is_empty() {
        let message = format!(
            "Arrival from '{}', waiting for {} more ({})",
            from,
            missing.len(),
            missing.iter().map(|id| id.as_str()).collect::<Vec<_>>().join(", ")
        );
        context.log(LogLevel::Info, LogEvent::MergeWaiting, Some(&node.id), message);
        return false;
    }

    context.traversal.fired_merges.insert(node.id.clone(), payload.step);
    true
}

/// Transition to a terminal status and log it; false when the move is refused
fn terminate(context: &mut ExecutionContext, status: ExecutionStatus) -> bool {
    if !context.transition(status) {
        return false;
    }
    context.log(
        LogLevel::Info,
        LogEvent::Lifecycle,
        None,
        format!("Execution {}", status.as_str()),
    );
    true
}

/// PAUSED while every open path sits in a delay, RUNNING otherwise
fn refresh_status(context: &mut ExecutionContext) {
    let traversal = &context.traversal;
    let all_suspended = traversal.open_paths > 0 && traversal.suspended_paths >= traversal.open_paths;
    let next = if all_suspended {
        ExecutionStatus::Paused
    } else {
        ExecutionStatus::Running
    };
    context.transition(next);
}

/// Pick the next node(s) for a successful, continuing result
///
/// Explicit fan-out, then explicit next node, then connections by weight
/// (stable, so declaration order breaks ties): first conditional connection
/// that holds, else the first fallback.
fn select_targets(
    context: &ExecutionContext,
    compiled: &CompiledFunnel,
    node: &FunnelNode,
    result: &ActionResult,
) -> Result<Vec<String>, ExecutionError> {
    let require_node = |target: &String| {
        if compiled.node(target).is_some() {
            Ok(target.clone())
        } else {
            Err(ExecutionError::structural(
                Some(&node.id),
                format!("Node '{}' routed to unknown node '{}'", node.id, target),
            ))
        }
    };

    if let Some(targets) = &result.fan_out {
        if targets.is_empty() {
            return Err(ExecutionError::structural(
                Some(&node.id),
                format!("Dead end at '{}': no branch qualified", node.id),
            ));
        }
        return targets.iter().map(require_node).collect();
    }

    if let Some(next) = &result.next_node_id {
        return require_node(next).map(|target| vec![target]);
    }

    let root = context.variables_json();
    let evaluator = ConditionEvaluator::new(&root);
    let mut ordered: Vec<_> = node.connections.iter().collect();
    ordered.sort_by(|a, b| b.weight.cmp(&a.weight));

    let chosen = ordered
        .iter()
        .find(|connection| {
            !connection.is_default
                && connection
                    .condition
                    .as_ref()
                    .map(|condition| evaluator.evaluate(condition))
                    .unwrap_or(false)
        })
        .or_else(|| ordered.iter().find(|connection| connection.is_fallback()));

    match chosen {
        Some(connection) => require_node(&connection.target).map(|target| vec![target]),
        None => Err(ExecutionError::structural(
            Some(&node.id),
            format!("Dead end at '{}': no outgoing connection qualifies", node.id),
        )),
    }
}

fn apply_variable_updates(context: &mut ExecutionContext, node: &FunnelNode, result: &ActionResult) {
    if result.variable_updates.is_empty() {
        return;
    }
    let mut keys: Vec<&String> = result.variable_updates.keys().collect();
    keys.sort();
    let message = format!(
        "Updated {}",
        keys.iter().map(|key| key.as_str()).collect::<Vec<_>>().join(", ")
    );
    context
        .variables
        .extend(result.variable_updates.iter().map(|(k, v)| (k.clone(), v.clone())));
    context.log(LogLevel::Debug, LogEvent::Variables, Some(&node.id), message);
}

/// Warn about seeded values that do not match their declared type
fn check_variable_types(funnel: &Funnel, context: &mut ExecutionContext) {
    for declared in &funnel.variables {
        let mismatch = context
            .variables
            .get(&declared.name)
            .map(|value| !declared.var_type.accepts(value))
            .unwrap_or(false);
        if mismatch {
            context.log(
                LogLevel::Warn,
                LogEvent::Variables,
                None,
                format!(
                    "Variable '{}' does not match declared type {:?}",
                    declared.name, declared.var_type
                ),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funnel::{Condition, ConditionOperator, Connection};
    use crate::metrics::InMemoryMetrics;
    use crate::queue::MemoryJobQueue;
    use crate::runtime::registry::ExecutorRegistry;
    use crate::store::MemoryExecutionStore;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn compiled(nodes: Vec<FunnelNode>) -> Arc<CompiledFunnel> {
        let funnel = Funnel {
            id: "f1".into(),
            name: String::new(),
            version: 1,
            active: true,
            nodes,
            triggers: Vec::new(),
            variables: Vec::new(),
            settings: Default::default(),
        };
        FunnelRegistry::new(Arc::new(ExecutorRegistry::with_builtins())).install_unchecked(funnel)
    }

    fn context(variables: Value) -> ExecutionContext {
        let funnel: Funnel = serde_json::from_value(json!({"id": "f1", "nodes": []})).unwrap();
        let bag = variables
            .as_object()
            .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        ExecutionContext::new(&funnel, "t1", bag, ExecutionMetadata::default())
    }

    fn score_router() -> Arc<CompiledFunnel> {
        compiled(vec![
            FunnelNode::new("check", NodeType::Condition)
                .with_connection(
                    Connection::new("check", "hot")
                        .when(Condition::leaf("score", ConditionOperator::GreaterThan, json!(50))),
                )
                .with_connection(
                    Connection::new("check", "cold")
                        .when(Condition::leaf("score", ConditionOperator::LessThan, json!(50))),
                ),
            FunnelNode::new("hot", NodeType::End),
            FunnelNode::new("cold", NodeType::End),
        ])
    }

    #[test]
    fn test_connection_conditions_select_target() {
        let fixture = score_router();
        let node = fixture.node("check").unwrap();
        let proceed = ActionResult::proceed();

        let hot = select_targets(&context(json!({"score": 80})), &fixture, node, &proceed).unwrap();
        let cold = select_targets(&context(json!({"score": 20})), &fixture, node, &proceed).unwrap();
        assert_eq!(hot, vec!["hot".to_string()]);
        assert_eq!(cold, vec!["cold".to_string()]);

        let dead_end = select_targets(&context(json!({"score": 50})), &fixture, node, &proceed).unwrap_err();
        assert_eq!(dead_end.kind, ErrorKind::Structural);
        assert!(!dead_end.is_retryable);
    }

    #[test]
    fn test_weight_breaks_ties_then_declaration_order() {
        let always = || Condition::leaf("score", ConditionOperator::Exists, Value::Null);
        let fixture = compiled(vec![
            FunnelNode::new("start", NodeType::Action)
                .with_connection(Connection::new("start", "a").when(always()))
                .with_connection(Connection::new("start", "b").when(always()).weighted(5))
                .with_connection(Connection::new("start", "c").when(always()).weighted(5)),
            FunnelNode::new("a", NodeType::End),
            FunnelNode::new("b", NodeType::End),
            FunnelNode::new("c", NodeType::End),
        ]);

        let actual = select_targets(
            &context(json!({"score": 1})),
            &fixture,
            fixture.node("start").unwrap(),
            &ActionResult::proceed(),
        )
        .unwrap();
        assert_eq!(actual, vec!["b".to_string()]);
    }

    #[test]
    fn test_fallback_connection_used_when_no_condition_holds() {
        let fixture = compiled(vec![
            FunnelNode::new("start", NodeType::Action)
                .with_connection(Connection::new("start", "vip").when(Condition::leaf(
                    "vip",
                    ConditionOperator::Equals,
                    json!(true),
                )))
                .connect("regular"),
            FunnelNode::new("vip", NodeType::End),
            FunnelNode::new("regular", NodeType::End),
        ]);

        let actual = select_targets(
            &context(json!({})),
            &fixture,
            fixture.node("start").unwrap(),
            &ActionResult::proceed(),
        )
        .unwrap();
        assert_eq!(actual, vec!["regular".to_string()]);
    }

    #[test]
    fn test_explicit_next_must_exist() {
        let fixture = score_router();
        let node = fixture.node("check").unwrap();

        let actual = select_targets(&context(json!({})), &fixture, node, &ActionResult::goto("hot")).unwrap();
        assert_eq!(actual, vec!["hot".to_string()]);

        let error = select_targets(&context(json!({})), &fixture, node, &ActionResult::goto("ghost")).unwrap_err();
        assert_eq!(error.kind, ErrorKind::Structural);

        let error = select_targets(&context(json!({})), &fixture, node, &ActionResult::fan_out(Vec::new())).unwrap_err();
        assert_eq!(error.kind, ErrorKind::Structural);
    }

    #[test]
    fn test_refresh_status_tracks_suspended_paths() {
        let mut fixture = context(json!({}));
        fixture.transition(ExecutionStatus::Running);
        fixture.traversal.open_paths = 2;
        fixture.traversal.suspended_paths = 1;
        refresh_status(&mut fixture);
        assert_eq!(fixture.status, ExecutionStatus::Running);

        fixture.traversal.suspended_paths = 2;
        refresh_status(&mut fixture);
        assert_eq!(fixture.status, ExecutionStatus::Paused);
    }

    #[tokio::test]
    async fn test_cancel_is_false_for_unknown_and_terminal_executions() {
        let engine = ExecutionEngine::new(
            Arc::new(FunnelRegistry::new(Arc::new(ExecutorRegistry::with_builtins()))),
            Arc::new(MemoryExecutionStore::new()),
            Arc::new(MemoryJobQueue::new()),
            Arc::new(InMemoryMetrics::new()),
            EngineConfig::default(),
        );
        assert!(!engine.cancel_execution("missing").await.unwrap());

        let funnel: Funnel = serde_json::from_value(json!({
            "id": "f1",
            "active": true,
            "nodes": [
                {"id": "start", "type": "trigger", "connections": [{"source": "start", "target": "end"}]},
                {"id": "end", "type": "end"}
            ]
        }))
        .unwrap();
        let context = engine.execute_funnel(&funnel, "t1", HashMap::new()).await.unwrap();
        assert_eq!(context.status, ExecutionStatus::Pending);

        assert!(engine.cancel_execution(&context.id).await.unwrap());
        assert!(!engine.cancel_execution(&context.id).await.unwrap());

        let actual = engine.get_execution_context(&context.id).await.unwrap().unwrap();
        assert_eq!(actual.status, ExecutionStatus::Cancelled);
    }
}
