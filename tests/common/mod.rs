//! Shared harness for engine integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use funnelway::config::EngineConfig;
use funnelway::error::NodeError;
use funnelway::funnel::{Funnel, FunnelNode, FunnelRegistry, FunnelSettings, NodeType};
use funnelway::metrics::InMemoryMetrics;
use funnelway::queue::MemoryJobQueue;
use funnelway::runtime::{
    ActionResult, ExecutionContext, ExecutionEngine, ExecutorRegistry, NodeExecutor,
    TriggerScheduler, Worker,
};
use funnelway::store::MemoryExecutionStore;
use funnelway::trigger::TriggerManager;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Fails with a transient error for the first `failures` calls
#[derive(Debug)]
pub struct FlakyExecutor {
    failures: u32,
    calls: AtomicU32,
}

impl FlakyExecutor {
    pub fn new(failures: u32) -> Self {
        Self {
            failures,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NodeExecutor for FlakyExecutor {
    async fn execute(&self, _node: &FunnelNode, _context: &ExecutionContext) -> Result<ActionResult, NodeError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(NodeError::transient(format!("upstream unavailable (call {})", call)));
        }
        Ok(ActionResult::proceed())
    }
}

/// Sleeps for `delay` on every call and records how many calls overlapped
#[derive(Debug)]
pub struct SlowExecutor {
    delay: Duration,
    calls: AtomicU32,
    in_flight: AtomicU32,
    peak: AtomicU32,
}

impl SlowExecutor {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: AtomicU32::new(0),
            in_flight: AtomicU32::new(0),
            peak: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Most calls that were running at the same time
    pub fn peak(&self) -> u32 {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NodeExecutor for SlowExecutor {
    async fn execute(&self, _node: &FunnelNode, _context: &ExecutionContext) -> Result<ActionResult, NodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(ActionResult::proceed())
    }
}

pub struct Harness {
    pub engine: Arc<ExecutionEngine>,
    pub triggers: Arc<TriggerManager>,
    pub queue: Arc<MemoryJobQueue>,
    pub store: Arc<MemoryExecutionStore>,
    pub metrics: Arc<InMemoryMetrics>,
    pub worker: Worker,
}

impl Harness {
    pub async fn new() -> Self {
        Self::build(test_config(), ExecutorRegistry::with_builtins()).await
    }

    pub async fn build(config: EngineConfig, executors: ExecutorRegistry) -> Self {
        let queue = Arc::new(MemoryJobQueue::new());
        let store = Arc::new(MemoryExecutionStore::new());
        Self::attach(config, executors, Arc::clone(&queue), Arc::clone(&store)).await
    }

    /// A fresh engine process over an existing queue and store
    pub async fn attach(
        config: EngineConfig,
        executors: ExecutorRegistry,
        queue: Arc<MemoryJobQueue>,
        store: Arc<MemoryExecutionStore>,
    ) -> Self {
        let metrics = Arc::new(InMemoryMetrics::new());
        let engine = Arc::new(ExecutionEngine::new(
            Arc::new(FunnelRegistry::new(Arc::new(executors))),
            store.clone(),
            queue.clone(),
            metrics.clone(),
            config,
        ));
        let scheduler = Arc::new(TriggerScheduler::new(queue.clone()).await.unwrap());
        let triggers = Arc::new(TriggerManager::new(Arc::clone(&engine), scheduler));
        let worker = Worker::new("worker-1", Arc::clone(&engine), Arc::clone(&triggers));

        Self {
            engine,
            triggers,
            queue,
            store,
            metrics,
            worker,
        }
    }

    pub async fn install(&self, funnel: &Funnel) {
        self.engine.funnels().activate(funnel.clone()).unwrap();
        self.triggers.register_funnel_triggers(funnel).await.unwrap();
    }

    /// Process every job that is ready right now
    pub async fn drain(&self) -> usize {
        self.worker.run_until_idle(1_000).await.unwrap()
    }

    pub async fn context(&self, execution_id: &str) -> ExecutionContext {
        self.engine
            .get_execution_context(execution_id)
            .await
            .unwrap()
            .unwrap()
    }

    /// Keep draining until the execution is terminal or `limit` elapses
    pub async fn run_to_end(&self, execution_id: &str, limit: Duration) -> ExecutionContext {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            self.drain().await;
            let context = self.context(execution_id).await;
            if context.status.is_terminal() || tokio::time::Instant::now() >= deadline {
                return context;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Drive `count` workers side by side until every listed execution is
    /// terminal or `limit` elapses
    pub async fn run_competing(&self, count: usize, execution_ids: &[&str], limit: Duration) -> Vec<ExecutionContext> {
        let workers: Vec<Worker> = (1..=count)
            .map(|n| Worker::new(format!("worker-{}", n), Arc::clone(&self.engine), Arc::clone(&self.triggers)))
            .collect();

        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let mut round = tokio::task::JoinSet::new();
            for worker in &workers {
                let worker = worker.clone();
                round.spawn(async move { worker.run_until_idle(50).await });
            }
            while let Some(joined) = round.join_next().await {
                joined.unwrap().unwrap();
            }

            let mut contexts = Vec::with_capacity(execution_ids.len());
            for execution_id in execution_ids {
                contexts.push(self.context(execution_id).await);
            }
            if contexts.iter().all(|context| context.status.is_terminal())
                || tokio::time::Instant::now() >= deadline
            {
                return contexts;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        max_concurrent_executions: 100,
        workers: 1,
        poll_interval_ms: 5,
        lease_ttl_ms: 5_000,
        lease_busy_delay_ms: 5,
        admission_delay_ms: 20,
        execution_retention_ms: 60_000,
        default_node_timeout_ms: None,
    }
}

pub fn fast_retries(max_retry_attempts: u32) -> FunnelSettings {
    FunnelSettings {
        max_retry_attempts,
        retry_delay_ms: 5,
        retry_backoff: funnelway::queue::BackoffKind::Fixed,
        ..FunnelSettings::default()
    }
}

pub fn funnel(id: &str, nodes: Vec<FunnelNode>) -> Funnel {
    Funnel {
        id: id.to_string(),
        name: id.to_string(),
        version: 1,
        active: true,
        nodes,
        triggers: Vec::new(),
        variables: Vec::new(),
        settings: FunnelSettings::default(),
    }
}

pub fn trigger_node(id: &str, next: &str) -> FunnelNode {
    FunnelNode::new(id, NodeType::Trigger).connect(next)
}
