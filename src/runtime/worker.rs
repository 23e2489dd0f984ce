/// Queue workers
///
/// A worker repeatedly reserves the next job, hands it to the engine (or to
/// the trigger manager for `trigger-webhook` jobs) and settles it with the
/// broker according to the returned outcome. Workers share nothing but the
/// queue and the execution store, so any number of them can run side by side.

use crate::queue::{JobQueue, JobType, NackOutcome, QueueJob};
use crate::runtime::engine::{ExecutionEngine, JobOutcome};
use crate::trigger::TriggerManager;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// A single queue consumer
#[derive(Clone)]
pub struct Worker {
    id: String,
    engine: Arc<ExecutionEngine>,
    triggers: Arc<TriggerManager>,
}

impl Worker {
    pub fn new(id: impl Into<String>, engine: Arc<ExecutionEngine>, triggers: Arc<TriggerManager>) -> Self {
        Self {
            id: id.into(),
            engine,
            triggers,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn queue(&self) -> &Arc<dyn JobQueue> {
        self.engine.queue()
    }

    /// Process one deliverable job; false when nothing was ready
    pub async fn run_once(&self) -> Result<bool> {
        let Some(job) = self.queue().dequeue().await? else {
            return Ok(false);
        };
        self.handle(job).await?;
        Ok(true)
    }

    /// Process jobs until none is ready, up to `max_jobs`
    pub async fn run_until_idle(&self, max_jobs: usize) -> Result<usize> {
        let mut processed = 0;
        while processed < max_jobs && self.run_once().await? {
            processed += 1;
        }
        Ok(processed)
    }

    async fn run(self, poll_interval: Duration, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("👷 Worker {} started", self.id);
        loop {
            if *shutdown.borrow() {
                break;
            }
            let idle = match self.run_once().await {
                Ok(processed) => !processed,
                Err(e) => {
                    tracing::error!("❌ Worker {} failed to process a job: {}", self.id, e);
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
        tracing::info!("👋 Worker {} stopped", self.id);
    }

    async fn handle(&self, job: QueueJob) -> Result<()> {
        let outcome = if job.job_type == JobType::TriggerWebhook {
            self.triggers
                .process_trigger_job(&job)
                .await
                .map(|_| JobOutcome::Done)
        } else {
            self.engine.process_job(&job, &self.id).await
        };

        match outcome {
            Ok(JobOutcome::Done) => self.queue().ack(&job.id).await,
            Ok(JobOutcome::Retry { reason }) => self.nack(&job, &reason).await,
            Ok(JobOutcome::Requeue { delay }) => {
                let mut copy = job.clone();
                copy.id = Uuid::new_v4().to_string();
                self.queue().enqueue_delayed(copy, delay).await?;
                self.queue().ack(&job.id).await
            }
            Err(e) => {
                tracing::warn!("⚠️ Job {} ({:?}) errored: {}", job.id, job.job_type, e);
                self.nack(&job, &e.to_string()).await
            }
        }
    }

    async fn nack(&self, job: &QueueJob, reason: &str) -> Result<()> {
        if let NackOutcome::DeadLettered = self.queue().nack(&job.id, reason).await? {
            self.engine.handle_retries_exhausted(job, reason).await?;
        }
        Ok(())
    }
}

/// Fixed-size pool of workers running on the tokio runtime
pub struct WorkerPool {
    workers: Vec<Worker>,
    poll_interval: Duration,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Build `engine.config().workers` workers named `worker-1..n`
    pub fn new(engine: Arc<ExecutionEngine>, triggers: Arc<TriggerManager>) -> Self {
        let size = engine.config().workers.max(1);
        let poll_interval = engine.config().poll_interval();
        let workers = (1..=size)
            .map(|n| Worker::new(format!("worker-{}", n), Arc::clone(&engine), Arc::clone(&triggers)))
            .collect();
        let (shutdown, _) = watch::channel(false);

        Self {
            workers,
            poll_interval,
            shutdown,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub async fn start(&self) {
        let mut handles = self.handles.lock().await;
        if !handles.is_empty() {
            return;
        }
        for worker in &self.workers {
            let receiver = self.shutdown.subscribe();
            handles.push(tokio::spawn(worker.clone().run(self.poll_interval, receiver)));
        }
        tracing::info!("🏭 Worker pool started with {} workers", self.workers.len());
    }

    /// Signal every worker and wait for in-flight jobs to settle
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let handles: Vec<JoinHandle<()>> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!("⚠️ Worker task ended abnormally: {}", e);
            }
        }
        let _ = self.shutdown.send(false);
        tracing::info!("✅ Worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::funnel::{Funnel, FunnelNode, FunnelRegistry, NodeType};
    use crate::metrics::InMemoryMetrics;
    use crate::queue::MemoryJobQueue;
    use crate::runtime::context::ExecutionStatus;
    use crate::runtime::registry::ExecutorRegistry;
    use crate::runtime::scheduler::TriggerScheduler;
    use crate::store::MemoryExecutionStore;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    async fn fixture(config: EngineConfig) -> (Arc<ExecutionEngine>, Arc<TriggerManager>) {
        let queue = Arc::new(MemoryJobQueue::new());
        let engine = Arc::new(ExecutionEngine::new(
            Arc::new(FunnelRegistry::new(Arc::new(ExecutorRegistry::with_builtins()))),
            Arc::new(MemoryExecutionStore::new()),
            queue.clone(),
            Arc::new(InMemoryMetrics::new()),
            config,
        ));
        let scheduler = Arc::new(TriggerScheduler::new(queue).await.unwrap());
        let triggers = Arc::new(TriggerManager::new(Arc::clone(&engine), scheduler));
        (engine, triggers)
    }

    fn linear() -> Funnel {
        Funnel {
            id: "f1".into(),
            name: "Linear".into(),
            version: 1,
            active: true,
            nodes: vec![
                FunnelNode::new("start", NodeType::Trigger).connect("end"),
                FunnelNode::new("end", NodeType::End),
            ],
            triggers: Vec::new(),
            variables: Vec::new(),
            settings: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_worker_drives_execution_to_completion() {
        let (engine, triggers) = fixture(EngineConfig::default()).await;
        let worker = Worker::new("worker-test", Arc::clone(&engine), triggers);

        let context = engine.execute_funnel(&linear(), "t1", HashMap::new()).await.unwrap();
        let processed = worker.run_until_idle(10).await.unwrap();
        assert_eq!(processed, 2);

        let actual = engine.get_execution_context(&context.id).await.unwrap().unwrap();
        assert_eq!(actual.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_pool_starts_and_stops() {
        let config = EngineConfig {
            workers: 3,
            poll_interval_ms: 5,
            ..EngineConfig::default()
        };
        let (engine, triggers) = fixture(config).await;
        let pool = WorkerPool::new(Arc::clone(&engine), triggers);
        assert_eq!(pool.size(), 3);

        pool.start().await;
        let context = engine.execute_funnel(&linear(), "t1", HashMap::new()).await.unwrap();

        let mut status = ExecutionStatus::Pending;
        for _ in 0..200 {
            status = engine.get_execution_context(&context.id).await.unwrap().unwrap().status;
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        pool.shutdown().await;
        assert_eq!(status, ExecutionStatus::Completed);
    }
}
