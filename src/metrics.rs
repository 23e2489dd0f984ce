/// Engine metrics collaborator
///
/// The engine reports lifecycle counts through `EngineMetrics`; storage and
/// dashboards are someone else's job. `InMemoryMetrics` keeps plain atomic
/// counters for the health endpoint and for tests.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

pub trait EngineMetrics: Send + Sync {
    fn execution_started(&self, funnel_id: &str);
    fn execution_finished(&self, funnel_id: &str, status: &str);
    fn node_succeeded(&self, funnel_id: &str, node_type: &str);
    fn node_failed(&self, funnel_id: &str, node_type: &str);
    fn retry_scheduled(&self, funnel_id: &str);
}

#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    timed_out: AtomicU64,
    node_successes: AtomicU64,
    node_failures: AtomicU64,
    retries: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub timed_out: u64,
    pub node_successes: u64,
    pub node_failures: u64,
    pub retries: u64,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            started: self.started.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            node_successes: self.node_successes.load(Ordering::Relaxed),
            node_failures: self.node_failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

impl EngineMetrics for InMemoryMetrics {
    fn execution_started(&self, _funnel_id: &str) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    fn execution_finished(&self, _funnel_id: &str, status: &str) {
        let counter = match status {
            "completed" => &self.completed,
            "failed" => &self.failed,
            "cancelled" => &self.cancelled,
            "timeout" => &self.timed_out,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn node_succeeded(&self, _funnel_id: &str, _node_type: &str) {
        self.node_successes.fetch_add(1, Ordering::Relaxed);
    }

    fn node_failed(&self, _funnel_id: &str, _node_type: &str) {
        self.node_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn retry_scheduled(&self, _funnel_id: &str) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_snapshot_counts_terminal_states() {
        let metrics = InMemoryMetrics::new();
        metrics.execution_started("f1");
        metrics.execution_started("f1");
        metrics.execution_finished("f1", "completed");
        metrics.execution_finished("f1", "timeout");
        metrics.execution_finished("f1", "running");
        metrics.retry_scheduled("f1");

        let expected = MetricsSnapshot {
            started: 2,
            completed: 1,
            timed_out: 1,
            retries: 1,
            ..MetricsSnapshot::default()
        };
        assert_eq!(metrics.snapshot(), expected);
    }
}
