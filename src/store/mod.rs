/// Execution Store Layer
///
/// Repository for execution contexts and per-execution leases. The engine only
/// talks to the `ExecutionStore` trait, so contexts can live in memory or in
/// SQLite without changing traversal logic.

// HashMap-backed store for tests and single-process deployments
pub mod memory;

// SQLite-backed store (sqlx)
pub mod sqlite;

use crate::runtime::context::ExecutionContext;
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

pub use memory::MemoryExecutionStore;
pub use sqlite::SqliteExecutionStore;

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Store a new context; fails if the id already exists
    async fn insert(&self, context: &ExecutionContext) -> Result<()>;

    /// Overwrite a stored context on behalf of the lease holder
    ///
    /// Returns false, writing nothing, when `lease_owner` no longer holds the
    /// execution's lease, the stored context is already terminal, or it no
    /// longer exists.
    async fn save(&self, context: &ExecutionContext, lease_owner: &str) -> Result<bool>;

    /// Read, modify and write a stored context as one atomic step
    ///
    /// `apply` sees the current stored context and returns false to leave it
    /// untouched. Missing and terminal contexts are never handed to `apply`.
    /// Returns the context as written.
    async fn update(
        &self,
        execution_id: &str,
        apply: &(dyn for<'c> Fn(&'c mut ExecutionContext) -> bool + Send + Sync),
    ) -> Result<Option<ExecutionContext>>;

    /// Write an admitted context if the concurrency ceilings still allow it
    ///
    /// The stored context must be PENDING and leased to `lease_owner`. Counting
    /// RUNNING + PAUSED executions and writing `context` happen atomically, so
    /// two workers admitting at once cannot both take the last slot.
    async fn try_admit(
        &self,
        context: &ExecutionContext,
        lease_owner: &str,
        funnel_limit: Option<usize>,
        global_limit: usize,
    ) -> Result<bool>;

    async fn get(&self, execution_id: &str) -> Result<Option<ExecutionContext>>;

    /// Every non-terminal context
    async fn list_active(&self) -> Result<Vec<ExecutionContext>>;

    /// RUNNING + PAUSED contexts, optionally restricted to one funnel
    async fn count_active(&self, funnel_id: Option<&str>) -> Result<usize>;

    async fn delete(&self, execution_id: &str) -> Result<bool>;

    /// Take the single-writer lease on an execution
    ///
    /// Succeeds when the lease is free, expired, or already held by `owner`.
    async fn try_acquire_lease(&self, execution_id: &str, owner: &str, ttl: Duration) -> Result<bool>;

    /// Release a lease held by `owner`; no-op otherwise
    async fn release_lease(&self, execution_id: &str, owner: &str) -> Result<()>;
}
