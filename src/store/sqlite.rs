/// SQLite persistence layer for execution contexts
///
/// Contexts are stored as a JSON document next to indexed `funnel_id` and
/// `status` columns. Leases live in their own table so several processes
/// sharing one database file keep the single-writer discipline.

use crate::runtime::context::{ExecutionContext, ExecutionStatus};
use crate::store::ExecutionStore;
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;

/// Status values the terminal guard refuses to overwrite
const TERMINAL_STATUSES: &str = "('completed', 'failed', 'cancelled', 'timeout')";

/// Status values counted against concurrency ceilings
const ACTIVE_STATUSES: &str = "('running', 'paused')";

/// Lease ownership check shared by fenced writes; binds execution id then owner
const LEASE_HELD: &str =
    "EXISTS (SELECT 1 FROM execution_leases WHERE execution_id = ? AND owner = ?)";

#[derive(Debug, Clone)]
pub struct SqliteExecutionStore {
    pool: SqlitePool,
}

impl SqliteExecutionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) the database at `url` and initialize the schema
    pub async fn connect(url: &str) -> Result<Self> {
        tracing::info!("🗄️ Opening execution store: {}", url);

        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| anyhow::anyhow!("Invalid database URL '{}': {}", url, e))?
            .create_if_missing(true);
        let pool = if url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .connect_with(options)
                .await?
        } else {
            SqlitePool::connect_with(options).await?
        };

        let store = Self::new(pool);
        store.init_schema().await?;
        Ok(store)
    }

    /// Create tables and indexes; safe to call repeatedly
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                funnel_id TEXT NOT NULL,
                status TEXT NOT NULL,
                context JSON NOT NULL,
                revision INTEGER NOT NULL DEFAULT 0,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_executions_funnel_status
            ON executions(funnel_id, status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS execution_leases (
                execution_id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn decode(row: &sqlx::sqlite::SqliteRow) -> Result<ExecutionContext> {
        let document: String = row.get("context");
        Ok(serde_json::from_str(&document)?)
    }
}

#[async_trait]
impl ExecutionStore for SqliteExecutionStore {
    async fn insert(&self, context: &ExecutionContext) -> Result<()> {
        let document = serde_json::to_string(context)?;
        sqlx::query(
            r#"
            INSERT INTO executions (id, funnel_id, status, context)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&context.id)
        .bind(&context.funnel_id)
        .bind(context.status.as_str())
        .bind(&document)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to insert execution {}: {}", context.id, e))?;
        Ok(())
    }

    async fn save(&self, context: &ExecutionContext, lease_owner: &str) -> Result<bool> {
        let document = serde_json::to_string(context)?;
        let sql = format!(
            r#"
            UPDATE executions
            SET status = ?, context = ?, revision = revision + 1, updated_at = CURRENT_TIMESTAMP
            WHERE id = ? AND status NOT IN {} AND {}
            "#,
            TERMINAL_STATUSES, LEASE_HELD
        );
        let result = sqlx::query(&sql)
            .bind(context.status.as_str())
            .bind(&document)
            .bind(&context.id)
            .bind(&context.id)
            .bind(lease_owner)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update(
        &self,
        execution_id: &str,
        apply: &(dyn for<'c> Fn(&'c mut ExecutionContext) -> bool + Send + Sync),
    ) -> Result<Option<ExecutionContext>> {
        // Compare-and-swap on the revision; a concurrent writer forces a re-read
        loop {
            let row = sqlx::query("SELECT context, revision FROM executions WHERE id = ?")
                .bind(execution_id)
                .fetch_optional(&self.pool)
                .await?;
            let Some(row) = row else {
                return Ok(None);
            };
            let revision: i64 = row.get("revision");
            let mut context = Self::decode(&row)?;
            if context.status.is_terminal() || !apply(&mut context) {
                return Ok(None);
            }

            let document = serde_json::to_string(&context)?;
            let result = sqlx::query(
                r#"
                UPDATE executions
                SET status = ?, context = ?, revision = revision + 1, updated_at = CURRENT_TIMESTAMP
                WHERE id = ? AND revision = ?
                "#,
            )
            .bind(context.status.as_str())
            .bind(&document)
            .bind(execution_id)
            .bind(revision)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() > 0 {
                return Ok(Some(context));
            }
            tracing::debug!("🔁 Execution {} changed underneath an update, retrying", execution_id);
        }
    }

    async fn try_admit(
        &self,
        context: &ExecutionContext,
        lease_owner: &str,
        funnel_limit: Option<usize>,
        global_limit: usize,
    ) -> Result<bool> {
        let document = serde_json::to_string(context)?;
        let sql = format!(
            r#"
            UPDATE executions
            SET status = ?, context = ?, revision = revision + 1, updated_at = CURRENT_TIMESTAMP
            WHERE id = ? AND status = ? AND {lease}
              AND (SELECT COUNT(*) FROM executions WHERE status IN {active}) < ?
              AND (SELECT COUNT(*) FROM executions WHERE status IN {active} AND funnel_id = ?) < ?
            "#,
            lease = LEASE_HELD,
            active = ACTIVE_STATUSES
        );
        let funnel_limit = funnel_limit.map(|limit| limit as i64).unwrap_or(i64::MAX);
        let result = sqlx::query(&sql)
            .bind(context.status.as_str())
            .bind(&document)
            .bind(&context.id)
            .bind(ExecutionStatus::Pending.as_str())
            .bind(&context.id)
            .bind(lease_owner)
            .bind(global_limit as i64)
            .bind(&context.funnel_id)
            .bind(funnel_limit)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, execution_id: &str) -> Result<Option<ExecutionContext>> {
        let row = sqlx::query("SELECT context FROM executions WHERE id = ?")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::decode).transpose()
    }

    async fn list_active(&self) -> Result<Vec<ExecutionContext>> {
        let sql = format!(
            "SELECT context FROM executions WHERE status NOT IN {} ORDER BY created_at",
            TERMINAL_STATUSES
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(Self::decode).collect()
    }

    async fn count_active(&self, funnel_id: Option<&str>) -> Result<usize> {
        let row = match funnel_id {
            Some(funnel_id) => {
                let sql = format!(
                    "SELECT COUNT(*) AS n FROM executions WHERE status IN {} AND funnel_id = ?",
                    ACTIVE_STATUSES
                );
                sqlx::query(&sql).bind(funnel_id).fetch_one(&self.pool).await?
            }
            None => {
                let sql = format!("SELECT COUNT(*) AS n FROM executions WHERE status IN {}", ACTIVE_STATUSES);
                sqlx::query(&sql).fetch_one(&self.pool).await?
            }
        };
        let count: i64 = row.get("n");
        Ok(count as usize)
    }

    async fn delete(&self, execution_id: &str) -> Result<bool> {
        sqlx::query("DELETE FROM execution_leases WHERE execution_id = ?")
            .bind(execution_id)
            .execute(&self.pool)
            .await?;
        let result = sqlx::query("DELETE FROM executions WHERE id = ?")
            .bind(execution_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn try_acquire_lease(&self, execution_id: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let expires_at = now + ttl.as_millis() as i64;

        let result = sqlx::query(
            r#"
            INSERT INTO execution_leases (execution_id, owner, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT(execution_id) DO UPDATE SET
                owner = excluded.owner,
                expires_at = excluded.expires_at
            WHERE execution_leases.owner = excluded.owner
               OR execution_leases.expires_at <= ?
            "#,
        )
        .bind(execution_id)
        .bind(owner)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_lease(&self, execution_id: &str, owner: &str) -> Result<()> {
        sqlx::query("DELETE FROM execution_leases WHERE execution_id = ? AND owner = ?")
            .bind(execution_id)
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funnel::Funnel;
    use crate::runtime::context::ExecutionMetadata;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::HashMap;

    async fn store() -> SqliteExecutionStore {
        SqliteExecutionStore::connect("sqlite::memory:").await.unwrap()
    }

    fn context() -> ExecutionContext {
        let funnel: Funnel = serde_json::from_value(json!({"id": "f1", "nodes": []})).unwrap();
        let variables = HashMap::from([("name".to_string(), json!("Ana"))]);
        ExecutionContext::new(&funnel, "t1", variables, ExecutionMetadata::default())
    }

    #[tokio::test]
    async fn test_context_round_trips_through_json_column() {
        let store = store().await;
        let mut fixture = context();
        store.insert(&fixture).await.unwrap();
        store.try_acquire_lease(&fixture.id, "worker-1", Duration::from_secs(5)).await.unwrap();

        fixture.transition(ExecutionStatus::Running);
        fixture.current_node_id = Some("msg".into());
        assert!(store.save(&fixture, "worker-1").await.unwrap());
        assert!(!store.save(&fixture, "worker-2").await.unwrap());

        let actual = store.get(&fixture.id).await.unwrap().unwrap();
        assert_eq!(actual.status, ExecutionStatus::Running);
        assert_eq!(actual.current_node_id.as_deref(), Some("msg"));
        assert_eq!(actual.variables["name"], json!("Ana"));
        assert_eq!(store.count_active(Some("f1")).await.unwrap(), 1);
        assert_eq!(store.count_active(Some("f2")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_terminal_guard() {
        let store = store().await;
        let mut fixture = context();
        store.insert(&fixture).await.unwrap();
        store.try_acquire_lease(&fixture.id, "worker-1", Duration::from_secs(5)).await.unwrap();

        let cancelled = store
            .update(&fixture.id, &|stored| stored.transition(ExecutionStatus::Cancelled))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
        assert!(store.update(&fixture.id, &|_| true).await.unwrap().is_none());

        fixture.transition(ExecutionStatus::Running);
        assert!(!store.save(&fixture, "worker-1").await.unwrap());
        assert!(store.list_active().await.unwrap().is_empty());

        assert!(store.delete(&fixture.id).await.unwrap());
        assert!(store.get(&fixture.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_try_admit_counts_and_writes_in_one_statement() {
        let store = store().await;
        let ttl = Duration::from_secs(5);
        let first = context();
        let second = context();
        for fixture in [&first, &second] {
            store.insert(fixture).await.unwrap();
            store.try_acquire_lease(&fixture.id, "worker-1", ttl).await.unwrap();
        }

        let mut running = first.clone();
        running.transition(ExecutionStatus::Running);
        assert!(store.try_admit(&running, "worker-1", Some(1), 10).await.unwrap());

        let mut blocked = second.clone();
        blocked.transition(ExecutionStatus::Running);
        assert!(!store.try_admit(&blocked, "worker-1", Some(1), 10).await.unwrap());
        assert!(!store.try_admit(&blocked, "worker-1", None, 1).await.unwrap());
        assert!(store.try_admit(&blocked, "worker-1", None, 2).await.unwrap());
        assert_eq!(store.count_active(Some("f1")).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_leases() {
        let store = store().await;
        let ttl = Duration::from_millis(50);

        assert!(store.try_acquire_lease("e1", "worker-1", ttl).await.unwrap());
        assert!(!store.try_acquire_lease("e1", "worker-2", ttl).await.unwrap());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(store.try_acquire_lease("e1", "worker-2", ttl).await.unwrap());

        store.release_lease("e1", "worker-2").await.unwrap();
        assert!(store.try_acquire_lease("e1", "worker-3", ttl).await.unwrap());
    }
}
