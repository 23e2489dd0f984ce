/// Configuration management for the Funnelway engine
///
/// Handles server binding, execution storage and runtime knobs for the engine
/// and its worker pool. Defaults come from `FUNNELWAY_*` environment variables.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Execution store configuration
    pub storage: StorageConfig,
    /// Engine and worker configuration
    pub engine: EngineConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

/// Where execution contexts live
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite URL (e.g., "sqlite://data/funnelway.db"); `None` keeps contexts in memory
    pub database_url: Option<String>,
}

/// Runtime knobs for the execution engine and its workers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Global ceiling on RUNNING + PAUSED executions
    pub max_concurrent_executions: usize,
    /// Number of worker tasks consuming the queue
    pub workers: usize,
    /// Sleep between polls when the queue is empty
    pub poll_interval_ms: u64,
    /// Per-execution lease lifetime; a crashed worker's lease expires after this
    pub lease_ttl_ms: u64,
    /// Requeue delay for a job whose execution is leased by another worker
    pub lease_busy_delay_ms: u64,
    /// Requeue delay for a start job refused by admission control
    pub admission_delay_ms: u64,
    /// How long terminal executions are kept before the cleanup job removes them
    pub execution_retention_ms: u64,
    /// Applied to nodes that do not set `timeout_ms` themselves
    pub default_node_timeout_ms: Option<u64>,
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn lease_busy_delay(&self) -> Duration {
        Duration::from_millis(self.lease_busy_delay_ms)
    }

    pub fn admission_delay(&self) -> Duration {
        Duration::from_millis(self.admission_delay_ms)
    }

    pub fn execution_retention(&self) -> Duration {
        Duration::from_millis(self.execution_retention_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_executions: env_or("FUNNELWAY_MAX_CONCURRENT_EXECUTIONS", 100),
            workers: env_or("FUNNELWAY_WORKERS", 4),
            poll_interval_ms: 25,
            lease_ttl_ms: 30_000,
            lease_busy_delay_ms: 50,
            admission_delay_ms: 1_000,
            execution_retention_ms: 24 * 60 * 60 * 1000,
            default_node_timeout_ms: None,
        }
    }
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: std::env::var("FUNNELWAY_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env_or("FUNNELWAY_PORT", 3004),
            },
            storage: StorageConfig {
                database_url: std::env::var("FUNNELWAY_DATABASE_URL")
                    .ok()
                    .filter(|url| !url.trim().is_empty()),
            },
            engine: EngineConfig::default(),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unparseable_env_falls_back_to_default() {
        std::env::set_var("FUNNELWAY_TEST_PORT", "not-a-port");
        assert_eq!(env_or::<u16>("FUNNELWAY_TEST_PORT", 3004), 3004);
        std::env::set_var("FUNNELWAY_TEST_PORT", "8080");
        assert_eq!(env_or::<u16>("FUNNELWAY_TEST_PORT", 3004), 8080);
    }

    #[test]
    fn test_engine_durations() {
        let config = EngineConfig {
            lease_ttl_ms: 1500,
            ..EngineConfig::default()
        };
        assert_eq!(config.lease_ttl(), Duration::from_millis(1500));
    }
}
