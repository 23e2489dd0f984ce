/// Funnelway: queue-driven execution engine for marketing and sales funnels
///
/// Funnels are directed graphs of typed nodes started by triggers. Every node
/// of every execution runs as its own queued job, so long waits, retries and
/// parallel branches never hold a worker.

// Core configuration and setup
pub mod config;

// Error taxonomy shared across layers
pub mod error;

// Engine counters
pub mod metrics;

// Funnel definitions and the hot-swappable registry of compiled snapshots
pub mod funnel;

// Job queue contract and in-memory broker
pub mod queue;

// Execution context persistence and leases
pub mod store;

// Runtime: engine, executors, workers, scheduler
pub mod runtime;

// Trigger activation and firing
pub mod trigger;

// HTTP API layer - funnels, executions, triggers and webhook intake
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use funnel::{Funnel, FunnelNode, FunnelRegistry, NodeType, Trigger, TriggerType};
pub use runtime::{ExecutionContext, ExecutionEngine, ExecutionStatus};
pub use server::start_server;
pub use trigger::TriggerManager;
