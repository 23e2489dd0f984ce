/// Runtime Execution Engine
///
/// Queue-driven execution of funnel graphs:
/// - Execution context, status machine and audit log
/// - Condition evaluation over the variable bag
/// - Node executor contract, built-in executors and their registry
/// - The engine that runs one node job at a time
/// - Workers consuming the job queue and the cron scheduler feeding it

// Execution context, statuses, logs and errors
pub mod context;

// Condition tree evaluation
pub mod condition;

// Node executor contract and result types
pub mod executor;

// Built-in node executors
pub mod nodes;

// Node type -> executor lookup
pub mod registry;

// Job-at-a-time execution engine
pub mod engine;

// Cron and one-shot trigger scheduling
pub mod scheduler;

// Queue consumers
pub mod worker;

// Re-export main types
pub use context::{ExecutionContext, ExecutionStatus};
pub use engine::{ExecutionEngine, ExecutionOptions, JobOutcome};
pub use executor::{ActionError, ActionResult, NodeExecutor, ValidationResult};
pub use registry::ExecutorRegistry;
pub use scheduler::TriggerScheduler;
pub use worker::{Worker, WorkerPool};
