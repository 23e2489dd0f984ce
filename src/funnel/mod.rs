/// Funnel Definition Layer
///
/// Funnel snapshots handed over by the authoring system, and the registry that
/// activates, compiles and hot-swaps them.

// Core type definitions
pub mod types;

// Lock-free registry of compiled funnel snapshots
pub mod registry;

pub use registry::{ActivationReport, CompiledFunnel, FunnelRegistry};
pub use types::{
    Condition, ConditionOperator, Connection, Funnel, FunnelNode, FunnelSettings, FunnelVariable,
    LogicalOperator, NodeType, Position, Trigger, TriggerType, VariableType, WebhookPayload,
};
