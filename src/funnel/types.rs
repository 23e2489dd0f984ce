/// Core funnel type definitions
///
/// Defines the graph handed to the engine by the authoring system: funnels,
/// typed nodes, conditional connections, triggers, declared variables and
/// per-funnel settings. All types round-trip through JSON.

use crate::queue::BackoffKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// A versioned, directed graph of nodes describing an automation sequence
///
/// Snapshots are immutable once activated; the registry shares them behind
/// `Arc` across every worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Funnel {
    /// Unique funnel identifier (e.g., "fn-onboarding")
    pub id: String,
    /// Human-readable funnel name
    #[serde(default)]
    pub name: String,
    /// Snapshot version, bumped by the authoring system on every publish
    #[serde(default = "default_version")]
    pub version: u32,
    /// Inactive funnels reject every trigger
    #[serde(default)]
    pub active: bool,
    pub nodes: Vec<FunnelNode>,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    /// Declared variables with defaults, seeded into every execution
    #[serde(default)]
    pub variables: Vec<FunnelVariable>,
    #[serde(default)]
    pub settings: FunnelSettings,
}

fn default_version() -> u32 {
    1
}

impl Funnel {
    /// Look up a node by id
    pub fn node(&self, node_id: &str) -> Option<&FunnelNode> {
        self.nodes.iter().find(|node| node.id == node_id)
    }

    /// Look up a trigger by id
    pub fn trigger(&self, trigger_id: &str) -> Option<&Trigger> {
        self.triggers.iter().find(|trigger| trigger.id == trigger_id)
    }

    /// Default variable bag built from declared variables
    pub fn default_variables(&self) -> HashMap<String, Value> {
        self.variables
            .iter()
            .map(|var| {
                (
                    var.name.clone(),
                    var.default_value.clone().unwrap_or(Value::Null),
                )
            })
            .collect()
    }
}

/// A typed step in a funnel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunnelNode {
    /// Unique node identifier within the funnel (e.g., "welcome-email")
    pub id: String,
    /// Node kind, used to resolve the executor
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub name: String,
    /// Editor coordinates; the engine never reads them
    #[serde(default)]
    pub position: Option<Position>,
    /// Kind-specific configuration
    #[serde(default)]
    pub config: Value,
    /// Outgoing connections in declaration order
    #[serde(default)]
    pub connections: Vec<Connection>,
}

impl FunnelNode {
    pub fn new(id: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            node_type,
            position: None,
            config: Value::Null,
            connections: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    /// Append an unconditional connection to `target`
    pub fn connect(mut self, target: impl Into<String>) -> Self {
        let connection = Connection::new(self.id.clone(), target);
        self.connections.push(connection);
        self
    }

    /// Append a fully specified connection; its source is forced to this node
    pub fn with_connection(mut self, mut connection: Connection) -> Self {
        connection.source = self.id.clone();
        self.connections.push(connection);
        self
    }

    /// Optional per-node execution timeout from config
    pub fn timeout_ms(&self) -> Option<u64> {
        self.config.get("timeout_ms").and_then(Value::as_u64)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// Node kinds understood by the engine
///
/// Any type string that is not a built-in kind deserializes into `Custom`, so
/// that an unknown type reaches the executor registry and fails there as a
/// structural error instead of failing JSON parsing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// Entry point bound to a trigger
    Trigger,
    /// Deliver a rendered message through a channel
    Message,
    /// Pick a connection from a boolean condition
    Condition,
    /// Suspend for a fixed duration
    Delay,
    /// Suspend until a point in time
    Wait,
    /// Mutate variables or call an external endpoint
    Action,
    /// Exclusive or parallel branching
    Branch,
    /// Join parallel paths
    Merge,
    End,
    Exit,
    #[serde(untagged)]
    Custom(String),
}

impl NodeType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Trigger => "trigger",
            Self::Message => "message",
            Self::Condition => "condition",
            Self::Delay => "delay",
            Self::Wait => "wait",
            Self::Action => "action",
            Self::Branch => "branch",
            Self::Merge => "merge",
            Self::End => "end",
            Self::Exit => "exit",
            Self::Custom(name) => name,
        }
    }

    /// END and EXIT close the path that reaches them
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::End | Self::Exit)
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Directed edge between two nodes of the same funnel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    #[serde(default)]
    pub id: Option<String>,
    pub source: String,
    pub target: String,
    /// Edge is only followed when this evaluates true
    #[serde(default)]
    pub condition: Option<Condition>,
    /// Free-form label; CONDITION nodes route on "true"/"false"
    #[serde(default)]
    pub label: Option<String>,
    /// Higher weight is considered first when several edges qualify
    #[serde(default)]
    pub weight: i32,
    /// Fallback edge when no conditional edge qualifies
    #[serde(default)]
    pub is_default: bool,
}

impl Connection {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: None,
            source: source.into(),
            target: target.into(),
            condition: None,
            label: None,
            weight: 0,
            is_default: false,
        }
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn labelled(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn weighted(mut self, weight: i32) -> Self {
        self.weight = weight;
        self
    }

    /// Unconditional edges and explicit defaults act as fallbacks
    pub fn is_fallback(&self) -> bool {
        self.is_default || self.condition.is_none()
    }
}

/// Condition tree: either a leaf comparison or a logical combination of children
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Condition {
    /// Variable path, e.g. "score", "variables.score" or "$.trigger_payload.data.plan"
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub operator: Option<ConditionOperator>,
    #[serde(default)]
    pub value: Option<Value>,
    /// Combinator applied to `children` (AND when omitted)
    #[serde(default)]
    pub logic: Option<LogicalOperator>,
    #[serde(default)]
    pub children: Vec<Condition>,
}

impl Condition {
    pub fn leaf(field: impl Into<String>, operator: ConditionOperator, value: Value) -> Self {
        Self {
            field: Some(field.into()),
            operator: Some(operator),
            value: Some(value),
            ..Self::default()
        }
    }

    pub fn all(children: Vec<Condition>) -> Self {
        Self::combine(LogicalOperator::And, children)
    }

    pub fn any(children: Vec<Condition>) -> Self {
        Self::combine(LogicalOperator::Or, children)
    }

    pub fn not(child: Condition) -> Self {
        Self::combine(LogicalOperator::Not, vec![child])
    }

    fn combine(logic: LogicalOperator, children: Vec<Condition>) -> Self {
        Self {
            logic: Some(logic),
            children,
            ..Self::default()
        }
    }
}

/// Closed operator set for leaf conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    #[serde(alias = "eq")]
    Equals,
    #[serde(alias = "ne")]
    NotEquals,
    #[serde(alias = "gt")]
    GreaterThan,
    #[serde(alias = "lt")]
    LessThan,
    #[serde(alias = "gte")]
    GreaterThanOrEqual,
    #[serde(alias = "lte")]
    LessThanOrEqual,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    In,
    NotIn,
    Exists,
    NotExists,
    IsEmpty,
    #[serde(alias = "not_empty")]
    IsNotEmpty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalOperator {
    And,
    Or,
    Not,
}

/// External event source bound to a funnel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub id: String,
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,
    pub funnel_id: String,
    #[serde(default)]
    pub active: bool,
    /// Explicit entry node; resolved from TRIGGER nodes when omitted
    #[serde(default)]
    pub entry_node_id: Option<String>,
    /// Kind-specific configuration (cron expression, webhook path, event name)
    #[serde(default)]
    pub config: Value,
}

impl Trigger {
    pub fn new(id: impl Into<String>, trigger_type: TriggerType, funnel_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            trigger_type,
            funnel_id: funnel_id.into(),
            active: false,
            entry_node_id: None,
            config: Value::Null,
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    Webhook,
    Schedule,
    Event,
    ConditionMet,
    UserAction,
    TimeBased,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Webhook => "webhook",
            Self::Schedule => "schedule",
            Self::Event => "event",
            Self::ConditionMet => "condition_met",
            Self::UserAction => "user_action",
            Self::TimeBased => "time_based",
        }
    }
}

/// Declared funnel variable
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunnelVariable {
    pub name: String,
    #[serde(rename = "type", default)]
    pub var_type: VariableType,
    #[serde(default)]
    pub default_value: Option<Value>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    #[default]
    Any,
}

impl VariableType {
    /// Null is accepted for every type (unset variable)
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) | (Self::Any, _) => true,
            (Self::String, Value::String(_)) => true,
            (Self::Number, Value::Number(_)) => true,
            (Self::Boolean, Value::Bool(_)) => true,
            (Self::Object, Value::Object(_)) => true,
            (Self::Array, Value::Array(_)) => true,
            _ => false,
        }
    }
}

/// Per-funnel execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FunnelSettings {
    /// Executions running longer than this end in TIMEOUT
    pub max_execution_time_ms: u64,
    /// Upper bound on retries of any single node job
    pub max_retry_attempts: u32,
    /// Base delay between retries
    pub retry_delay_ms: u64,
    pub retry_backoff: BackoffKind,
    /// When false, at most one execution of this funnel runs at a time
    pub allow_parallel_executions: bool,
    pub max_concurrent_executions: Option<u32>,
}

impl Default for FunnelSettings {
    fn default() -> Self {
        Self {
            max_execution_time_ms: 7 * 24 * 60 * 60 * 1000,
            max_retry_attempts: 3,
            retry_delay_ms: 1000,
            retry_backoff: BackoffKind::Exponential,
            allow_parallel_executions: true,
            max_concurrent_executions: None,
        }
    }
}

impl FunnelSettings {
    /// Effective per-funnel concurrency cap, if any
    pub fn concurrency_limit(&self) -> Option<usize> {
        if !self.allow_parallel_executions {
            return Some(1);
        }
        self.max_concurrent_executions.map(|limit| limit as usize)
    }
}

/// Inbound webhook body, copied verbatim into the execution's variable bag
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl WebhookPayload {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            id: Some(uuid::Uuid::new_v4().to_string()),
            event: Some(event.into()),
            data,
            timestamp: Utc::now(),
            source: None,
            headers: HashMap::new(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_node_type_parses_builtin_and_custom_kinds() {
        let builtin: NodeType = serde_json::from_value(json!("merge")).unwrap();
        assert_eq!(builtin, NodeType::Merge);

        let custom: NodeType = serde_json::from_value(json!("sms_blast")).unwrap();
        assert_eq!(custom, NodeType::Custom("sms_blast".to_string()));
        assert_eq!(serde_json::to_value(&custom).unwrap(), json!("sms_blast"));
    }

    #[test]
    fn test_funnel_deserializes_with_defaults() {
        let funnel: Funnel = serde_json::from_value(json!({
            "id": "f1",
            "nodes": [
                {"id": "t", "type": "trigger", "connections": [{"source": "t", "target": "e"}]},
                {"id": "e", "type": "end"}
            ]
        }))
        .unwrap();

        assert_eq!(funnel.version, 1);
        assert!(!funnel.active);
        assert_eq!(funnel.settings.max_retry_attempts, 3);
        assert_eq!(funnel.node("t").unwrap().connections[0].target, "e");
    }

    #[test]
    fn test_operator_aliases() {
        let condition: Condition = serde_json::from_value(json!({
            "field": "score", "operator": "gt", "value": 50
        }))
        .unwrap();
        assert_eq!(condition.operator, Some(ConditionOperator::GreaterThan));
    }

    #[test]
    fn test_concurrency_limit_honours_parallel_flag() {
        let mut settings = FunnelSettings::default();
        assert_eq!(settings.concurrency_limit(), None);

        settings.max_concurrent_executions = Some(5);
        assert_eq!(settings.concurrency_limit(), Some(5));

        settings.allow_parallel_executions = false;
        assert_eq!(settings.concurrency_limit(), Some(1));
    }

    #[test]
    fn test_variable_type_acceptance() {
        assert!(VariableType::Number.accepts(&json!(3)));
        assert!(VariableType::Number.accepts(&Value::Null));
        assert!(!VariableType::Number.accepts(&json!("3")));
        assert!(VariableType::Any.accepts(&json!({"a": 1})));
    }
}
