/// Execution state
///
/// An `ExecutionContext` is the unit of observability: its status, variable
/// bag, append-only log and error list are enough to reconstruct which nodes
/// ran, in which order and with which outcome.

use crate::funnel::Funnel;
use crate::queue::JobPriority;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Execution lifecycle
///
/// PENDING -> RUNNING -> (PAUSED <-> RUNNING) -> COMPLETED | FAILED | CANCELLED | TIMEOUT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout
        )
    }

    /// Counted against concurrency limits
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        match (self, next) {
            (Pending, Running | Failed | Cancelled | Timeout) => true,
            (Running, Paused | Completed | Failed | Cancelled | Timeout) => true,
            (Paused, Running | Failed | Cancelled | Timeout) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "timeout" => Some(Self::Timeout),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// What a log entry records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    Lifecycle,
    NodeEntered,
    NodeCompleted,
    NodeFailed,
    Routed,
    Suspended,
    Resumed,
    Retrying,
    MergeWaiting,
    Variables,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub event: LogEvent,
    #[serde(default)]
    pub node_id: Option<String>,
    pub message: String,
}

/// Error classes recorded on an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Unknown node type, dead-end routing, malformed graph
    Structural,
    /// Retryable runtime failure
    Transient,
    /// Non-retryable runtime failure
    Runtime,
    /// Node configuration rejected
    Validation,
    /// A transient failure that ran out of retries
    RetryExhausted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionError {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub node_id: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
    pub is_retryable: bool,
    /// Delivery attempt that produced the error (1-based)
    pub attempt: u32,
}

impl ExecutionError {
    pub fn new(kind: ErrorKind, node_id: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            node_id: node_id.map(str::to_string),
            kind,
            message: message.into(),
            is_retryable: kind == ErrorKind::Transient,
            attempt: 1,
        }
    }

    pub fn structural(node_id: Option<&str>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Structural, node_id, message)
    }

    pub fn at_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }
}

/// Origin and scheduling metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    /// e.g. "webhook", "schedule", "manual", "api"
    pub source: String,
    pub priority: JobPriority,
    #[serde(default)]
    pub parent_execution_id: Option<String>,
    #[serde(default)]
    pub child_execution_ids: Vec<String>,
}

impl Default for ExecutionMetadata {
    fn default() -> Self {
        Self {
            source: "api".to_string(),
            priority: JobPriority::Normal,
            parent_execution_id: None,
            child_execution_ids: Vec::new(),
        }
    }
}

/// Traversal bookkeeping used by the engine between jobs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraversalState {
    /// Next dispatch sequence number
    pub next_step: u64,
    /// Paths with a queued or running job
    pub open_paths: u32,
    /// Open paths currently suspended in a delay
    pub suspended_paths: u32,
    /// Steps already carried out, for duplicate deliveries
    pub completed_steps: HashSet<u64>,
    /// Merge node id -> predecessor ids that have arrived
    pub merge_arrivals: HashMap<String, BTreeSet<String>>,
    /// Merge node id -> step whose arrival fired it
    pub fired_merges: HashMap<String, u64>,
}

/// One run of a funnel from a trigger occurrence to a terminal state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub id: String,
    pub funnel_id: String,
    pub funnel_version: u32,
    pub trigger_id: String,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub current_node_id: Option<String>,
    pub variables: HashMap<String, Value>,
    pub logs: Vec<ExecutionLog>,
    pub errors: Vec<ExecutionError>,
    pub metadata: ExecutionMetadata,
    #[serde(default)]
    pub traversal: TraversalState,
}

impl ExecutionContext {
    /// Create a PENDING execution seeded from the funnel's declared defaults
    /// overlaid with the caller's variables
    pub fn new(
        funnel: &Funnel,
        trigger_id: impl Into<String>,
        variables: HashMap<String, Value>,
        metadata: ExecutionMetadata,
    ) -> Self {
        let mut bag = funnel.default_variables();
        bag.extend(variables);

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            funnel_id: funnel.id.clone(),
            funnel_version: funnel.version,
            trigger_id: trigger_id.into(),
            status: ExecutionStatus::Pending,
            start_time: Utc::now(),
            end_time: None,
            current_node_id: None,
            variables: bag,
            logs: Vec::new(),
            errors: Vec::new(),
            metadata,
            traversal: TraversalState::default(),
        }
    }

    /// Move along the state machine; invalid transitions are refused
    pub fn transition(&mut self, next: ExecutionStatus) -> bool {
        if self.status == next {
            return true;
        }
        if !self.status.can_transition_to(next) {
            tracing::warn!(
                "⚠️ Refused transition {} -> {} for execution {}",
                self.status.as_str(),
                next.as_str(),
                self.id
            );
            return false;
        }

        self.status = next;
        if next.is_terminal() {
            self.end_time = Some(Utc::now());
        }
        true
    }

    pub fn log(
        &mut self,
        level: LogLevel,
        event: LogEvent,
        node_id: Option<&str>,
        message: impl Into<String>,
    ) {
        self.logs.push(ExecutionLog {
            timestamp: Utc::now(),
            level,
            event,
            node_id: node_id.map(str::to_string),
            message: message.into(),
        });
    }

    pub fn record_error(&mut self, error: ExecutionError) {
        self.errors.push(error);
    }

    /// Reserve the next dispatch step number
    pub fn allocate_step(&mut self) -> u64 {
        let step = self.traversal.next_step;
        self.traversal.next_step += 1;
        step
    }

    pub fn elapsed_ms(&self, now: DateTime<Utc>) -> i64 {
        (now - self.start_time).num_milliseconds()
    }

    pub fn is_timed_out(&self, max_execution_time_ms: u64, now: DateTime<Utc>) -> bool {
        self.elapsed_ms(now) > max_execution_time_ms as i64
    }

    /// Node ids in the order they were entered
    pub fn node_visits(&self) -> Vec<&str> {
        self.logs
            .iter()
            .filter(|entry| entry.event == LogEvent::NodeEntered)
            .filter_map(|entry| entry.node_id.as_deref())
            .collect()
    }

    /// Variable bag as a JSON object, the root for condition lookups
    pub fn variables_json(&self) -> Value {
        Value::Object(
            self.variables
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funnel::{FunnelNode, FunnelVariable, NodeType, VariableType};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn funnel() -> Funnel {
        Funnel {
            id: "f1".into(),
            name: "Test".into(),
            version: 2,
            active: true,
            nodes: vec![FunnelNode::new("end", NodeType::End)],
            triggers: Vec::new(),
            variables: vec![
                FunnelVariable {
                    name: "plan".into(),
                    var_type: VariableType::String,
                    default_value: Some(json!("free")),
                    description: None,
                },
                FunnelVariable {
                    name: "score".into(),
                    var_type: VariableType::Number,
                    default_value: Some(json!(0)),
                    description: None,
                },
            ],
            settings: Default::default(),
        }
    }

    #[test]
    fn test_new_context_overlays_caller_variables_on_defaults() {
        let variables = HashMap::from([("score".to_string(), json!(80))]);
        let actual = ExecutionContext::new(&funnel(), "t1", variables, ExecutionMetadata::default());

        assert_eq!(actual.status, ExecutionStatus::Pending);
        assert_eq!(actual.funnel_version, 2);
        assert_eq!(actual.variables["plan"], json!("free"));
        assert_eq!(actual.variables["score"], json!(80));
    }

    #[test]
    fn test_terminal_states_never_return_to_running() {
        let mut fixture =
            ExecutionContext::new(&funnel(), "t1", HashMap::new(), ExecutionMetadata::default());

        assert!(fixture.transition(ExecutionStatus::Running));
        assert!(fixture.transition(ExecutionStatus::Paused));
        assert!(fixture.transition(ExecutionStatus::Running));
        assert!(fixture.transition(ExecutionStatus::Cancelled));
        assert!(fixture.end_time.is_some());

        assert!(!fixture.transition(ExecutionStatus::Running));
        assert_eq!(fixture.status, ExecutionStatus::Cancelled);
    }

    #[test]
    fn test_pending_cannot_pause_or_complete() {
        assert!(!ExecutionStatus::Pending.can_transition_to(ExecutionStatus::Paused));
        assert!(!ExecutionStatus::Pending.can_transition_to(ExecutionStatus::Completed));
        assert!(!ExecutionStatus::Paused.can_transition_to(ExecutionStatus::Completed));
    }

    #[test]
    fn test_node_visits_follow_log_order() {
        let mut fixture =
            ExecutionContext::new(&funnel(), "t1", HashMap::new(), ExecutionMetadata::default());
        fixture.log(LogLevel::Info, LogEvent::Lifecycle, None, "started");
        fixture.log(LogLevel::Info, LogEvent::NodeEntered, Some("a"), "enter a");
        fixture.log(LogLevel::Info, LogEvent::NodeCompleted, Some("a"), "done a");
        fixture.log(LogLevel::Info, LogEvent::NodeEntered, Some("b"), "enter b");

        assert_eq!(fixture.node_visits(), vec!["a", "b"]);
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in [
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::Paused,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Cancelled,
            ExecutionStatus::Timeout,
        ] {
            assert_eq!(ExecutionStatus::parse(status.as_str()), Some(status));
        }
    }
}
