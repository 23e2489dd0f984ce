/// Node executor contract
///
/// Every node kind is run by a `NodeExecutor`: `execute` performs the node's
/// work against a read-only view of the execution and reports what happened in
/// an `ActionResult`; `validate` checks a node's configuration once, when the
/// funnel is activated.

use crate::error::NodeError;
use crate::funnel::FunnelNode;
use crate::runtime::context::ExecutionContext;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Outcome of executing a single node
///
/// Routing precedence used by the engine: `delay` suspends the path,
/// `should_continue == false` closes it, `fan_out` dispatches several targets,
/// `next_node_id` dispatches one, otherwise outgoing connections decide.
#[derive(Debug, Clone)]
pub struct ActionResult {
    pub success: bool,
    /// Node output, recorded in the execution log at debug level
    pub data: Option<Value>,
    pub error: Option<ActionError>,
    /// Explicit next node (CONDITION/BRANCH)
    pub next_node_id: Option<String>,
    /// Explicit parallel targets (parallel BRANCH)
    pub fan_out: Option<Vec<String>>,
    pub should_continue: bool,
    /// Merged into the execution's variable bag on success
    pub variable_updates: HashMap<String, Value>,
    /// Suspend the path for this long before routing onward
    pub delay: Option<Duration>,
}

impl ActionResult {
    /// Success; let outgoing connections pick the next node
    pub fn proceed() -> Self {
        Self {
            success: true,
            data: None,
            error: None,
            next_node_id: None,
            fan_out: None,
            should_continue: true,
            variable_updates: HashMap::new(),
            delay: None,
        }
    }

    pub fn goto(node_id: impl Into<String>) -> Self {
        Self {
            next_node_id: Some(node_id.into()),
            ..Self::proceed()
        }
    }

    pub fn fan_out(targets: Vec<String>) -> Self {
        Self {
            fan_out: Some(targets),
            ..Self::proceed()
        }
    }

    /// Success that closes the current path
    pub fn stop() -> Self {
        Self {
            should_continue: false,
            ..Self::proceed()
        }
    }

    pub fn suspend(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::proceed()
        }
    }

    pub fn failure(error: ActionError) -> Self {
        Self {
            success: false,
            error: Some(error),
            should_continue: false,
            ..Self::proceed()
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: Value) -> Self {
        self.variable_updates.insert(key.into(), value);
        self
    }
}

/// Failure reported through `ActionResult` rather than `Err`
#[derive(Debug, Clone, Serialize)]
pub struct ActionError {
    pub message: String,
    /// Declared retryability; unspecified means not retryable
    pub retryable: Option<bool>,
}

impl ActionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: None,
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: Some(true),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable.unwrap_or(false)
    }
}

/// Configuration check result
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.is_valid = false;
        self.errors.push(message.into());
    }

    pub fn warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

/// Runs one node kind
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Run the node. The context is a snapshot; changes flow back only through
    /// `ActionResult::variable_updates`.
    async fn execute(
        &self,
        node: &FunnelNode,
        context: &ExecutionContext,
    ) -> Result<ActionResult, NodeError>;

    /// Check the node's configuration at activation time
    fn validate(&self, _config: &Value) -> ValidationResult {
        ValidationResult::ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_action_error_defaults_to_non_retryable() {
        assert!(!ActionError::new("boom").is_retryable());
        assert!(ActionError::retryable("503").is_retryable());
    }

    #[test]
    fn test_result_builders() {
        let result = ActionResult::goto("next").with_variable("seen", json!(true));
        assert!(result.success);
        assert_eq!(result.next_node_id.as_deref(), Some("next"));
        assert_eq!(result.variable_updates["seen"], json!(true));

        let stopped = ActionResult::stop();
        assert!(stopped.success && !stopped.should_continue);

        let failed = ActionResult::failure(ActionError::new("nope"));
        assert!(!failed.success);
    }

    #[test]
    fn test_validation_result_tracks_validity() {
        let mut result = ValidationResult::ok();
        result.warning("unused field");
        assert!(result.is_valid);

        result.error("missing template");
        assert!(!result.is_valid);
        assert_eq!(result.errors, vec!["missing template".to_string()]);
    }
}
