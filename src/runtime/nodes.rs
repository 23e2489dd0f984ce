/// Built-in node executors
///
/// One executor per built-in node kind:
/// - TRIGGER / MERGE: pass-through (the engine owns entry and join semantics)
/// - MESSAGE: render a template and hand it to a `MessageChannel`
/// - CONDITION / BRANCH: choose the next node explicitly
/// - DELAY / WAIT: ask the engine to suspend the path
/// - ACTION: variable mutations and outbound HTTP calls
/// - END / EXIT: close the path

use crate::error::NodeError;
use crate::funnel::{Condition, FunnelNode};
use crate::runtime::condition::ConditionEvaluator;
use crate::runtime::context::ExecutionContext;
use crate::runtime::executor::{ActionResult, NodeExecutor, ValidationResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Entry-point node; reaching one mid-graph simply continues
#[derive(Debug, Default)]
pub struct TriggerExecutor;

#[async_trait]
impl NodeExecutor for TriggerExecutor {
    async fn execute(&self, _node: &FunnelNode, _context: &ExecutionContext) -> Result<ActionResult, NodeError> {
        Ok(ActionResult::proceed())
    }

    fn validate(&self, config: &Value) -> ValidationResult {
        let mut result = ValidationResult::ok();
        if let Some(trigger_type) = config.get("trigger_type") {
            if !trigger_type.is_string() {
                result.error("trigger 'trigger_type' must be a string");
            }
        }
        result
    }
}

/// END / EXIT
#[derive(Debug, Default)]
pub struct EndExecutor;

#[async_trait]
impl NodeExecutor for EndExecutor {
    async fn execute(&self, _node: &FunnelNode, _context: &ExecutionContext) -> Result<ActionResult, NodeError> {
        Ok(ActionResult::stop())
    }

    fn validate(&self, _config: &Value) -> ValidationResult {
        ValidationResult::ok()
    }
}

/// Join node; arrival counting happens in the engine before this runs
#[derive(Debug, Default)]
pub struct MergeExecutor;

#[async_trait]
impl NodeExecutor for MergeExecutor {
    async fn execute(&self, node: &FunnelNode, _context: &ExecutionContext) -> Result<ActionResult, NodeError> {
        Ok(ActionResult::proceed().with_data(json!({ "merged": node.id })))
    }

    fn validate(&self, config: &Value) -> ValidationResult {
        let mut result = ValidationResult::ok();
        if let Some(required) = config.get("required") {
            let valid = required
                .as_array()
                .map(|ids| ids.iter().all(Value::is_string))
                .unwrap_or(false);
            if !valid {
                result.error("merge 'required' must be an array of node ids");
            }
        }
        result
    }
}

/// Outbound message handed to a channel adapter
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub execution_id: String,
    pub node_id: String,
    pub channel: String,
    pub recipient: Option<String>,
    pub subject: Option<String>,
    pub body: String,
}

/// Delivery adapter (chat, email, ...); the real adapters live outside the engine
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Deliver and return the provider's message id
    async fn deliver(&self, message: &OutboundMessage) -> Result<String, NodeError>;
}

/// Channel that only writes the message to the operator log
#[derive(Debug, Default)]
pub struct LogChannel;

#[async_trait]
impl MessageChannel for LogChannel {
    async fn deliver(&self, message: &OutboundMessage) -> Result<String, NodeError> {
        let message_id = uuid::Uuid::new_v4().to_string();
        tracing::info!(
            "✉️ [{}] to {} (execution {}, node {}): {}",
            message.channel,
            message.recipient.as_deref().unwrap_or("-"),
            message.execution_id,
            message.node_id,
            message.body
        );
        Ok(message_id)
    }
}

/// MESSAGE node
///
/// Config: `{ "channel": "email", "template": "Hi {{name}}", "recipient": "{{email}}", "subject": "..." }`
pub struct MessageExecutor {
    channels: HashMap<String, Arc<dyn MessageChannel>>,
    default_channel: String,
}

impl MessageExecutor {
    pub fn new(default_channel: impl Into<String>) -> Self {
        Self {
            channels: HashMap::new(),
            default_channel: default_channel.into(),
        }
    }

    pub fn with_channel(mut self, name: impl Into<String>, channel: Arc<dyn MessageChannel>) -> Self {
        self.channels.insert(name.into(), channel);
        self
    }
}

impl Default for MessageExecutor {
    /// Log-only adapters for the common channel names
    fn default() -> Self {
        let log: Arc<dyn MessageChannel> = Arc::new(LogChannel);
        Self::new("log")
            .with_channel("log", Arc::clone(&log))
            .with_channel("email", Arc::clone(&log))
            .with_channel("chat", log)
    }
}

#[async_trait]
impl NodeExecutor for MessageExecutor {
    async fn execute(&self, node: &FunnelNode, context: &ExecutionContext) -> Result<ActionResult, NodeError> {
        let template = node
            .config
            .get("template")
            .and_then(Value::as_str)
            .ok_or_else(|| NodeError::config("message node requires a 'template'"))?;
        let channel_name = node
            .config
            .get("channel")
            .and_then(Value::as_str)
            .unwrap_or(&self.default_channel);
        let channel = self
            .channels
            .get(channel_name)
            .ok_or_else(|| NodeError::config(format!("unknown message channel '{}'", channel_name)))?;

        let root = context.variables_json();
        let render_field = |key: &str| {
            node.config
                .get(key)
                .and_then(Value::as_str)
                .map(|text| render_template(text, &root))
        };

        let message = OutboundMessage {
            execution_id: context.id.clone(),
            node_id: node.id.clone(),
            channel: channel_name.to_string(),
            recipient: render_field("recipient"),
            subject: render_field("subject"),
            body: render_template(template, &root),
        };

        let message_id = channel.deliver(&message).await?;
        Ok(ActionResult::proceed()
            .with_data(json!({ "message_id": message_id, "channel": channel_name, "body": message.body }))
            .with_variable("last_message_id", Value::String(message_id)))
    }

    fn validate(&self, config: &Value) -> ValidationResult {
        let mut result = ValidationResult::ok();
        match config.get("template").and_then(Value::as_str) {
            Some(template) if template.trim().is_empty() => result.warning("message template is empty"),
            Some(_) => {}
            None => result.error("message node requires a string 'template'"),
        }
        if let Some(channel) = config.get("channel").and_then(Value::as_str) {
            if !self.channels.contains_key(channel) {
                result.error(format!("unknown message channel '{}'", channel));
            }
        }
        result
    }
}

/// Replace `{{ path }}` placeholders with variable values; unknown paths render empty
pub fn render_template(template: &str, variables: &Value) -> String {
    let evaluator = ConditionEvaluator::new(variables);
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = after[..end].trim();
                match evaluator.lookup(key) {
                    Some(Value::String(text)) => output.push_str(&text),
                    Some(Value::Null) | None => {}
                    Some(other) => output.push_str(&other.to_string()),
                }
                rest = &after[end + 2..];
            }
            None => {
                output.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    output.push_str(rest);
    output
}

/// CONDITION node
///
/// With `config.condition` the node follows the connection labelled "true" or
/// "false"; without it the engine routes on connection conditions.
#[derive(Debug, Default)]
pub struct ConditionExecutor;

#[async_trait]
impl NodeExecutor for ConditionExecutor {
    async fn execute(&self, node: &FunnelNode, context: &ExecutionContext) -> Result<ActionResult, NodeError> {
        let Some(raw) = node.config.get("condition") else {
            return Ok(ActionResult::proceed());
        };
        let condition: Condition = serde_json::from_value(raw.clone())
            .map_err(|e| NodeError::config(format!("invalid condition: {}", e)))?;

        let root = context.variables_json();
        let outcome = ConditionEvaluator::new(&root).evaluate(&condition);
        let label = if outcome { "true" } else { "false" };

        let target = node
            .connections
            .iter()
            .find(|connection| {
                connection
                    .label
                    .as_deref()
                    .map(|l| l.eq_ignore_ascii_case(label))
                    .unwrap_or(false)
            })
            .map(|connection| connection.target.clone());

        let result = match target {
            Some(target) => ActionResult::goto(target),
            None => ActionResult::proceed(),
        };
        Ok(result.with_data(json!({ "result": outcome })))
    }

    fn validate(&self, config: &Value) -> ValidationResult {
        let mut result = ValidationResult::ok();
        match config.get("condition") {
            Some(raw) => {
                if let Err(e) = serde_json::from_value::<Condition>(raw.clone()) {
                    result.error(format!("invalid condition: {}", e));
                }
            }
            None => result.warning("condition node without 'condition' routes on connection conditions"),
        }
        result
    }
}

/// BRANCH node
///
/// `mode: "exclusive"` (default) walks `branches[{condition, target}]` in order
/// and falls back to `default_target`; `mode: "parallel"` fans out to every
/// outgoing connection whose condition holds.
#[derive(Debug, Default)]
pub struct BranchExecutor;

#[async_trait]
impl NodeExecutor for BranchExecutor {
    async fn execute(&self, node: &FunnelNode, context: &ExecutionContext) -> Result<ActionResult, NodeError> {
        let root = context.variables_json();
        let evaluator = ConditionEvaluator::new(&root);

        if node.config.get("mode").and_then(Value::as_str) == Some("parallel") {
            let targets: Vec<String> = node
                .connections
                .iter()
                .filter(|connection| {
                    connection
                        .condition
                        .as_ref()
                        .map(|condition| evaluator.evaluate(condition))
                        .unwrap_or(true)
                })
                .map(|connection| connection.target.clone())
                .collect();
            return Ok(ActionResult::fan_out(targets));
        }

        if let Some(branches) = node.config.get("branches").and_then(Value::as_array) {
            for branch in branches {
                let target = branch.get("target").and_then(Value::as_str);
                let condition = match branch.get("condition") {
                    Some(raw) => Some(
                        serde_json::from_value::<Condition>(raw.clone())
                            .map_err(|e| NodeError::config(format!("invalid branch condition: {}", e)))?,
                    ),
                    None => None,
                };
                let matched = condition.map(|c| evaluator.evaluate(&c)).unwrap_or(true);
                if let (true, Some(target)) = (matched, target) {
                    return Ok(ActionResult::goto(target));
                }
            }
        }

        match node.config.get("default_target").and_then(Value::as_str) {
            Some(target) => Ok(ActionResult::goto(target)),
            None => Ok(ActionResult::proceed()),
        }
    }

    fn validate(&self, config: &Value) -> ValidationResult {
        let mut result = ValidationResult::ok();
        match config.get("mode").and_then(Value::as_str) {
            None | Some("exclusive") | Some("parallel") => {}
            Some(other) => result.error(format!("unknown branch mode '{}'", other)),
        }
        if let Some(branches) = config.get("branches") {
            match branches.as_array() {
                Some(entries) => {
                    for (index, entry) in entries.iter().enumerate() {
                        if entry.get("target").and_then(Value::as_str).is_none() {
                            result.error(format!("branch {} is missing a 'target'", index));
                        }
                        if let Some(raw) = entry.get("condition") {
                            if serde_json::from_value::<Condition>(raw.clone()).is_err() {
                                result.error(format!("branch {} has an invalid condition", index));
                            }
                        }
                    }
                }
                None => result.error("'branches' must be an array"),
            }
        }
        result
    }
}

/// DELAY node
///
/// Config: `{ "delay_ms": 1000 }` or `{ "duration": 2, "unit": "hours" }`
#[derive(Debug, Default)]
pub struct DelayExecutor;

impl DelayExecutor {
    pub fn delay_from_config(config: &Value) -> Result<Duration, String> {
        if let Some(ms) = config.get("delay_ms") {
            return ms
                .as_u64()
                .map(Duration::from_millis)
                .ok_or_else(|| "'delay_ms' must be a non-negative integer".to_string());
        }
        let amount = config
            .get("duration")
            .and_then(Value::as_f64)
            .ok_or_else(|| "delay requires 'delay_ms' or 'duration'".to_string())?;
        if amount < 0.0 {
            return Err("'duration' must not be negative".to_string());
        }
        let unit_ms = match config.get("unit").and_then(Value::as_str).unwrap_or("seconds") {
            "milliseconds" | "ms" => 1.0,
            "seconds" | "s" => 1_000.0,
            "minutes" | "m" => 60_000.0,
            "hours" | "h" => 3_600_000.0,
            "days" | "d" => 86_400_000.0,
            other => return Err(format!("unknown delay unit '{}'", other)),
        };
        Ok(Duration::from_millis((amount * unit_ms) as u64))
    }
}

#[async_trait]
impl NodeExecutor for DelayExecutor {
    async fn execute(&self, node: &FunnelNode, _context: &ExecutionContext) -> Result<ActionResult, NodeError> {
        let delay = Self::delay_from_config(&node.config).map_err(NodeError::Config)?;
        Ok(ActionResult::suspend(delay))
    }

    fn validate(&self, config: &Value) -> ValidationResult {
        let mut result = ValidationResult::ok();
        if let Err(e) = Self::delay_from_config(config) {
            result.error(e);
        }
        result
    }
}

/// WAIT node
///
/// Config: `{ "until": "2026-11-01T09:00:00Z" }` or `{ "duration_ms": 5000 }`.
/// A point in time already passed resumes immediately.
#[derive(Debug, Default)]
pub struct WaitExecutor;

impl WaitExecutor {
    fn wait_from_config(config: &Value, now: DateTime<Utc>) -> Result<Duration, String> {
        if let Some(until) = config.get("until").and_then(Value::as_str) {
            let until = DateTime::parse_from_rfc3339(until)
                .map_err(|e| format!("invalid 'until' timestamp: {}", e))?
                .with_timezone(&Utc);
            return Ok((until - now).to_std().unwrap_or(Duration::ZERO));
        }
        config
            .get("duration_ms")
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
            .ok_or_else(|| "wait requires 'until' or 'duration_ms'".to_string())
    }
}

#[async_trait]
impl NodeExecutor for WaitExecutor {
    async fn execute(&self, node: &FunnelNode, _context: &ExecutionContext) -> Result<ActionResult, NodeError> {
        let delay = Self::wait_from_config(&node.config, Utc::now()).map_err(NodeError::Config)?;
        Ok(ActionResult::suspend(delay))
    }

    fn validate(&self, config: &Value) -> ValidationResult {
        let mut result = ValidationResult::ok();
        if let Err(e) = Self::wait_from_config(config, Utc::now()) {
            result.error(e);
        }
        result
    }
}

/// ACTION node
///
/// Supported `action` values:
/// - `set_variable`: `{ "name": "stage", "value": "lead" }`
/// - `increment`: `{ "name": "touches", "by": 1 }`
/// - `add_tag`: `{ "tag": "vip" }` appends to the `tags` array
/// - `http_request`: `{ "url", "method", "headers", "body", "response_variable" }`
#[derive(Debug)]
pub struct ActionExecutor {
    client: reqwest::Client,
}

impl ActionExecutor {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn required_str<'a>(config: &'a Value, key: &str) -> Result<&'a str, NodeError> {
        config
            .get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| NodeError::config(format!("action requires '{}'", key)))
    }

    async fn http_request(&self, node: &FunnelNode, context: &ExecutionContext) -> Result<ActionResult, NodeError> {
        let config = &node.config;
        let root = context.variables_json();
        let url = render_template(Self::required_str(config, "url")?, &root);
        let method = config.get("method").and_then(Value::as_str).unwrap_or("POST");

        tracing::debug!("🌍 HTTP action {} {} (node {})", method, url, node.id);

        let mut request = match method.to_uppercase().as_str() {
            "GET" => self.client.get(&url),
            "POST" => self.client.post(&url),
            "PUT" => self.client.put(&url),
            "PATCH" => self.client.patch(&url),
            "DELETE" => self.client.delete(&url),
            other => return Err(NodeError::config(format!("unsupported HTTP method: {}", other))),
        };

        if let Some(headers) = config.get("headers").and_then(Value::as_object) {
            for (key, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(key.as_str(), render_template(value, &root));
                }
            }
        }
        if let Some(body) = config.get("body") {
            request = request.json(body);
        }
        if let Some(timeout_ms) = node.timeout_ms() {
            request = request.timeout(Duration::from_millis(timeout_ms));
        }

        let response = request
            .send()
            .await
            .map_err(|e| NodeError::transient(format!("HTTP request to {} failed: {}", url, e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| NodeError::transient(format!("failed to read response body: {}", e)))?;
        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

        if status.is_server_error() || status.as_u16() == 429 {
            return Err(NodeError::transient(format!("{} returned {}", url, status)));
        }
        if status.is_client_error() {
            return Err(NodeError::permanent(format!("{} returned {}", url, status)));
        }

        let response_variable = config
            .get("response_variable")
            .and_then(Value::as_str)
            .unwrap_or("http_response");
        let data = json!({ "status": status.as_u16(), "body": body });
        Ok(ActionResult::proceed()
            .with_variable(response_variable, data.clone())
            .with_data(data))
    }
}

impl Default for ActionExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeExecutor for ActionExecutor {
    async fn execute(&self, node: &FunnelNode, context: &ExecutionContext) -> Result<ActionResult, NodeError> {
        let config = &node.config;
        match Self::required_str(config, "action")? {
            "set_variable" => {
                let name = Self::required_str(config, "name")?;
                let value = config.get("value").cloned().unwrap_or(Value::Null);
                Ok(ActionResult::proceed().with_variable(name, value))
            }
            "increment" => {
                let name = Self::required_str(config, "name")?;
                let by = config.get("by").and_then(Value::as_f64).unwrap_or(1.0);
                let current = context.variables.get(name).and_then(Value::as_f64).unwrap_or(0.0);
                let next = current + by;
                let value = if next.fract() == 0.0 && next.abs() < i64::MAX as f64 {
                    json!(next as i64)
                } else {
                    json!(next)
                };
                Ok(ActionResult::proceed().with_variable(name, value))
            }
            "add_tag" => {
                let tag = Self::required_str(config, "tag")?;
                let mut tags = context
                    .variables
                    .get("tags")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                if !tags.iter().any(|existing| existing.as_str() == Some(tag)) {
                    tags.push(Value::String(tag.to_string()));
                }
                Ok(ActionResult::proceed().with_variable("tags", Value::Array(tags)))
            }
            "http_request" => self.http_request(node, context).await,
            other => Err(NodeError::config(format!("unknown action '{}'", other))),
        }
    }

    fn validate(&self, config: &Value) -> ValidationResult {
        let mut result = ValidationResult::ok();
        let require = |result: &mut ValidationResult, key: &str| {
            if config.get(key).and_then(Value::as_str).is_none() {
                result.error(format!("action requires '{}'", key));
            }
        };
        match config.get("action").and_then(Value::as_str) {
            Some("set_variable") | Some("increment") => require(&mut result, "name"),
            Some("add_tag") => require(&mut result, "tag"),
            Some("http_request") => require(&mut result, "url"),
            Some(other) => result.error(format!("unknown action '{}'", other)),
            None => result.error("action node requires an 'action'"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funnel::{Connection, ConditionOperator, Funnel, NodeType};
    use crate::runtime::context::ExecutionMetadata;
    use pretty_assertions::assert_eq;

    fn context(variables: Value) -> ExecutionContext {
        let funnel = Funnel {
            id: "f1".into(),
            name: String::new(),
            version: 1,
            active: true,
            nodes: Vec::new(),
            triggers: Vec::new(),
            variables: Vec::new(),
            settings: Default::default(),
        };
        let bag = variables
            .as_object()
            .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        ExecutionContext::new(&funnel, "t1", bag, ExecutionMetadata::default())
    }

    #[test]
    fn test_render_template() {
        let vars = json!({"name": "Ana", "score": 80, "trigger_payload": {"data": {"plan": "pro"}}});
        assert_eq!(
            render_template("Hi {{name}}, score {{ score }} on {{trigger_payload.data.plan}}{{missing}}!", &vars),
            "Hi Ana, score 80 on pro!"
        );
        assert_eq!(render_template("broken {{name", &vars), "broken {{name");
    }

    #[tokio::test]
    async fn test_message_executor_renders_and_records_message_id() {
        let node = FunnelNode::new("welcome", NodeType::Message)
            .with_config(json!({"channel": "email", "template": "Hello {{name}}"}));
        let result = MessageExecutor::default()
            .execute(&node, &context(json!({"name": "Ana"})))
            .await
            .unwrap();

        assert_eq!(result.data.as_ref().unwrap()["body"], json!("Hello Ana"));
        assert!(result.variable_updates.contains_key("last_message_id"));
    }

    #[test]
    fn test_message_validation() {
        let executor = MessageExecutor::default();
        assert!(executor.validate(&json!({"template": "hi"})).is_valid);
        assert!(!executor.validate(&json!({})).is_valid);
        assert!(!executor.validate(&json!({"template": "hi", "channel": "pigeon"})).is_valid);
    }

    #[tokio::test]
    async fn test_condition_executor_follows_labelled_connection() {
        let node = FunnelNode::new("check", NodeType::Condition)
            .with_config(json!({"condition": {"field": "score", "operator": "gt", "value": 50}}))
            .with_connection(Connection::new("check", "hot").labelled("true"))
            .with_connection(Connection::new("check", "cold").labelled("false"));

        let hot = ConditionExecutor.execute(&node, &context(json!({"score": 80}))).await.unwrap();
        let cold = ConditionExecutor.execute(&node, &context(json!({"score": 50}))).await.unwrap();

        assert_eq!(hot.next_node_id.as_deref(), Some("hot"));
        assert_eq!(cold.next_node_id.as_deref(), Some("cold"));
    }

    #[tokio::test]
    async fn test_parallel_branch_fans_out_to_qualifying_connections() {
        let node = FunnelNode::new("split", NodeType::Branch)
            .with_config(json!({"mode": "parallel"}))
            .connect("a")
            .with_connection(Connection::new("split", "b").when(Condition::leaf(
                "vip",
                ConditionOperator::Equals,
                json!(true),
            )))
            .connect("c");

        let result = BranchExecutor.execute(&node, &context(json!({"vip": false}))).await.unwrap();
        assert_eq!(result.fan_out, Some(vec!["a".to_string(), "c".to_string()]));
    }

    #[tokio::test]
    async fn test_exclusive_branch_uses_first_match_then_default() {
        let node = FunnelNode::new("route", NodeType::Branch).with_config(json!({
            "branches": [
                {"condition": {"field": "plan", "operator": "equals", "value": "pro"}, "target": "pro"},
                {"condition": {"field": "plan", "operator": "in", "value": ["pro", "team"]}, "target": "team"}
            ],
            "default_target": "free"
        }));

        let pro = BranchExecutor.execute(&node, &context(json!({"plan": "pro"}))).await.unwrap();
        let team = BranchExecutor.execute(&node, &context(json!({"plan": "team"}))).await.unwrap();
        let free = BranchExecutor.execute(&node, &context(json!({}))).await.unwrap();

        assert_eq!(pro.next_node_id.as_deref(), Some("pro"));
        assert_eq!(team.next_node_id.as_deref(), Some("team"));
        assert_eq!(free.next_node_id.as_deref(), Some("free"));
    }

    #[test]
    fn test_delay_config_parsing() {
        assert_eq!(
            DelayExecutor::delay_from_config(&json!({"delay_ms": 1000})),
            Ok(Duration::from_millis(1000))
        );
        assert_eq!(
            DelayExecutor::delay_from_config(&json!({"duration": 2, "unit": "minutes"})),
            Ok(Duration::from_secs(120))
        );
        assert!(DelayExecutor::delay_from_config(&json!({"duration": 1, "unit": "fortnights"})).is_err());
        assert!(!DelayExecutor.validate(&json!({})).is_valid);
    }

    #[test]
    fn test_wait_until_past_resumes_immediately() {
        let now = Utc::now();
        let past = (now - chrono::Duration::minutes(5)).to_rfc3339();
        assert_eq!(
            WaitExecutor::wait_from_config(&json!({"until": past}), now),
            Ok(Duration::ZERO)
        );
    }

    #[tokio::test]
    async fn test_action_variable_mutations() {
        let executor = ActionExecutor::new();
        let ctx = context(json!({"touches": 2, "tags": ["trial"]}));

        let node = FunnelNode::new("inc", NodeType::Action)
            .with_config(json!({"action": "increment", "name": "touches"}));
        let result = executor.execute(&node, &ctx).await.unwrap();
        assert_eq!(result.variable_updates["touches"], json!(3));

        let node = FunnelNode::new("tag", NodeType::Action)
            .with_config(json!({"action": "add_tag", "tag": "vip"}));
        let result = executor.execute(&node, &ctx).await.unwrap();
        assert_eq!(result.variable_updates["tags"], json!(["trial", "vip"]));

        let node = FunnelNode::new("bad", NodeType::Action).with_config(json!({"action": "teleport"}));
        let error = executor.execute(&node, &ctx).await.unwrap_err();
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_action_validation() {
        let executor = ActionExecutor::new();
        assert!(executor.validate(&json!({"action": "set_variable", "name": "x"})).is_valid);
        assert!(!executor.validate(&json!({"action": "http_request"})).is_valid);
        assert!(!executor.validate(&json!({})).is_valid);
    }
}
