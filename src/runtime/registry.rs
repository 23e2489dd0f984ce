/// Node executor registry
///
/// Maps node types to the executor that runs them. Built-in kinds are
/// registered by `with_builtins`; custom kinds are added with `register`
/// before funnels using them are activated.

use crate::error::UnknownNodeType;
use crate::funnel::NodeType;
use crate::runtime::executor::NodeExecutor;
use crate::runtime::nodes::{
    ActionExecutor, BranchExecutor, ConditionExecutor, DelayExecutor, EndExecutor, MergeExecutor,
    MessageExecutor, TriggerExecutor, WaitExecutor,
};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<NodeType, Arc<dyn NodeExecutor>>,
}

impl ExecutorRegistry {
    /// Empty registry; every node type is unknown
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with an executor for every built-in node kind
    pub fn with_builtins() -> Self {
        let end: Arc<dyn NodeExecutor> = Arc::new(EndExecutor);

        let mut registry = Self::new();
        registry.register(NodeType::Trigger, Arc::new(TriggerExecutor));
        registry.register(NodeType::Message, Arc::new(MessageExecutor::default()));
        registry.register(NodeType::Condition, Arc::new(ConditionExecutor));
        registry.register(NodeType::Delay, Arc::new(DelayExecutor));
        registry.register(NodeType::Wait, Arc::new(WaitExecutor));
        registry.register(NodeType::Action, Arc::new(ActionExecutor::new()));
        registry.register(NodeType::Branch, Arc::new(BranchExecutor));
        registry.register(NodeType::Merge, Arc::new(MergeExecutor));
        registry.register(NodeType::End, Arc::clone(&end));
        registry.register(NodeType::Exit, end);
        registry
    }

    /// Register or replace the executor for a node type
    pub fn register(&mut self, node_type: NodeType, executor: Arc<dyn NodeExecutor>) {
        tracing::debug!("🧩 Registered executor for node type '{}'", node_type);
        self.executors.insert(node_type, executor);
    }

    pub fn resolve(&self, node_type: &NodeType) -> Result<Arc<dyn NodeExecutor>, UnknownNodeType> {
        self.executors
            .get(node_type)
            .cloned()
            .ok_or_else(|| UnknownNodeType(node_type.to_string()))
    }

    pub fn contains(&self, node_type: &NodeType) -> bool {
        self.executors.contains_key(node_type)
    }

    /// Registered node types, sorted by name
    pub fn node_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.executors.keys().map(NodeType::to_string).collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("node_types", &self.node_types())
            .finish()
    }
}
