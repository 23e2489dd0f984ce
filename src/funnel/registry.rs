/// Hot-reload funnel registry using ArcSwap
///
/// Activation validates a funnel snapshot, resolves one executor per node and
/// swaps the compiled result into a lock-free map. Older versions of a funnel
/// stay addressable so executions started on them finish on the graph they
/// started with.

use crate::error::{ActivationError, UnknownNodeType};
use crate::funnel::types::{Funnel, FunnelNode, NodeType};
use crate::runtime::executor::NodeExecutor;
use crate::runtime::registry::ExecutorRegistry;
use arc_swap::ArcSwap;
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use petgraph::Direction;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Node plus the executor resolved for it at activation
#[derive(Clone)]
pub struct CompiledNode {
    pub node: FunnelNode,
    /// `None` when the node type had no executor (lenient compilation only)
    pub executor: Option<Arc<dyn NodeExecutor>>,
}

/// Execution-ready funnel snapshot
#[derive(Clone)]
pub struct CompiledFunnel {
    pub funnel: Arc<Funnel>,
    nodes: HashMap<String, CompiledNode>,
    /// Node id -> distinct source node ids, in node declaration order
    predecessors: HashMap<String, Vec<String>>,
    pub warnings: Vec<String>,
}

impl CompiledFunnel {
    pub fn id(&self) -> &str {
        &self.funnel.id
    }

    pub fn version(&self) -> u32 {
        self.funnel.version
    }

    pub fn node(&self, node_id: &str) -> Option<&FunnelNode> {
        self.nodes.get(node_id).map(|compiled| &compiled.node)
    }

    /// Executor cached for the node
    pub fn executor(&self, node_id: &str) -> Option<Result<Arc<dyn NodeExecutor>, UnknownNodeType>> {
        self.nodes.get(node_id).map(|compiled| {
            compiled
                .executor
                .clone()
                .ok_or_else(|| UnknownNodeType(compiled.node.node_type.to_string()))
        })
    }

    pub fn predecessors(&self, node_id: &str) -> &[String] {
        self.predecessors
            .get(node_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Predecessors a MERGE node waits for: config `required`, or every incoming source
    pub fn required_arrivals(&self, node_id: &str) -> Vec<String> {
        let declared = self
            .node(node_id)
            .and_then(|node| node.config.get("required"))
            .and_then(|required| required.as_array())
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| id.as_str().map(str::to_string))
                    .collect::<Vec<_>>()
            });
        match declared {
            Some(ids) if !ids.is_empty() => ids,
            _ => self.predecessors(node_id).to_vec(),
        }
    }

    /// Entry node for a trigger id
    ///
    /// Order: the trigger's `entry_node_id`, then a TRIGGER node whose config
    /// names the trigger id, then one whose config names the trigger type, then
    /// the first TRIGGER node.
    pub fn entry_node(&self, trigger_id: &str) -> Option<&str> {
        let trigger = self.funnel.trigger(trigger_id);
        if let Some(entry) = trigger.and_then(|t| t.entry_node_id.as_deref()) {
            return self.node(entry).map(|node| node.id.as_str());
        }

        let trigger_nodes: Vec<&FunnelNode> = self
            .funnel
            .nodes
            .iter()
            .filter(|node| node.node_type == NodeType::Trigger)
            .collect();
        let config_matches = |node: &FunnelNode, key: &str, expected: &str| {
            node.config.get(key).and_then(|v| v.as_str()) == Some(expected)
        };

        trigger_nodes
            .iter()
            .copied()
            .find(|node| config_matches(node, "trigger_id", trigger_id))
            .or_else(|| {
                trigger.and_then(|t| {
                    trigger_nodes
                        .iter()
                        .copied()
                        .find(|node| config_matches(node, "trigger_type", t.trigger_type.as_str()))
                })
            })
            .or_else(|| trigger_nodes.first().copied())
            .map(|node| node.id.as_str())
    }
}

impl std::fmt::Debug for CompiledFunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledFunnel")
            .field("id", &self.funnel.id)
            .field("version", &self.funnel.version)
            .field("nodes", &self.nodes.len())
            .field("warnings", &self.warnings)
            .finish()
    }
}

/// What activation reports back to the authoring system
#[derive(Debug, Clone, Serialize)]
pub struct ActivationReport {
    pub funnel_id: String,
    pub version: u32,
    pub warnings: Vec<String>,
}

/// Current snapshot of a funnel plus every version still addressable
#[derive(Clone)]
struct FunnelEntry {
    current: Arc<CompiledFunnel>,
    versions: BTreeMap<u32, Arc<CompiledFunnel>>,
}

/// Lock-free funnel registry
///
/// Every update clones the (Arc-filled) map and swaps the pointer, so readers
/// on worker tasks never block.
pub struct FunnelRegistry {
    funnels: ArcSwap<HashMap<String, FunnelEntry>>,
    executors: Arc<ExecutorRegistry>,
}

impl FunnelRegistry {
    pub fn new(executors: Arc<ExecutorRegistry>) -> Self {
        Self {
            funnels: ArcSwap::new(Arc::new(HashMap::new())),
            executors,
        }
    }

    pub fn executors(&self) -> &Arc<ExecutorRegistry> {
        &self.executors
    }

    /// Validate, compile and publish a funnel snapshot
    ///
    /// Structural problems (duplicate ids, dangling or self-looping
    /// connections, unknown node types) and executor config validation errors
    /// reject the snapshot; cycles and unreachable nodes are warnings.
    pub fn activate(&self, funnel: Funnel) -> Result<ActivationReport, ActivationError> {
        let compiled = Arc::new(self.compile(funnel, true)?);
        for warning in &compiled.warnings {
            tracing::warn!("⚠️ Funnel '{}': {}", compiled.id(), warning);
        }

        let report = ActivationReport {
            funnel_id: compiled.id().to_string(),
            version: compiled.version(),
            warnings: compiled.warnings.clone(),
        };
        self.publish(compiled, true);

        tracing::info!(
            "🔥 Activated funnel '{}' v{} ({} warnings)",
            report.funnel_id,
            report.version,
            report.warnings.len()
        );
        Ok(report)
    }

    /// Publish a snapshot without validation
    ///
    /// Used when a caller hands the engine a funnel that was never activated.
    /// Missing executors surface when the node is dispatched.
    pub fn install_unchecked(&self, funnel: Funnel) -> Arc<CompiledFunnel> {
        if let Some(existing) = self.snapshot(&funnel.id, funnel.version) {
            return existing;
        }
        let compiled = Arc::new(self.compile_lenient(funnel));
        self.publish(Arc::clone(&compiled), false);
        compiled
    }

    /// Current snapshot of a funnel
    pub fn get(&self, funnel_id: &str) -> Option<Arc<CompiledFunnel>> {
        self.funnels
            .load()
            .get(funnel_id)
            .map(|entry| Arc::clone(&entry.current))
    }

    /// Specific version of a funnel
    pub fn snapshot(&self, funnel_id: &str, version: u32) -> Option<Arc<CompiledFunnel>> {
        self.funnels
            .load()
            .get(funnel_id)
            .and_then(|entry| entry.versions.get(&version).cloned())
    }

    /// Current snapshots of every funnel
    pub fn list(&self) -> Vec<Arc<CompiledFunnel>> {
        self.funnels
            .load()
            .values()
            .map(|entry| Arc::clone(&entry.current))
            .collect()
    }

    /// Mark the current snapshot inactive; triggers are rejected afterwards
    pub fn deactivate(&self, funnel_id: &str) -> bool {
        let Some(current) = self.get(funnel_id) else {
            return false;
        };
        if !current.funnel.active {
            return true;
        }

        let mut funnel = (*current.funnel).clone();
        funnel.active = false;
        let compiled = CompiledFunnel {
            funnel: Arc::new(funnel),
            ..(*current).clone()
        };
        self.publish(Arc::new(compiled), true);
        tracing::info!("💤 Deactivated funnel '{}'", funnel_id);
        true
    }

    /// Drop every snapshot of a funnel
    pub fn remove(&self, funnel_id: &str) -> bool {
        let current = self.funnels.load();
        if !current.contains_key(funnel_id) {
            return false;
        }
        let mut next = (**current).clone();
        next.remove(funnel_id);
        self.funnels.store(Arc::new(next));
        tracing::info!("🗑️ Removed funnel '{}' from registry", funnel_id);
        true
    }

    fn publish(&self, compiled: Arc<CompiledFunnel>, make_current: bool) {
        self.funnels.rcu(|current| {
            let mut next = (**current).clone();
            let version = compiled.version();
            match next.get_mut(compiled.id()) {
                Some(entry) => {
                    entry.versions.insert(version, Arc::clone(&compiled));
                    if make_current {
                        entry.current = Arc::clone(&compiled);
                    }
                }
                None => {
                    next.insert(
                        compiled.id().to_string(),
                        FunnelEntry {
                            current: Arc::clone(&compiled),
                            versions: BTreeMap::from([(version, Arc::clone(&compiled))]),
                        },
                    );
                }
            }
            next
        });
    }

    fn compile_lenient(&self, funnel: Funnel) -> CompiledFunnel {
        match self.compile(funnel.clone(), false) {
            Ok(compiled) => compiled,
            Err(e) => {
                tracing::warn!("⚠️ Installing funnel '{}' despite: {}", funnel.id, e);
                let mut nodes = HashMap::new();
                for node in &funnel.nodes {
                    nodes.entry(node.id.clone()).or_insert_with(|| CompiledNode {
                        node: node.clone(),
                        executor: self.executors.resolve(&node.node_type).ok(),
                    });
                }
                let predecessors = incoming_sources(&funnel);
                CompiledFunnel {
                    funnel: Arc::new(funnel),
                    nodes,
                    predecessors,
                    warnings: vec![e.to_string()],
                }
            }
        }
    }

    fn compile(&self, funnel: Funnel, strict: bool) -> Result<CompiledFunnel, ActivationError> {
        let structural = |message: String| ActivationError::Structural {
            funnel_id: funnel.id.clone(),
            message,
        };

        tracing::debug!(
            "🏗️ Compiling funnel '{}' v{} with {} nodes",
            funnel.id,
            funnel.version,
            funnel.nodes.len()
        );

        let mut graph: DiGraph<String, ()> = DiGraph::new();
        let mut index_of: HashMap<String, NodeIndex> = HashMap::new();
        for node in &funnel.nodes {
            if index_of.contains_key(&node.id) {
                return Err(structural(format!("duplicate node id '{}'", node.id)));
            }
            index_of.insert(node.id.clone(), graph.add_node(node.id.clone()));
        }

        for node in &funnel.nodes {
            for connection in &node.connections {
                if connection.source != node.id {
                    return Err(structural(format!(
                        "connection on '{}' declares source '{}'",
                        node.id, connection.source
                    )));
                }
                if connection.target == node.id {
                    return Err(structural(format!("node '{}' connects to itself", node.id)));
                }
                let Some(&target) = index_of.get(&connection.target) else {
                    return Err(structural(format!(
                        "connection '{}' -> '{}' references an unknown node",
                        node.id, connection.target
                    )));
                };
                graph.add_edge(index_of[&node.id], target, ());
            }
        }

        for trigger in &funnel.triggers {
            if let Some(entry) = &trigger.entry_node_id {
                if !index_of.contains_key(entry) {
                    return Err(structural(format!(
                        "trigger '{}' names unknown entry node '{}'",
                        trigger.id, entry
                    )));
                }
            }
        }

        let mut warnings = Vec::new();
        if is_cyclic_directed(&graph) {
            warnings.push("graph contains a cycle; executions may not terminate".to_string());
        }

        let entry_points: Vec<NodeIndex> = funnel
            .nodes
            .iter()
            .filter(|node| node.node_type == NodeType::Trigger)
            .map(|node| index_of[&node.id])
            .collect();
        if entry_points.is_empty() {
            warnings.push("funnel has no TRIGGER node".to_string());
        } else {
            let mut reachable = std::collections::HashSet::new();
            for start in entry_points {
                let mut dfs = Dfs::new(&graph, start);
                while let Some(visited) = dfs.next(&graph) {
                    reachable.insert(visited);
                }
            }
            for node in &funnel.nodes {
                if !reachable.contains(&index_of[&node.id]) {
                    warnings.push(format!("node '{}' is unreachable from any trigger", node.id));
                }
            }
        }

        let mut predecessors: HashMap<String, Vec<String>> = HashMap::new();
        for node in &funnel.nodes {
            let mut sources: Vec<NodeIndex> = graph
                .neighbors_directed(index_of[&node.id], Direction::Incoming)
                .collect();
            sources.sort();
            sources.dedup();
            if !sources.is_empty() {
                predecessors.insert(
                    node.id.clone(),
                    sources.into_iter().map(|index| graph[index].clone()).collect(),
                );
            }
        }

        let mut nodes = HashMap::new();
        let mut errors = Vec::new();
        for node in &funnel.nodes {
            let executor = match self.executors.resolve(&node.node_type) {
                Ok(executor) => Some(executor),
                Err(e) if strict => {
                    return Err(structural(format!("node '{}': {}", node.id, e)));
                }
                Err(_) => None,
            };

            if strict {
                if let Some(executor) = &executor {
                    let validation = executor.validate(&node.config);
                    errors.extend(
                        validation
                            .errors
                            .iter()
                            .map(|error| format!("node '{}': {}", node.id, error)),
                    );
                    warnings.extend(
                        validation
                            .warnings
                            .iter()
                            .map(|warning| format!("node '{}': {}", node.id, warning)),
                    );
                }
                if node.node_type == NodeType::Merge {
                    if let Some(required) = node.config.get("required").and_then(|r| r.as_array()) {
                        for id in required.iter().filter_map(|id| id.as_str()) {
                            if !index_of.contains_key(id) {
                                return Err(structural(format!(
                                    "merge '{}' requires unknown node '{}'",
                                    node.id, id
                                )));
                            }
                        }
                    }
                }
            }

            nodes.insert(
                node.id.clone(),
                CompiledNode {
                    node: node.clone(),
                    executor,
                },
            );
        }

        if !errors.is_empty() {
            return Err(ActivationError::Validation {
                funnel_id: funnel.id.clone(),
                errors,
            });
        }

        Ok(CompiledFunnel {
            funnel: Arc::new(funnel),
            nodes,
            predecessors,
            warnings,
        })
    }
}

/// Incoming sources per node without graph validation
fn incoming_sources(funnel: &Funnel) -> HashMap<String, Vec<String>> {
    let mut predecessors: HashMap<String, Vec<String>> = HashMap::new();
    for node in &funnel.nodes {
        for connection in &node.connections {
            let sources = predecessors.entry(connection.target.clone()).or_default();
            if !sources.contains(&node.id) {
                sources.push(node.id.clone());
            }
        }
    }
    predecessors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funnel::{Trigger, TriggerType};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn registry() -> FunnelRegistry {
        FunnelRegistry::new(Arc::new(ExecutorRegistry::with_builtins()))
    }

    fn funnel(nodes: Vec<FunnelNode>) -> Funnel {
        Funnel {
            id: "f1".into(),
            name: "Test".into(),
            version: 1,
            active: true,
            nodes,
            triggers: Vec::new(),
            variables: Vec::new(),
            settings: Default::default(),
        }
    }

    fn diamond() -> Funnel {
        funnel(vec![
            FunnelNode::new("start", NodeType::Trigger).connect("split"),
            FunnelNode::new("split", NodeType::Branch)
                .with_config(json!({"mode": "parallel"}))
                .connect("a")
                .connect("b"),
            FunnelNode::new("a", NodeType::Action)
                .with_config(json!({"action": "set_variable", "name": "a", "value": 1}))
                .connect("join"),
            FunnelNode::new("b", NodeType::Action)
                .with_config(json!({"action": "set_variable", "name": "b", "value": 2}))
                .connect("join"),
            FunnelNode::new("join", NodeType::Merge).connect("end"),
            FunnelNode::new("end", NodeType::End),
        ])
    }

    #[test]
    fn test_activate_caches_executors_and_predecessors() {
        let registry = registry();
        let report = registry.activate(diamond()).unwrap();
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);

        let compiled = registry.get("f1").unwrap();
        assert!(matches!(compiled.executor("join"), Some(Ok(_))));
        assert_eq!(compiled.required_arrivals("join"), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(compiled.entry_node("any"), Some("start"));
    }

    #[test]
    fn test_activation_rejects_structural_problems() {
        let registry = registry();

        let dangling = funnel(vec![FunnelNode::new("start", NodeType::Trigger).connect("ghost")]);
        assert!(matches!(
            registry.activate(dangling),
            Err(ActivationError::Structural { .. })
        ));

        let self_loop = funnel(vec![FunnelNode::new("loop", NodeType::Action).connect("loop")]);
        assert!(matches!(
            registry.activate(self_loop),
            Err(ActivationError::Structural { .. })
        ));

        let unknown = funnel(vec![FunnelNode::new("x", NodeType::Custom("sms_blast".into()))]);
        assert!(matches!(
            registry.activate(unknown),
            Err(ActivationError::Structural { .. })
        ));
        assert!(registry.get("f1").is_none());
    }

    #[test]
    fn test_activation_collects_config_errors() {
        let registry = registry();
        let invalid = funnel(vec![
            FunnelNode::new("start", NodeType::Trigger).connect("msg"),
            FunnelNode::new("msg", NodeType::Message).connect("wait"),
            FunnelNode::new("wait", NodeType::Delay),
        ]);

        match registry.activate(invalid) {
            Err(ActivationError::Validation { errors, .. }) => assert_eq!(errors.len(), 2),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_cycles_are_warnings() {
        let registry = registry();
        let cyclic = funnel(vec![
            FunnelNode::new("start", NodeType::Trigger).connect("a"),
            FunnelNode::new("a", NodeType::Action)
                .with_config(json!({"action": "increment", "name": "n"}))
                .connect("b"),
            FunnelNode::new("b", NodeType::Action)
                .with_config(json!({"action": "increment", "name": "n"}))
                .connect("a"),
        ]);

        let report = registry.activate(cyclic).unwrap();
        assert!(report.warnings.iter().any(|w| w.contains("cycle")));
    }

    #[test]
    fn test_entry_resolution_order() {
        let registry = registry();
        let mut fixture = funnel(vec![
            FunnelNode::new("generic", NodeType::Trigger).connect("end"),
            FunnelNode::new("hook", NodeType::Trigger)
                .with_config(json!({"trigger_type": "webhook"}))
                .connect("end"),
            FunnelNode::new("manual", NodeType::Trigger)
                .with_config(json!({"trigger_id": "t-manual"}))
                .connect("end"),
            FunnelNode::new("end", NodeType::End),
        ]);
        let mut explicit = Trigger::new("t-explicit", TriggerType::Manual, "f1");
        explicit.entry_node_id = Some("hook".into());
        fixture.triggers = vec![
            Trigger::new("t-hook", TriggerType::Webhook, "f1"),
            Trigger::new("t-manual", TriggerType::Manual, "f1"),
            explicit,
        ];
        registry.activate(fixture).unwrap();
        let compiled = registry.get("f1").unwrap();

        assert_eq!(compiled.entry_node("t-explicit"), Some("hook"));
        assert_eq!(compiled.entry_node("t-manual"), Some("manual"));
        assert_eq!(compiled.entry_node("t-hook"), Some("hook"));
        assert_eq!(compiled.entry_node("unknown"), Some("generic"));
    }

    #[test]
    fn test_hot_swap_keeps_previous_versions() {
        let registry = registry();
        registry.activate(diamond()).unwrap();

        let mut v2 = diamond();
        v2.version = 2;
        registry.activate(v2).unwrap();

        assert_eq!(registry.get("f1").unwrap().version(), 2);
        assert_eq!(registry.snapshot("f1", 1).unwrap().version(), 1);

        assert!(registry.deactivate("f1"));
        assert!(!registry.get("f1").unwrap().funnel.active);
        assert!(registry.remove("f1"));
        assert!(registry.get("f1").is_none());
    }

    #[test]
    fn test_install_unchecked_defers_unknown_types() {
        let registry = registry();
        let fixture = funnel(vec![
            FunnelNode::new("start", NodeType::Trigger).connect("x"),
            FunnelNode::new("x", NodeType::Custom("sms_blast".into())),
        ]);

        let compiled = registry.install_unchecked(fixture);
        assert!(matches!(compiled.executor("x"), Some(Err(_))));
        assert!(registry.snapshot("f1", 1).is_some());
    }
}
