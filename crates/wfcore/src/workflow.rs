use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

pub type WorkflowId = String;
pub type NodeId = String;

/// Immutable workflow definition, keyed by `(id, version)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: WorkflowId,
    #[serde(default = "default_version")]
    pub version: u32,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub nodes: Vec<NodeSpec>,
}

fn default_version() -> u32 {
    1
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<WorkflowId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: 1,
            name: name.into(),
            description: None,
            nodes: Vec::new(),
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_node(mut self, node: NodeSpec) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn add_node(&mut self, node: NodeSpec) -> NodeId {
        let id = node.id.clone();
        self.nodes.push(node);
        id
    }

    /// Adds a forward edge. Does nothing if `from` is unknown.
    pub fn connect(&mut self, from: &str, to: impl Into<NodeId>) {
        if let Some(node) = self.nodes.iter_mut().find(|n| n.id == from) {
            node.edges.push(Edge::new(to));
        }
    }

    pub fn find_node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn start_nodes(&self) -> impl Iterator<Item = &NodeSpec> {
        self.nodes.iter().filter(|n| n.node_type == NodeType::Start)
    }
}

/// The fixed set of node variants the engine knows how to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Start,
    End,
    Agent,
    Tool,
    Decision,
    Human,
    Transform,
}

impl NodeType {
    pub const ALL: [NodeType; 7] = [
        NodeType::Start,
        NodeType::End,
        NodeType::Agent,
        NodeType::Tool,
        NodeType::Decision,
        NodeType::Human,
        NodeType::Transform,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Start => "start",
            NodeType::End => "end",
            NodeType::Agent => "agent",
            NodeType::Tool => "tool",
            NodeType::Decision => "decision",
            NodeType::Human => "human",
            NodeType::Transform => "transform",
        }
    }

    /// Node types whose outgoing edge conditions are branch labels rather
    /// than expressions.
    pub fn routes_by_label(&self) -> bool {
        matches!(self, NodeType::Decision | NodeType::Human)
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Node specification in a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
}

impl NodeSpec {
    pub fn new(id: impl Into<NodeId>, node_type: NodeType) -> Self {
        Self {
            id: id.into(),
            node_type,
            name: None,
            config: Map::new(),
            edges: Vec::new(),
            retry_policy: None,
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn to(self, target: impl Into<NodeId>) -> Self {
        self.with_edge(Edge::new(target))
    }

    pub fn with_retry(mut self, max_attempts: u32, delay_ms: u64) -> Self {
        self.retry_policy = Some(RetryPolicy {
            max_attempts,
            delay_ms,
            backoff_multiplier: 1.0,
        });
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn continue_on_error(&self) -> bool {
        self.config
            .get("continueOnError")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn output_variable(&self) -> Option<&str> {
        self.config.get("outputVariable").and_then(Value::as_str)
    }

    pub fn max_iterations(&self) -> Option<u32> {
        self.config
            .get("maxIterations")
            .and_then(Value::as_u64)
            .map(|n| n.min(u32::MAX as u64) as u32)
    }

    pub fn timeout_ms(&self) -> Option<u64> {
        self.config.get("timeoutMs").and_then(Value::as_u64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Edge {
    pub to: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default)]
    pub kind: EdgeKind,
}

impl Edge {
    pub fn new(to: impl Into<NodeId>) -> Self {
        Self {
            to: to.into(),
            condition: None,
            kind: EdgeKind::Forward,
        }
    }

    /// Edge taken when a decision or checkpoint picks `label`.
    pub fn branch(to: impl Into<NodeId>, label: impl Into<String>) -> Self {
        Self {
            condition: Some(label.into()),
            ..Self::new(to)
        }
    }

    pub fn loop_back(to: impl Into<NodeId>, label: impl Into<String>) -> Self {
        Self {
            condition: Some(label.into()),
            kind: EdgeKind::LoopBack,
            ..Self::new(to)
        }
    }

    pub fn on_failure(to: impl Into<NodeId>) -> Self {
        Self {
            kind: EdgeKind::Failure,
            ..Self::new(to)
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    #[default]
    Forward,
    /// Marks the edge that closes a loop; cycles without one are rejected.
    LoopBack,
    /// Followed only after a node fails with `continueOnError`.
    Failure,
}

/// Retry policy for node execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay_ms: u64,
    #[serde(default = "default_backoff")]
    pub backoff_multiplier: f64,
}

fn default_backoff() -> f64 {
    1.0
}

impl RetryPolicy {
    /// Delay before the given retry (1-based attempt that just failed).
    pub fn delay_after(&self, attempt: u32) -> std::time::Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
        std::time::Duration::from_millis((self.delay_ms as f64 * factor) as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 1000,
            backoff_multiplier: 2.0,
        }
    }
}
