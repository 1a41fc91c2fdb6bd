use crate::bindings::Bindings;
use crate::expr;
use crate::state::ExecutionStatus;
use crate::{ExecutionId, NodeError, NodeId, NodeSpec, NodeType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Strategy for one node type. The engine holds exactly one per
/// [`NodeType`] and dispatches on the node's declared type.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    fn node_type(&self) -> NodeType;

    /// Execute the node with given context
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutcome, NodeError>;

    /// Short human-readable description for listings.
    fn description(&self) -> &str {
        ""
    }

    /// Optional: Validate configuration at workflow start time
    fn validate_config(&self, _spec: &NodeSpec) -> Result<(), NodeError> {
        Ok(())
    }
}

/// Execution context passed to each node
#[derive(Clone)]
pub struct NodeContext {
    pub execution_id: ExecutionId,
    pub node_id: NodeId,
    pub node_name: String,
    pub iteration: u32,

    /// Static configuration for this node
    pub config: Map<String, Value>,

    /// Variable bindings visible to this node
    pub bindings: Bindings,

    /// Fires when the execution is cancelled or a sibling fails fatally
    pub cancellation: CancellationToken,
}

impl NodeContext {
    pub fn new(execution_id: ExecutionId, spec: &NodeSpec, iteration: u32, bindings: Bindings) -> Self {
        Self {
            execution_id,
            node_id: spec.id.clone(),
            node_name: spec.display_name().to_string(),
            iteration,
            config: spec.config.clone(),
            bindings,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Get required binding or return error
    pub fn require_binding(&self, path: &str) -> Result<Value, NodeError> {
        let value = self.bindings.evaluate(path)?;
        if value.is_null() {
            return Err(NodeError::MissingInput(path.to_string()));
        }
        Ok(value)
    }

    /// Get config value or return error
    pub fn require_config(&self, name: &str) -> Result<&Value, NodeError> {
        self.config
            .get(name)
            .ok_or_else(|| NodeError::Configuration(format!("Missing config: {}", name)))
    }

    pub fn require_config_str(&self, name: &str) -> Result<&str, NodeError> {
        self.require_config(name)?
            .as_str()
            .ok_or_else(|| NodeError::InvalidInputType {
                field: name.to_string(),
                expected: "string".to_string(),
                actual: type_name(self.config.get(name)).to_string(),
            })
    }

    /// Get config with default
    pub fn get_config_or(&self, name: &str, default: Value) -> Value {
        self.config.get(name).cloned().unwrap_or(default)
    }

    pub fn config_str(&self, name: &str) -> Option<&str> {
        self.config.get(name).and_then(Value::as_str)
    }

    /// Renders a config string as a `{{ }}` template over the bindings.
    pub fn render(&self, name: &str) -> Result<Option<String>, NodeError> {
        match self.config_str(name) {
            Some(template) => Ok(Some(expr::render_template(template, self.bindings.as_value())?)),
            None => Ok(None),
        }
    }
}

pub(crate) fn type_name(value: Option<&Value>) -> &'static str {
    match value {
        None | Some(Value::Null) => "null",
        Some(Value::Bool(_)) => "boolean",
        Some(Value::Number(_)) => "number",
        Some(Value::String(_)) => "string",
        Some(Value::Array(_)) => "array",
        Some(Value::Object(_)) => "object",
    }
}

/// Either a finished result or a request to suspend for human input.
#[derive(Debug, Clone)]
pub enum NodeOutcome {
    Complete(NodeOutput),
    Pause(CheckpointRequest),
}

impl From<NodeOutput> for NodeOutcome {
    fn from(output: NodeOutput) -> Self {
        NodeOutcome::Complete(output)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Output from node execution
#[derive(Debug, Clone, Default)]
pub struct NodeOutput {
    pub output: Value,
    /// Label the engine routes on, for decision nodes.
    pub branch: Option<String>,
    pub model: Option<String>,
    pub tokens: Option<TokenUsage>,
    pub custom_metrics: Map<String, Value>,
}

impl NodeOutput {
    pub fn new(output: Value) -> Self {
        Self {
            output,
            ..Self::default()
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_tokens(mut self, tokens: TokenUsage) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn with_metric(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.custom_metrics.insert(key.into(), value.into());
        self
    }
}

/// What happens when a checkpoint is not answered in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TimeoutAction {
    #[default]
    Fail,
    Default { branch: String },
}

/// Pause signal returned by human checkpoint executors.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointRequest {
    pub prompt: Option<String>,
    pub options: Vec<String>,
    pub timeout: Option<Duration>,
    pub timeout_action: TimeoutAction,
    pub outcomes: BTreeMap<String, ExecutionStatus>,
}

impl CheckpointRequest {
    pub fn new(options: Vec<String>) -> Self {
        Self {
            prompt: None,
            options,
            timeout: None,
            timeout_action: TimeoutAction::Fail,
            outcomes: BTreeMap::new(),
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }
}

/// Compiles `source` once so config validation can reject bad expressions
/// before a run starts.
pub fn validate_expression(node_id: &str, source: &str) -> Result<(), NodeError> {
    expr::validate(source).map_err(|e| {
        NodeError::Configuration(format!("node '{}': invalid expression '{}': {}", node_id, source, e))
    })
}
