use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use wfcore::{
    expr, Bindings, NodeContext, NodeError, NodeExecutor, NodeId, NodeOutcome, NodeOutput,
    NodeSpec, NodeType,
};

/// Arguments and context for one tool invocation.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub node_id: NodeId,
    pub arguments: Map<String, Value>,
    pub cancellation: CancellationToken,
}

impl ToolCall {
    pub fn argument(&self, name: &str) -> Option<&Value> {
        self.arguments.get(name)
    }

    pub fn require(&self, name: &str) -> Result<&Value, NodeError> {
        match self.arguments.get(name) {
            Some(Value::Null) | None => Err(NodeError::MissingInput(name.to_string())),
            Some(value) => Ok(value),
        }
    }

    pub fn require_str(&self, name: &str) -> Result<&str, NodeError> {
        self.require(name)?
            .as_str()
            .ok_or_else(|| NodeError::InvalidInputType {
                field: name.to_string(),
                expected: "string".to_string(),
                actual: "other".to_string(),
            })
    }
}

/// A named capability a `tool` node can invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    async fn call(&self, call: ToolCall) -> Result<Value, NodeError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolMetadata {
    pub name: String,
    pub description: String,
}

#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `http.request`, `json.parse`, `json.stringify`,
    /// `time.delay` and `debug.log`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(crate::http::HttpRequestTool::new()));
        registry.register(Arc::new(crate::json::JsonParseTool));
        registry.register(Arc::new(crate::json::JsonStringifyTool));
        registry.register(Arc::new(crate::time::DelayTool));
        registry.register(Arc::new(crate::debug::DebugLogTool));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        tracing::debug!(tool = tool.name(), "Registering tool");
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn list(&self) -> Vec<ToolMetadata> {
        self.tools
            .values()
            .map(|t| ToolMetadata {
                name: t.name().to_string(),
                description: t.description().to_string(),
            })
            .collect()
    }
}

/// Resolves argument values against bindings. A string that is exactly one
/// `{{ expr }}` keeps the expression's type; other strings are rendered as
/// templates; objects and arrays are resolved element-wise.
pub fn resolve_arguments(value: &Value, bindings: &Bindings) -> Result<Value, NodeError> {
    Ok(match value {
        Value::String(s) => {
            let trimmed = s.trim();
            let single = trimmed.starts_with("{{")
                && trimmed.ends_with("}}")
                && trimmed[2..].find("{{").is_none()
                && trimmed[2..trimmed.len() - 2].find("}}").is_none();
            if single {
                bindings.evaluate(trimmed[2..trimmed.len() - 2].trim())?
            } else if s.contains("{{") {
                Value::String(bindings.render(s)?)
            } else {
                value.clone()
            }
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_arguments(item, bindings))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(k, v)| Ok((k.clone(), resolve_arguments(v, bindings)?)))
                .collect::<Result<_, NodeError>>()?,
        ),
        other => other.clone(),
    })
}

/// Executor for `tool` nodes: looks up `tool` and calls it with the
/// resolved `arguments`.
pub struct ToolExecutor {
    tools: Arc<ToolRegistry>,
}

impl ToolExecutor {
    pub fn new(tools: Arc<ToolRegistry>) -> Self {
        Self { tools }
    }
}

#[async_trait]
impl NodeExecutor for ToolExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::Tool
    }

    fn description(&self) -> &str {
        "Invokes a registered tool with templated arguments"
    }

    fn validate_config(&self, spec: &NodeSpec) -> Result<(), NodeError> {
        let name = spec
            .config
            .get("tool")
            .and_then(Value::as_str)
            .ok_or_else(|| NodeError::Configuration("Missing config: tool".to_string()))?;
        if self.tools.get(name).is_none() {
            return Err(NodeError::UnknownTool(name.to_string()));
        }
        match spec.config.get("arguments") {
            None | Some(Value::Object(_)) => Ok(()),
            Some(_) => Err(NodeError::Configuration(
                "arguments must be an object".to_string(),
            )),
        }
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutcome, NodeError> {
        let name = ctx.require_config_str("tool")?;
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| NodeError::UnknownTool(name.to_string()))?;
        let arguments = match ctx.config.get("arguments") {
            Some(raw) => match resolve_arguments(raw, &ctx.bindings)? {
                Value::Object(map) => map,
                _ => Map::new(),
            },
            None => Map::new(),
        };
        tracing::debug!(node_id = %ctx.node_id, tool = name, "Calling tool");
        let output = tool
            .call(ToolCall {
                node_id: ctx.node_id.clone(),
                arguments,
                cancellation: ctx.cancellation.clone(),
            })
            .await?;
        Ok(NodeOutput::new(output).with_metric("tool", name).into())
    }
}
