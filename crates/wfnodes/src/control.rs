use crate::transform::{evaluate_mappings, validate_mappings};
use async_trait::async_trait;
use serde_json::{Map, Value};
use wfcore::{
    validate_expression, NodeContext, NodeError, NodeExecutor, NodeOutcome, NodeOutput, NodeSpec,
    NodeType,
};

/// Entry point; outputs the execution's input variables.
pub struct StartExecutor;

#[async_trait]
impl NodeExecutor for StartExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::Start
    }

    fn description(&self) -> &str {
        "Entry point of a workflow"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutcome, NodeError> {
        let inputs = ctx
            .bindings
            .get("input")
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()));
        Ok(NodeOutput::new(inputs).into())
    }
}

/// Terminal anchor. `output` may be an expression or a mapping object
/// describing the workflow's result.
pub struct EndExecutor;

#[async_trait]
impl NodeExecutor for EndExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::End
    }

    fn description(&self) -> &str {
        "Marks a branch as finished and optionally shapes the result"
    }

    fn validate_config(&self, spec: &NodeSpec) -> Result<(), NodeError> {
        match spec.config.get("output") {
            Some(Value::String(expression)) => validate_expression(&spec.id, expression),
            Some(Value::Object(mappings)) => validate_mappings(&spec.id, mappings),
            Some(_) => Err(NodeError::Configuration(
                "output must be an expression or an object".to_string(),
            )),
            None => Ok(()),
        }
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutcome, NodeError> {
        let output = match ctx.config.get("output") {
            Some(Value::String(expression)) => ctx.bindings.evaluate(expression)?,
            Some(Value::Object(mappings)) => evaluate_mappings(mappings, &ctx.bindings)?,
            _ => Value::Null,
        };
        Ok(NodeOutput::new(output).into())
    }
}
