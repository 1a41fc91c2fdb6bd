use async_trait::async_trait;
use serde_json::{Map, Value};
use wfcore::{
    validate_expression, Bindings, NodeContext, NodeError, NodeExecutor, NodeOutcome, NodeOutput,
    NodeSpec, NodeType,
};

/// Evaluates each string in `mappings` as an expression; other values are
/// copied as literals.
pub(crate) fn evaluate_mappings(
    mappings: &Map<String, Value>,
    bindings: &Bindings,
) -> Result<Value, NodeError> {
    let mut output = Map::new();
    for (name, source) in mappings {
        let value = match source {
            Value::String(expression) => bindings.evaluate(expression)?,
            literal => literal.clone(),
        };
        output.insert(name.clone(), value);
    }
    Ok(Value::Object(output))
}

pub(crate) fn validate_mappings(node_id: &str, mappings: &Map<String, Value>) -> Result<(), NodeError> {
    for source in mappings.values() {
        if let Value::String(expression) = source {
            validate_expression(node_id, expression)?;
        }
    }
    Ok(())
}

/// Reshapes data with `mappings` or a string `template`.
pub struct TransformExecutor;

#[async_trait]
impl NodeExecutor for TransformExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::Transform
    }

    fn description(&self) -> &str {
        "Builds an object from expressions or renders a template"
    }

    fn validate_config(&self, spec: &NodeSpec) -> Result<(), NodeError> {
        match (spec.config.get("mappings"), spec.config.get("template")) {
            (Some(Value::Object(mappings)), _) => validate_mappings(&spec.id, mappings),
            (Some(_), _) => Err(NodeError::Configuration(
                "mappings must be an object".to_string(),
            )),
            (None, Some(Value::String(_))) => Ok(()),
            _ => Err(NodeError::Configuration(
                "transform needs mappings or template".to_string(),
            )),
        }
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutcome, NodeError> {
        if let Some(Value::Object(mappings)) = ctx.config.get("mappings") {
            return Ok(NodeOutput::new(evaluate_mappings(mappings, &ctx.bindings)?).into());
        }
        match ctx.render("template")? {
            Some(text) => Ok(NodeOutput::new(Value::String(text)).into()),
            None => Err(NodeError::Configuration(
                "transform needs mappings or template".to_string(),
            )),
        }
    }
}
