use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use wfcore::{
    expr, validate_expression, Bindings, NodeContext, NodeError, NodeExecutor, NodeOutcome,
    NodeOutput, NodeSpec, NodeType,
};

#[derive(Debug, Deserialize)]
struct Case {
    label: String,
    expression: String,
}

fn cases(spec_config: &serde_json::Map<String, Value>) -> Result<Option<Vec<Case>>, NodeError> {
    match spec_config.get("cases") {
        None => Ok(None),
        Some(raw) => serde_json::from_value(raw.clone())
            .map(Some)
            .map_err(|e| NodeError::Configuration(format!("invalid cases: {}", e))),
    }
}

/// Branch label for an expression result. Booleans give `"true"`/`"false"`,
/// strings are used verbatim, numbers by their text; anything else by
/// truthiness.
pub fn branch_label(value: &Value) -> String {
    match value {
        Value::Bool(b) => b.to_string(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => expr::is_truthy(other).to_string(),
    }
}

fn choose(config: &serde_json::Map<String, Value>, bindings: &Bindings) -> Result<String, NodeError> {
    if let Some(expression) = config.get("expression").and_then(Value::as_str) {
        return Ok(branch_label(&bindings.evaluate(expression)?));
    }
    for case in cases(config)?.unwrap_or_default() {
        if expr::is_truthy(&bindings.evaluate(&case.expression)?) {
            return Ok(case.label);
        }
    }
    config
        .get("default")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| NodeError::ExecutionFailed("no case matched and no default is set".to_string()))
}

/// Picks a branch label; the engine follows the matching edge.
pub struct DecisionExecutor;

#[async_trait]
impl NodeExecutor for DecisionExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::Decision
    }

    fn description(&self) -> &str {
        "Evaluates an expression or ordered cases and routes by the resulting label"
    }

    fn validate_config(&self, spec: &NodeSpec) -> Result<(), NodeError> {
        if let Some(expression) = spec.config.get("expression") {
            let expression = expression.as_str().ok_or_else(|| {
                NodeError::Configuration("expression must be a string".to_string())
            })?;
            return validate_expression(&spec.id, expression);
        }
        match cases(&spec.config)? {
            Some(cases) if !cases.is_empty() => {
                for case in &cases {
                    validate_expression(&spec.id, &case.expression)?;
                }
                Ok(())
            }
            _ => Err(NodeError::Configuration(
                "decision needs expression or cases".to_string(),
            )),
        }
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutcome, NodeError> {
        let branch = choose(&ctx.config, &ctx.bindings)?;
        tracing::debug!(node_id = %ctx.node_id, iteration = ctx.iteration, branch = %branch, "Decision made");
        Ok(NodeOutput::new(json!({ "branch": branch }))
            .with_branch(branch)
            .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn bindings(scope: Value) -> Bindings {
        Bindings::from_map(scope.as_object().cloned().unwrap_or_default())
    }

    fn config(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn expression_results_become_labels() {
        let b = bindings(json!({"x": 5, "tier": "gold"}));
        assert_eq!(choose(&config(json!({"expression": "x > 0"})), &b).unwrap(), "true");
        assert_eq!(choose(&config(json!({"expression": "x < 0"})), &b).unwrap(), "false");
        assert_eq!(choose(&config(json!({"expression": "tier"})), &b).unwrap(), "gold");
        assert_eq!(choose(&config(json!({"expression": "x"})), &b).unwrap(), "5");
        assert_eq!(choose(&config(json!({"expression": "missing"})), &b).unwrap(), "false");
    }

    #[test]
    fn first_matching_case_wins_then_default() {
        let cfg = config(json!({
            "cases": [
                {"label": "high", "expression": "score >= 80"},
                {"label": "mid", "expression": "score >= 50"},
            ],
            "default": "low",
        }));
        assert_eq!(choose(&cfg, &bindings(json!({"score": 90}))).unwrap(), "high");
        assert_eq!(choose(&cfg, &bindings(json!({"score": 60}))).unwrap(), "mid");
        assert_eq!(choose(&cfg, &bindings(json!({"score": 10}))).unwrap(), "low");
    }

    #[test]
    fn validation_requires_parseable_logic() {
        let ok = NodeSpec::new("d", NodeType::Decision).with_config("expression", "a and b");
        assert!(DecisionExecutor.validate_config(&ok).is_ok());
        let bad = NodeSpec::new("d", NodeType::Decision).with_config("expression", "a and");
        assert!(DecisionExecutor.validate_config(&bad).is_err());
        let none = NodeSpec::new("d", NodeType::Decision);
        assert!(DecisionExecutor.validate_config(&none).is_err());
    }
}
