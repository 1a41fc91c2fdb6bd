//! Variable bindings seen by executors and expressions.

use crate::expr::{self, ExprError};
use crate::state::ExecutionInstance;
use crate::WorkflowDefinition;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Immutable view of everything a node may read. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    scope: Arc<Value>,
}

impl Bindings {
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self {
            scope: Arc::new(Value::Object(map)),
        }
    }

    /// Builds bindings for the current state of `instance`. Later layers
    /// shadow earlier ones: globals, inputs, node outputs, output variables.
    pub fn build(
        instance: &ExecutionInstance,
        definition: &WorkflowDefinition,
        globals: &Map<String, Value>,
    ) -> Self {
        let mut scope = Map::new();
        scope.extend(globals.clone());
        scope.extend(instance.input_variables.clone());
        scope.insert(
            "input".to_string(),
            Value::Object(instance.input_variables.clone()),
        );
        scope.insert("globals".to_string(), Value::Object(globals.clone()));

        let mut execution = Map::new();
        execution.insert("id".to_string(), Value::String(instance.execution_id.to_string()));
        execution.insert("workflowId".to_string(), Value::String(instance.workflow_id.clone()));
        execution.insert("version".to_string(), Value::from(instance.version));
        scope.insert("execution".to_string(), Value::Object(execution));

        let iterations: Map<String, Value> = instance
            .iterations
            .iter()
            .map(|(node, n)| (node.clone(), Value::from(*n)))
            .collect();
        scope.insert("iterations".to_string(), Value::Object(iterations));

        let results: Map<String, Value> = instance
            .node_results
            .iter()
            .map(|(key, result)| (key.clone(), result.output.clone()))
            .collect();
        scope.insert("results".to_string(), Value::Object(results));

        let latest = instance.latest_outputs();
        for (node_id, output) in &latest {
            scope.insert(node_id.to_string(), (*output).clone());
        }
        for node in &definition.nodes {
            if let (Some(var), Some(output)) = (node.output_variable(), latest.get(node.id.as_str())) {
                scope.insert(var.to_string(), (*output).clone());
            }
        }

        Self::from_map(scope)
    }

    pub fn as_value(&self) -> &Value {
        &self.scope
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.scope.get(key)
    }

    /// Evaluates an expression (a bare path is the common case).
    pub fn evaluate(&self, expression: &str) -> Result<Value, ExprError> {
        expr::evaluate(expression, &self.scope)
    }

    pub fn render(&self, template: &str) -> Result<String, ExprError> {
        expr::render_template(template, &self.scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeOutput;
    use crate::state::{HistoryKind, NodeMetrics, NodeResult};
    use crate::{ExecutionStatus, NodeSpec, NodeType};
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn layers_inputs_outputs_and_variables() {
        let def = WorkflowDefinition::new("wf", "Bindings")
            .with_node(NodeSpec::new("start", NodeType::Start).to("agentA"))
            .with_node(
                NodeSpec::new("agentA", NodeType::Agent)
                    .with_config("outputVariable", "answer")
                    .to("end"),
            )
            .with_node(NodeSpec::new("end", NodeType::End));
        let mut inputs = Map::new();
        inputs.insert("x".into(), json!(1));
        inputs.insert("region".into(), json!("input-wins"));
        let mut inst = ExecutionInstance::new(Uuid::new_v4(), &def, inputs);
        inst.set_status(ExecutionStatus::Running).unwrap();
        inst.admit("agentA", 5).unwrap();
        inst.complete_node(
            "agentA",
            1,
            "agentA".into(),
            NodeResult::from_output(NodeOutput::new(json!("42")), NodeMetrics::default()),
            HistoryKind::Completed,
        )
        .unwrap();

        let mut globals = Map::new();
        globals.insert("region".into(), json!("eu"));
        let bindings = Bindings::build(&inst, &def, &globals);

        assert_eq!(bindings.get("x"), Some(&json!(1)));
        assert_eq!(bindings.get("region"), Some(&json!("input-wins")));
        assert_eq!(bindings.evaluate("globals.region").unwrap(), json!("eu"));
        assert_eq!(bindings.evaluate("agentA").unwrap(), json!("42"));
        assert_eq!(bindings.evaluate("answer").unwrap(), json!("42"));
        assert_eq!(bindings.evaluate("iterations.agentA").unwrap(), json!(1));
        assert_eq!(bindings.evaluate("execution.workflowId").unwrap(), json!("wf"));
        assert_eq!(bindings.render("got {{ answer }}").unwrap(), "got 42");
    }
}
