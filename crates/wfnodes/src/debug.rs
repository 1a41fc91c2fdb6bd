use crate::tool::{Tool, ToolCall};
use async_trait::async_trait;
use serde_json::{Map, Value};
use wfcore::NodeError;

/// Logs its arguments and echoes the message
pub struct DebugLogTool;

#[async_trait]
impl Tool for DebugLogTool {
    fn name(&self) -> &str {
        "debug.log"
    }

    fn description(&self) -> &str {
        "Logs argument values for debugging"
    }

    async fn call(&self, call: ToolCall) -> Result<Value, NodeError> {
        let message = call
            .argument("message")
            .map(wfcore::expr::display_value)
            .unwrap_or_else(|| "(no message)".to_string());

        tracing::info!(node_id = %call.node_id, "DEBUG: {}", message);
        for (key, value) in &call.arguments {
            tracing::debug!(node_id = %call.node_id, "  {}: {}", key, value);
        }

        let mut output = Map::new();
        output.insert("message".to_string(), Value::String(message));
        Ok(Value::Object(output))
    }
}
