use crate::tool::{Tool, ToolCall};
use async_trait::async_trait;
use serde_json::Value;
use wfcore::NodeError;

/// Parse a JSON string into a value
pub struct JsonParseTool;

#[async_trait]
impl Tool for JsonParseTool {
    fn name(&self) -> &str {
        "json.parse"
    }

    fn description(&self) -> &str {
        "Parse JSON string"
    }

    async fn call(&self, call: ToolCall) -> Result<Value, NodeError> {
        let input = call.require_str("json")?;
        serde_json::from_str(input)
            .map_err(|e| NodeError::ExecutionFailed(format!("JSON parse error: {}", e)))
    }
}

/// Serialize a value to a JSON string
pub struct JsonStringifyTool;

#[async_trait]
impl Tool for JsonStringifyTool {
    fn name(&self) -> &str {
        "json.stringify"
    }

    fn description(&self) -> &str {
        "Convert value to JSON string"
    }

    async fn call(&self, call: ToolCall) -> Result<Value, NodeError> {
        let value = call.require("value")?;
        let pretty = call
            .argument("pretty")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let json_str = if pretty {
            serde_json::to_string_pretty(value)
        } else {
            serde_json::to_string(value)
        }
        .map_err(|e| NodeError::ExecutionFailed(format!("JSON stringify error: {}", e)))?;
        Ok(Value::String(json_str))
    }
}
