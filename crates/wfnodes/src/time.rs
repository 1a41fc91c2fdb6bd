use crate::tool::{Tool, ToolCall};
use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::time::{sleep, Duration};
use wfcore::NodeError;

/// Delay for a specified duration, then pass `value` through
pub struct DelayTool;

#[async_trait]
impl Tool for DelayTool {
    fn name(&self) -> &str {
        "time.delay"
    }

    fn description(&self) -> &str {
        "Delay execution for specified milliseconds"
    }

    async fn call(&self, call: ToolCall) -> Result<Value, NodeError> {
        let delay_ms = call
            .argument("delayMs")
            .and_then(Value::as_u64)
            .unwrap_or(1000); // Default to 1 second if not specified

        tracing::debug!(node_id = %call.node_id, "Delaying for {}ms", delay_ms);

        tokio::select! {
            _ = call.cancellation.cancelled() => return Err(NodeError::Cancelled),
            _ = sleep(Duration::from_millis(delay_ms)) => {}
        }

        let mut output = Map::new();
        output.insert("delayedMs".to_string(), Value::from(delay_ms));
        output.insert(
            "value".to_string(),
            call.argument("value").cloned().unwrap_or(Value::Null),
        );
        Ok(Value::Object(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn stops_early_when_cancelled() {
        let token = CancellationToken::new();
        let mut arguments = Map::new();
        arguments.insert("delayMs".into(), json!(60_000));
        let call = ToolCall {
            node_id: "wait".into(),
            arguments,
            cancellation: token.clone(),
        };
        token.cancel();
        assert!(matches!(DelayTool.call(call).await, Err(NodeError::Cancelled)));
    }
}
