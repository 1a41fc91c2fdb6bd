use crate::tool::{Tool, ToolCall};
use async_trait::async_trait;
use serde_json::{Map, Value};
use wfcore::NodeError;

/// HTTP request tool
pub struct HttpRequestTool {
    client: reqwest::Client,
}

impl HttpRequestTool {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpRequestTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for HttpRequestTool {
    fn name(&self) -> &str {
        "http.request"
    }

    fn description(&self) -> &str {
        "Make HTTP requests"
    }

    async fn call(&self, call: ToolCall) -> Result<Value, NodeError> {
        let url = call.require_str("url")?;
        let method = call
            .argument("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_uppercase();

        tracing::info!(node_id = %call.node_id, "{} {}", method, url);

        let mut request = match method.as_str() {
            "GET" => self.client.get(url),
            "POST" => self.client.post(url),
            "PUT" => self.client.put(url),
            "PATCH" => self.client.patch(url),
            "DELETE" => self.client.delete(url),
            _ => return Err(NodeError::Configuration(format!("Unsupported method: {}", method))),
        };

        match call.argument("body") {
            None | Some(Value::Null) => {}
            Some(Value::String(text)) => request = request.body(text.clone()),
            Some(json) => request = request.json(json),
        }

        if let Some(Value::Object(headers)) = call.argument("headers") {
            for (key, value) in headers {
                if let Some(val_str) = value.as_str() {
                    request = request.header(key, val_str);
                }
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| NodeError::ExecutionFailed(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let headers_map: Map<String, Value> = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_str().unwrap_or("").to_string())))
            .collect();
        let is_json = headers_map
            .get("content-type")
            .and_then(Value::as_str)
            .is_some_and(|ct| ct.contains("json"));

        let body_text = response
            .text()
            .await
            .map_err(|e| NodeError::ExecutionFailed(format!("Failed to read response: {}", e)))?;

        tracing::info!(node_id = %call.node_id, status = status.as_u16(), "Response received");

        let fail_on_status = call
            .argument("failOnStatus")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if fail_on_status && !status.is_success() {
            return Err(NodeError::ExecutionFailed(format!(
                "{} {} returned {}",
                method, url, status
            )));
        }

        let body = if is_json {
            serde_json::from_str(&body_text).unwrap_or(Value::String(body_text))
        } else {
            Value::String(body_text)
        };

        let mut output = Map::new();
        output.insert("status".to_string(), Value::from(status.as_u16()));
        output.insert("body".to_string(), body);
        output.insert("headers".to_string(), Value::Object(headers_map));
        Ok(Value::Object(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn call(arguments: Value) -> ToolCall {
        ToolCall {
            node_id: "fetch".into(),
            arguments: arguments.as_object().cloned().unwrap_or_default(),
            cancellation: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn url_is_required() {
        let err = HttpRequestTool::new().call(call(json!({}))).await.unwrap_err();
        assert!(matches!(err, NodeError::MissingInput(ref field) if field == "url"));
    }

    #[tokio::test]
    async fn unsupported_method_is_a_configuration_error() {
        let err = HttpRequestTool::new()
            .call(call(json!({"url": "http://127.0.0.1:1/", "method": "brew"})))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Configuration(ref m) if m.contains("BREW")));
    }

    #[tokio::test]
    async fn connection_failure_is_an_execution_error() {
        let err = HttpRequestTool::new()
            .call(call(json!({"url": "http://127.0.0.1:1/", "method": "post", "body": {"a": 1}})))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::ExecutionFailed(ref m) if m.contains("HTTP request failed")));
    }
}
