//! `agent` nodes: prompt an LLM backend and record its answer.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use wfcore::{
    NodeContext, NodeError, NodeExecutor, NodeOutcome, NodeOutput, NodeSpec, NodeType, TokenUsage,
};

#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub prompt: String,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
    /// Ask the backend for a JSON object answer.
    pub json: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
    pub usage: TokenUsage,
}

/// Something that can answer a chat prompt.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, NodeError>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub default_model: String,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            default_model: "gpt-4o-mini".to_string(),
        }
    }
}

/// OpenAI-compatible chat completions over HTTP.
pub struct OpenAiBackend {
    config: OpenAiConfig,
    client: reqwest::Client,
}

impl OpenAiBackend {
    pub fn new(config: OpenAiConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn build_payload(&self, request: &ChatRequest) -> Value {
        let mut messages = Vec::new();
        if let Some(system) = &request.system_prompt {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": request.prompt}));

        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.config.default_model.clone());
        let mut payload = json!({
            "model": model,
            "messages": messages,
        });
        if let Some(temperature) = request.temperature {
            payload["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = request.max_tokens {
            payload["max_tokens"] = json!(max_tokens);
        }
        if request.json {
            payload["response_format"] = json!({"type": "json_object"});
        }
        payload
    }
}

fn parse_usage(body: &Value) -> TokenUsage {
    let usage = body.get("usage").cloned().unwrap_or(Value::Null);
    let field = |name: &str| usage.get(name).and_then(Value::as_u64).unwrap_or(0);
    TokenUsage {
        prompt_tokens: field("prompt_tokens"),
        completion_tokens: field("completion_tokens"),
        total_tokens: field("total_tokens"),
    }
}

fn parse_response(body: &Value) -> Result<ChatResponse, NodeError> {
    let content = body
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .ok_or_else(|| NodeError::ExecutionFailed("LLM response has no message content".to_string()))?
        .to_string();
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    Ok(ChatResponse {
        content,
        model,
        usage: parse_usage(body),
    })
}

#[async_trait]
impl AgentBackend for OpenAiBackend {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, NodeError> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let mut http = self.client.post(&url).json(&self.build_payload(&request));
        if let Some(key) = &self.config.api_key {
            http = http.bearer_auth(key);
        }
        let response = http
            .send()
            .await
            .map_err(|e| NodeError::ExecutionFailed(format!("LLM request failed: {}", e)))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| NodeError::ExecutionFailed(format!("Failed to read LLM response: {}", e)))?;
        if !status.is_success() {
            return Err(NodeError::ExecutionFailed(format!(
                "LLM API returned {}: {}",
                status, text
            )));
        }
        let body: Value = serde_json::from_str(&text)
            .map_err(|e| NodeError::ExecutionFailed(format!("LLM response is not JSON: {}", e)))?;
        parse_response(&body)
    }
}

/// Offline backend that answers with the prompt it was given.
pub struct EchoBackend;

#[async_trait]
impl AgentBackend for EchoBackend {
    fn name(&self) -> &str {
        "echo"
    }

    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, NodeError> {
        let words = request.prompt.split_whitespace().count() as u64;
        let content = if request.json {
            json!({ "prompt": request.prompt }).to_string()
        } else {
            request.prompt.clone()
        };
        Ok(ChatResponse {
            content,
            model: request.model.unwrap_or_else(|| "echo".to_string()),
            usage: TokenUsage {
                prompt_tokens: words,
                completion_tokens: words,
                total_tokens: words * 2,
            },
        })
    }
}

/// Strips a surrounding markdown code fence, if any.
fn strip_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_suffix("```").unwrap_or(inner);
    match inner.find('\n') {
        Some(newline) => inner[newline + 1..].trim(),
        None => inner.trim(),
    }
}

pub struct AgentExecutor {
    backend: Arc<dyn AgentBackend>,
}

impl AgentExecutor {
    pub fn new(backend: Arc<dyn AgentBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl NodeExecutor for AgentExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::Agent
    }

    fn description(&self) -> &str {
        "Sends a templated prompt to the configured LLM backend"
    }

    fn validate_config(&self, spec: &NodeSpec) -> Result<(), NodeError> {
        match spec.config.get("prompt") {
            Some(Value::String(_)) => {}
            Some(_) => return Err(NodeError::Configuration("prompt must be a string".to_string())),
            None => return Err(NodeError::Configuration("Missing config: prompt".to_string())),
        }
        match spec.config.get("responseFormat").and_then(Value::as_str) {
            None | Some("text") | Some("json") => Ok(()),
            Some(other) => Err(NodeError::Configuration(format!(
                "unknown responseFormat '{}'",
                other
            ))),
        }
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutcome, NodeError> {
        let prompt = ctx
            .render("prompt")?
            .ok_or_else(|| NodeError::Configuration("Missing config: prompt".to_string()))?;
        let json_format = ctx.config_str("responseFormat") == Some("json");
        let request = ChatRequest {
            model: ctx.config_str("model").map(str::to_string),
            system_prompt: ctx.render("systemPrompt")?,
            prompt,
            temperature: ctx.config.get("temperature").and_then(Value::as_f64),
            max_tokens: ctx.config.get("maxTokens").and_then(Value::as_u64),
            json: json_format,
        };

        tracing::debug!(
            node_id = %ctx.node_id,
            iteration = ctx.iteration,
            backend = self.backend.name(),
            "Calling agent backend"
        );
        let response = self.backend.complete(request).await?;

        let output = if json_format {
            serde_json::from_str(strip_fence(&response.content)).map_err(|e| {
                NodeError::ExecutionFailed(format!("agent returned invalid JSON: {}", e))
            })?
        } else {
            Value::String(response.content)
        };
        Ok(NodeOutput::new(output)
            .with_model(response.model)
            .with_tokens(response.usage)
            .with_metric("backend", self.backend.name())
            .into())
    }
}
