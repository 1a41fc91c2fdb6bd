use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use wfcore::{
    CheckpointResponse, ErrorKind, ExecutionStatus, NodeError, TokenUsage, WorkflowDefinition,
};
use wfnodes::{standard_registry, AgentBackend, ChatRequest, ChatResponse};
use wfruntime::{EngineConfig, ExecutionEngine, InMemoryDefinitionStore};

/// Answers `reply: <prompt>`; fails when the prompt mentions FAIL.
struct ScriptedBackend;

#[async_trait]
impl AgentBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, NodeError> {
        if request.prompt.contains("FAIL") {
            return Err(NodeError::ExecutionFailed("backend unavailable".into()));
        }
        Ok(ChatResponse {
            content: format!("reply: {}", request.prompt),
            model: "scripted-1".into(),
            usage: TokenUsage {
                prompt_tokens: 3,
                completion_tokens: 2,
                total_tokens: 5,
            },
        })
    }
}

async fn engine(definitions: &[&str]) -> ExecutionEngine {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let store = Arc::new(InMemoryDefinitionStore::new());
    for text in definitions {
        let definition: WorkflowDefinition = serde_json::from_str(text).unwrap();
        store.insert(definition).await;
    }
    ExecutionEngine::new(
        standard_registry(Arc::new(ScriptedBackend)),
        store,
        EngineConfig::default(),
    )
}

fn inputs(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

const LINEAR: &str = r#"{
    "id": "linear",
    "name": "Linear",
    "nodes": [
        {"id": "start", "type": "start", "edges": [{"to": "agentA"}]},
        {"id": "agentA", "type": "agent", "config": {"prompt": "Explain {{ x }}"}, "edges": [{"to": "end"}]},
        {"id": "end", "type": "end", "config": {"output": "agentA"}}
    ]
}"#;

const BRANCHING: &str = r#"{
    "id": "branching",
    "name": "Branching",
    "nodes": [
        {"id": "start", "type": "start", "edges": [{"to": "decisionD"}]},
        {"id": "decisionD", "type": "decision", "config": {"expression": "x > 0"},
         "edges": [{"to": "agentT", "condition": "true"}, {"to": "agentF", "condition": "false"}]},
        {"id": "agentT", "type": "agent", "config": {"prompt": "positive"}, "edges": [{"to": "end"}]},
        {"id": "agentF", "type": "agent", "config": {"prompt": "negative"}, "edges": [{"to": "end"}]},
        {"id": "end", "type": "end"}
    ]
}"#;

const REVIEW: &str = r#"{
    "id": "review",
    "name": "Review",
    "nodes": [
        {"id": "start", "type": "start", "edges": [{"to": "agentA"}]},
        {"id": "agentA", "type": "agent", "config": {"prompt": "Draft about {{ topic }}", "outputVariable": "draft"},
         "edges": [{"to": "human1"}]},
        {"id": "human1", "type": "human", "config": {"prompt": "Publish {{ draft }}?"},
         "edges": [{"to": "end", "condition": "approve"}, {"to": "end", "condition": "reject"}]},
        {"id": "end", "type": "end"}
    ]
}"#;

const FAILING: &str = r#"{
    "id": "failing",
    "name": "Failing",
    "nodes": [
        {"id": "start", "type": "start", "edges": [{"to": "agentA"}]},
        {"id": "agentA", "type": "agent", "config": {"prompt": "FAIL please"}, "edges": [{"to": "after"}]},
        {"id": "after", "type": "transform", "config": {"template": "never"}, "edges": [{"to": "end"}]},
        {"id": "end", "type": "end"}
    ]
}"#;

const PIPELINE: &str = r#"{
    "id": "pipeline",
    "name": "Tool pipeline",
    "nodes": [
        {"id": "start", "type": "start", "edges": [{"to": "parse"}]},
        {"id": "parse", "type": "tool",
         "config": {"tool": "json.parse", "arguments": {"json": "{{ raw }}"}},
         "edges": [{"to": "shape"}]},
        {"id": "shape", "type": "transform",
         "config": {"mappings": {"total": "parse.price * parse.qty", "label": "parse.name | upper"}},
         "edges": [{"to": "end"}]},
        {"id": "end", "type": "end", "config": {"output": {"total": "shape.total", "label": "shape.label"}}}
    ]
}"#;

const COUNTER: &str = r#"{
    "id": "counter",
    "name": "Counter",
    "nodes": [
        {"id": "start", "type": "start", "edges": [{"to": "body"}]},
        {"id": "body", "type": "transform", "config": {"mappings": {"n": "iterations.body"}},
         "edges": [{"to": "check"}]},
        {"id": "check", "type": "decision", "config": {"expression": "body.n < limit"},
         "edges": [{"to": "body", "condition": "true", "kind": "loop_back"}, {"to": "end", "condition": "false"}]},
        {"id": "end", "type": "end", "config": {"output": "body.n"}}
    ]
}"#;

#[tokio::test]
async fn scenario_linear_agent_run() {
    let engine = engine(&[LINEAR]).await;
    let id = engine.start("linear", inputs(json!({"x": 1}))).await.unwrap();
    let snapshot = engine.wait_settled(id).await.unwrap();

    assert_eq!(snapshot.status, ExecutionStatus::Completed);
    let agent = &snapshot.node_results["agentA"];
    assert_eq!(agent.output, json!("reply: Explain 1"));
    assert_eq!(agent.model.as_deref(), Some("scripted-1"));
    assert_eq!(agent.tokens.as_ref().unwrap().total_tokens, 5);
    assert_eq!(snapshot.node_results["end"].output, json!("reply: Explain 1"));
    assert_eq!(snapshot.history.len(), 3);
}

#[tokio::test]
async fn scenario_decision_branch() {
    let engine = engine(&[BRANCHING]).await;
    let id = engine.start("branching", inputs(json!({"x": 5}))).await.unwrap();
    let snapshot = engine.wait_settled(id).await.unwrap();

    assert_eq!(snapshot.status, ExecutionStatus::Completed);
    assert!(snapshot.completed_nodes.contains("agentT"));
    assert!(!snapshot.completed_nodes.contains("agentF"));
    assert!(snapshot.history.iter().all(|h| h.node_id != "agentF"));
}

#[tokio::test]
async fn scenario_human_checkpoint() {
    let engine = engine(&[REVIEW]).await;
    let id = engine.start("review", inputs(json!({"topic": "tides"}))).await.unwrap();
    let paused = engine.wait_settled(id).await.unwrap();

    assert_eq!(paused.status, ExecutionStatus::Paused);
    let checkpoint = paused.pending_checkpoint.unwrap();
    assert_eq!(checkpoint.node_id, "human1");
    assert_eq!(
        checkpoint.prompt.as_deref(),
        Some("Publish reply: Draft about tides?")
    );

    let status = engine
        .resume(id, CheckpointResponse::branch("approve"))
        .await
        .unwrap();
    assert_eq!(status, ExecutionStatus::Running);
    let done = engine.wait_settled(id).await.unwrap();
    assert_eq!(done.status, ExecutionStatus::Completed);
    assert_eq!(done.node_results["human1"].output["branch"], "approve");
}

#[tokio::test]
async fn scenario_agent_failure() {
    let engine = engine(&[FAILING]).await;
    let id = engine.start("failing", Map::new()).await.unwrap();
    let snapshot = engine.wait_settled(id).await.unwrap();

    assert_eq!(snapshot.status, ExecutionStatus::Failed);
    assert_eq!(snapshot.errors.len(), 1);
    assert_eq!(snapshot.errors[0].node_id.as_deref(), Some("agentA"));
    assert_eq!(snapshot.errors[0].kind, ErrorKind::Executor);
    assert!(snapshot.errors[0].message.contains("backend unavailable"));
    assert!(snapshot.current_nodes.is_empty());
    assert!(!snapshot.node_results.contains_key("after"));
}

#[tokio::test]
async fn tool_and_transform_pipeline() {
    let engine = engine(&[PIPELINE]).await;
    let raw = json!({"price": 4, "qty": 3, "name": "bolt"}).to_string();
    let id = engine.start("pipeline", inputs(json!({"raw": raw}))).await.unwrap();
    let snapshot = engine.wait_settled(id).await.unwrap();

    assert_eq!(snapshot.status, ExecutionStatus::Completed);
    assert_eq!(snapshot.node_results["end"].output, json!({"total": 12, "label": "BOLT"}));
    let metrics = snapshot.node_results["parse"].metrics.as_ref().unwrap();
    assert_eq!(metrics.custom["tool"], "json.parse");
}

#[tokio::test]
async fn loop_counts_iterations() {
    let engine = engine(&[COUNTER]).await;
    let id = engine.start("counter", inputs(json!({"limit": 4}))).await.unwrap();
    let snapshot = engine.wait_settled(id).await.unwrap();

    assert_eq!(snapshot.status, ExecutionStatus::Completed);
    assert_eq!(snapshot.node_results["end"].output, json!(4));
    assert_eq!(snapshot.node_results["body_iter4"].output, json!({"n": 4}));
    assert_eq!(snapshot.node_results["check_iter4"].branch.as_deref(), Some("false"));
}

#[tokio::test]
async fn invalid_node_config_is_a_definition_error() {
    let broken = LINEAR.replace(r#""config": {"prompt": "Explain {{ x }}"}, "#, "");
    let engine = engine(&[broken.as_str()]).await;
    let err = engine.start("linear", Map::new()).await.unwrap_err();
    assert!(err.to_string().contains("prompt"));
}
