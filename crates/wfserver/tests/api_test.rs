use actix_web::http::StatusCode;
use actix_web::{test, web, App};
use serde_json::{json, Value};
use std::sync::Arc;
use wfcore::{CheckpointResponse, ExecutionId, ExecutionStatus};
use wfnodes::{EchoBackend, ToolRegistry};
use wfruntime::{EngineConfig, ExecutionEngine, ExecutorRegistry, InMemoryDefinitionStore};
use wfserver::{routes, AppState};

fn state() -> web::Data<AppState> {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let tools = Arc::new(ToolRegistry::with_builtins());
    let mut registry = ExecutorRegistry::new();
    wfnodes::register_all(&mut registry, Arc::new(EchoBackend), tools.clone());
    let definitions = Arc::new(InMemoryDefinitionStore::new());
    let engine = ExecutionEngine::new(registry, definitions.clone(), EngineConfig::default());
    web::Data::new(AppState::new(engine, definitions, tools))
}

fn review_workflow() -> Value {
    json!({
        "id": "review",
        "name": "Review a draft",
        "nodes": [
            {"id": "start", "type": "start", "edges": [{"to": "agentA"}]},
            {"id": "agentA", "type": "agent", "config": {"prompt": "draft on {{ topic }}"},
             "edges": [{"to": "human1"}]},
            {"id": "human1", "type": "human", "config": {"prompt": "Ship it?"},
             "edges": [{"to": "end", "condition": "approve"}, {"to": "end", "condition": "reject"}]},
            {"id": "end", "type": "end", "config": {"output": "agentA"}}
        ]
    })
}

macro_rules! app {
    ($data:expr) => {
        test::init_service(
            App::new()
                .app_data($data.clone())
                .configure(routes::configure),
        )
        .await
    };
}

macro_rules! start_review {
    ($app:expr) => {{
        let req = test::TestRequest::post()
            .uri("/workflows/review/executions")
            .set_json(json!({"inputVariables": {"topic": "ferns"}}))
            .to_request();
        let resp = test::call_service(&$app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body: Value = test::read_body_json(resp).await;
        serde_json::from_value::<ExecutionId>(body["executionId"].clone()).unwrap()
    }};
}

macro_rules! register_review {
    ($app:expr) => {{
        let req = test::TestRequest::post()
            .uri("/workflows")
            .set_json(review_workflow())
            .to_request();
        let resp = test::call_service(&$app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
    }};
}

#[actix_web::test]
async fn health_reports_service() {
    let data = state();
    let app = app!(data);
    let req = test::TestRequest::get().uri("/health").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["status"], "healthy");
}

#[actix_web::test]
async fn workflows_can_be_registered_and_read_back() {
    let data = state();
    let app = app!(data);
    register_review!(app);

    let req = test::TestRequest::get().uri("/workflows").to_request();
    let list: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(list[0]["id"], "review");
    assert_eq!(list[0]["nodeCount"], 4);

    let req = test::TestRequest::get().uri("/workflows/review").to_request();
    let workflow: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(workflow["version"], 1);
    assert_eq!(workflow["nodes"][2]["type"], "human");

    let req = test::TestRequest::get().uri("/workflows/missing").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[actix_web::test]
async fn invalid_definition_is_a_bad_request() {
    let data = state();
    let app = app!(data);
    let no_start = json!({
        "id": "broken",
        "name": "Broken",
        "nodes": [{"id": "end", "type": "end"}]
    });
    let req = test::TestRequest::post()
        .uri("/workflows")
        .set_json(no_start)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["kind"], "definition");

    let req = test::TestRequest::post()
        .uri("/workflows/broken/executions")
        .set_json(json!({}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[actix_web::test]
async fn checkpoint_resume_over_http() {
    let data = state();
    let app = app!(data);
    register_review!(app);
    let execution_id = start_review!(app);

    let paused = data.engine.wait_settled(execution_id).await.unwrap();
    assert_eq!(paused.status, ExecutionStatus::Paused);

    let req = test::TestRequest::post()
        .uri(&format!("/executions/{}/resume", execution_id))
        .set_json(json!({"branch": "maybe"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let req = test::TestRequest::post()
        .uri(&format!("/executions/{}/resume", execution_id))
        .set_json(json!({"branch": "approve", "data": {"note": "lgtm"}}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let done = data.engine.wait_settled(execution_id).await.unwrap();
    assert_eq!(done.status, ExecutionStatus::Completed);

    let req = test::TestRequest::get()
        .uri(&format!("/executions/{}", execution_id))
        .to_request();
    let snapshot: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(snapshot["nodeResults"]["human1"]["output"]["data"]["note"], "lgtm");
    assert_eq!(snapshot["nodeResults"]["end"]["output"], "draft on ferns");

    // not paused any more
    let req = test::TestRequest::post()
        .uri(&format!("/executions/{}/resume", execution_id))
        .set_json(json!({"branch": "approve"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["kind"], "invalid_state");
}

#[actix_web::test]
async fn stream_starts_with_snapshot_and_ends_after_terminal_event() {
    let data = state();
    let app = app!(data);
    register_review!(app);
    let execution_id = start_review!(app);
    data.engine.wait_settled(execution_id).await.unwrap();

    let req = test::TestRequest::get()
        .uri(&format!("/executions/{}/stream", execution_id))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "text/event-stream"
    );

    data.engine
        .resume(execution_id, CheckpointResponse::branch("reject"))
        .await
        .unwrap();
    let body = test::read_body(resp).await;
    let text = std::str::from_utf8(&body).unwrap();

    assert!(text.contains("event: snapshot\n"));
    let snapshot_at = text.find("event: snapshot").unwrap();
    let first_delta = text.find("event: node_complete").unwrap();
    assert!(snapshot_at < first_delta);
    assert!(text.contains("\"status\":\"paused\""));
    assert!(text.contains("\"to\":\"completed\""));
}

#[actix_web::test]
async fn cancel_and_list_executions() {
    let data = state();
    let app = app!(data);
    register_review!(app);
    let cancelled = start_review!(app);
    let kept = start_review!(app);
    data.engine.wait_settled(cancelled).await.unwrap();
    data.engine.wait_settled(kept).await.unwrap();

    let req = test::TestRequest::post()
        .uri(&format!("/executions/{}/cancel", cancelled))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["status"], "cancelled");

    let req = test::TestRequest::post()
        .uri(&format!("/executions/{}/cancel", cancelled))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    let req = test::TestRequest::get()
        .uri("/executions?workflowId=review&status=paused")
        .to_request();
    let list: Value = test::call_and_read_body_json(&app, req).await;
    let rows = list.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["executionId"], kept.to_string());

    let req = test::TestRequest::get()
        .uri("/executions?workflowId=other")
        .to_request();
    let list: Value = test::call_and_read_body_json(&app, req).await;
    assert!(list.as_array().unwrap().is_empty());
}

#[actix_web::test]
async fn unknown_execution_is_not_found() {
    let data = state();
    let app = app!(data);
    let req = test::TestRequest::get()
        .uri(&format!("/executions/{}", ExecutionId::new_v4()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["kind"], "execution_not_found");
}

#[actix_web::test]
async fn node_types_cover_every_type() {
    let data = state();
    let app = app!(data);
    let req = test::TestRequest::get().uri("/node-types").to_request();
    let types: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(types.as_array().unwrap().len(), 7);

    let req = test::TestRequest::get().uri("/tools").to_request();
    let tools: Value = test::call_and_read_body_json(&app, req).await;
    assert!(tools
        .as_array()
        .unwrap()
        .iter()
        .any(|t| t["name"] == "json.parse"));
}
