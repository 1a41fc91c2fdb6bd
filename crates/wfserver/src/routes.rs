use crate::error::ApiError;
use crate::sse::Event;
use crate::AppState;
use actix_web::http::header;
use actix_web::{
    get, post, web, HttpRequest, HttpResponse, Responder, Result as ActixResult,
};
use actix_ws::Message;
use futures::{future, stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::convert::Infallible;
use tracing::{debug, info, warn};
use wfcore::{
    CheckpointResponse, DefinitionError, EngineError, ExecutionId, ExecutionStatus,
    WorkflowDefinition,
};
use wfruntime::{DefinitionStore, ExecutionFilter, ExecutionSubscription};

type ApiResult<T> = Result<T, ApiError>;

/// Request body for starting an execution
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartRequest {
    #[serde(default)]
    input_variables: Map<String, Value>,
    /// Pin a definition version; the latest one otherwise.
    #[serde(default)]
    version: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartResponse {
    execution_id: ExecutionId,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecutionResponse {
    execution_id: ExecutionId,
    status: ExecutionStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WorkflowSummary {
    id: String,
    version: u32,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    node_count: usize,
}

#[derive(Debug, Deserialize)]
struct VersionQuery {
    version: Option<u32>,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health_check)
        .service(list_workflows)
        .service(create_workflow)
        .service(get_workflow)
        .service(start_execution)
        .service(list_executions)
        .service(get_execution)
        .service(stream_execution)
        .service(execution_socket)
        .service(resume_execution)
        .service(cancel_execution)
        .service(list_node_types)
        .service(list_tools);
}

/// Health check endpoint
#[get("/health")]
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "wfserver"
    }))
}

#[get("/workflows")]
async fn list_workflows(data: web::Data<AppState>) -> impl Responder {
    let workflows: Vec<_> = data
        .definitions
        .list()
        .await
        .iter()
        .map(|w| WorkflowSummary {
            id: w.id.clone(),
            version: w.version,
            name: w.name.clone(),
            description: w.description.clone(),
            node_count: w.nodes.len(),
        })
        .collect();
    HttpResponse::Ok().json(workflows)
}

/// Registers a definition after checking its graph and node configs.
#[post("/workflows")]
async fn create_workflow(
    data: web::Data<AppState>,
    workflow: web::Json<WorkflowDefinition>,
) -> ApiResult<HttpResponse> {
    let workflow = workflow.into_inner();
    data.engine.validate(&workflow)?;
    let stored = data.definitions.insert(workflow).await;
    info!(workflow_id = %stored.id, version = stored.version, "Workflow registered");
    Ok(HttpResponse::Created().json(serde_json::json!({
        "id": stored.id,
        "version": stored.version,
    })))
}

#[get("/workflows/{workflow_id}")]
async fn get_workflow(
    data: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<VersionQuery>,
) -> ApiResult<HttpResponse> {
    let workflow_id = path.into_inner();
    let workflow = data
        .definitions
        .get(&workflow_id, query.version)
        .await
        .ok_or(DefinitionError::NotFound(workflow_id))?;
    Ok(HttpResponse::Ok().json(workflow.as_ref()))
}

#[post("/workflows/{workflow_id}/executions")]
async fn start_execution(
    data: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<StartRequest>,
) -> ApiResult<HttpResponse> {
    let workflow_id = path.into_inner();
    let StartRequest {
        input_variables,
        version,
    } = body.into_inner();
    let execution_id = match version {
        Some(version) => {
            data.engine
                .start_version(&workflow_id, version, input_variables)
                .await?
        }
        None => data.engine.start(&workflow_id, input_variables).await?,
    };
    info!(%execution_id, %workflow_id, "Execution started");
    Ok(HttpResponse::Created().json(StartResponse { execution_id }))
}

#[get("/executions")]
async fn list_executions(
    data: web::Data<AppState>,
    filter: web::Query<ExecutionFilter>,
) -> impl Responder {
    HttpResponse::Ok().json(data.engine.list(&filter).await)
}

#[get("/executions/{execution_id}")]
async fn get_execution(
    data: web::Data<AppState>,
    path: web::Path<ExecutionId>,
) -> ApiResult<HttpResponse> {
    let snapshot = data.engine.snapshot(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(snapshot))
}

/// Snapshot first, then every event applied after it, as SSE. The stream
/// ends after the terminal status change.
#[get("/executions/{execution_id}/stream")]
async fn stream_execution(
    data: web::Data<AppState>,
    path: web::Path<ExecutionId>,
) -> ApiResult<HttpResponse> {
    let execution_id = path.into_inner();
    let ExecutionSubscription { snapshot, events } = data.engine.subscribe(execution_id).await?;
    let head = Event::snapshot(&snapshot).map_err(EngineError::from)?;
    debug!(%execution_id, last_seq = snapshot.last_seq, "SSE observer attached");

    let tail = events.filter_map(move |event| {
        future::ready(match Event::execution(&event) {
            Ok(sse) => Some(sse),
            Err(e) => {
                warn!(%execution_id, seq = event.seq(), error = %e, "Dropping unserialisable event");
                None
            }
        })
    });
    let body = stream::once(future::ready(head))
        .chain(tail)
        .map(|event| Ok::<_, Infallible>(web::Bytes::from(event.to_string())));

    Ok(HttpResponse::Ok()
        .insert_header((header::CONTENT_TYPE, "text/event-stream"))
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .streaming(body))
}

/// Same stream as `/stream`, over a WebSocket.
#[get("/executions/{execution_id}/ws")]
async fn execution_socket(
    req: HttpRequest,
    stream: web::Payload,
    data: web::Data<AppState>,
    path: web::Path<ExecutionId>,
) -> ActixResult<HttpResponse> {
    let execution_id = path.into_inner();
    let ExecutionSubscription {
        snapshot,
        mut events,
    } = data
        .engine
        .subscribe(execution_id)
        .await
        .map_err(ApiError::from)?;
    let (res, mut session, mut msg_stream) = actix_ws::handle(&req, stream)?;

    info!(%execution_id, "WebSocket observer connected");

    actix_web::rt::spawn(async move {
        let hello = serde_json::json!({ "type": "snapshot", "snapshot": snapshot });
        if session.text(hello.to_string()).await.is_err() {
            return;
        }
        loop {
            tokio::select! {
                event = events.next() => {
                    let Some(event) = event else { break };
                    if let Ok(json) = serde_json::to_string(&event) {
                        if session.text(json).await.is_err() {
                            break;
                        }
                    }
                }

                Some(Ok(msg)) = msg_stream.recv() => {
                    match msg {
                        Message::Ping(bytes) => {
                            if session.pong(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }

                else => break,
            }
        }

        info!(%execution_id, "WebSocket observer disconnected");
        let _ = session.close(None).await;
    });

    Ok(res)
}

#[post("/executions/{execution_id}/resume")]
async fn resume_execution(
    data: web::Data<AppState>,
    path: web::Path<ExecutionId>,
    body: web::Json<CheckpointResponse>,
) -> ApiResult<HttpResponse> {
    let execution_id = path.into_inner();
    let status = data.engine.resume(execution_id, body.into_inner()).await?;
    Ok(HttpResponse::Ok().json(ExecutionResponse {
        execution_id,
        status,
    }))
}

#[post("/executions/{execution_id}/cancel")]
async fn cancel_execution(
    data: web::Data<AppState>,
    path: web::Path<ExecutionId>,
) -> ApiResult<HttpResponse> {
    let execution_id = path.into_inner();
    let status = data.engine.cancel(execution_id).await?;
    Ok(HttpResponse::Ok().json(ExecutionResponse {
        execution_id,
        status,
    }))
}

/// List available node types
#[get("/node-types")]
async fn list_node_types(data: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(data.engine.registry().list())
}

#[get("/tools")]
async fn list_tools(data: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(data.tools.list())
}
