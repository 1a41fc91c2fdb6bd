//! Standard node library
//!
//! One executor per node type, the agent backends, and the built-in tools
//! that `tool` nodes can call.

mod agent;
mod control;
mod debug;
mod decision;
mod http;
mod human;
mod json;
mod time;
mod tool;
mod transform;

pub use agent::{
    AgentBackend, AgentExecutor, ChatRequest, ChatResponse, EchoBackend, OpenAiBackend,
    OpenAiConfig,
};
pub use control::{EndExecutor, StartExecutor};
pub use debug::DebugLogTool;
pub use decision::{branch_label, DecisionExecutor};
pub use http::HttpRequestTool;
pub use human::HumanExecutor;
pub use json::{JsonParseTool, JsonStringifyTool};
pub use time::DelayTool;
pub use tool::{resolve_arguments, Tool, ToolCall, ToolExecutor, ToolMetadata, ToolRegistry};
pub use transform::TransformExecutor;

use std::sync::Arc;
use wfruntime::ExecutorRegistry;

/// Register all standard executors with a registry
pub fn register_all(
    registry: &mut ExecutorRegistry,
    backend: Arc<dyn AgentBackend>,
    tools: Arc<ToolRegistry>,
) {
    registry.register(Arc::new(StartExecutor));
    registry.register(Arc::new(EndExecutor));
    registry.register(Arc::new(AgentExecutor::new(backend)));
    registry.register(Arc::new(ToolExecutor::new(tools)));
    registry.register(Arc::new(DecisionExecutor));
    registry.register(Arc::new(HumanExecutor));
    registry.register(Arc::new(TransformExecutor));
}

/// Registry with every node type and the built-in tools.
pub fn standard_registry(backend: Arc<dyn AgentBackend>) -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();
    register_all(&mut registry, backend, Arc::new(ToolRegistry::with_builtins()));
    registry
}
