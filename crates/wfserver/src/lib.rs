//! HTTP surface of the workflow engine
//!
//! Start executions, observe them as SSE or WebSocket streams, answer
//! human checkpoints and cancel runs.

pub mod config;
pub mod error;
pub mod routes;
pub mod sse;

use crate::config::{AgentBackendKind, ServerConfig};
use std::sync::Arc;
use wfnodes::{AgentBackend, EchoBackend, OpenAiBackend, ToolRegistry};
use wfruntime::{ExecutionEngine, ExecutorRegistry, InMemoryDefinitionStore};

/// Application state shared across handlers
pub struct AppState {
    pub engine: ExecutionEngine,
    pub definitions: Arc<InMemoryDefinitionStore>,
    pub tools: Arc<ToolRegistry>,
}

impl AppState {
    pub fn new(
        engine: ExecutionEngine,
        definitions: Arc<InMemoryDefinitionStore>,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            engine,
            definitions,
            tools,
        }
    }

    /// Wires the standard node library, loads definitions from
    /// `workflows_dir` and restores archived executions.
    pub async fn from_config(config: &ServerConfig) -> anyhow::Result<Self> {
        let backend: Arc<dyn AgentBackend> = match config.agent.backend {
            AgentBackendKind::Echo => Arc::new(EchoBackend),
            AgentBackendKind::Openai => Arc::new(OpenAiBackend::new(config.agent.openai())),
        };
        let tools = Arc::new(ToolRegistry::with_builtins());
        let mut registry = ExecutorRegistry::new();
        wfnodes::register_all(&mut registry, backend.clone(), tools.clone());
        tracing::info!(backend = backend.name(), "Agent backend selected");

        let definitions = Arc::new(InMemoryDefinitionStore::new());
        if let Some(dir) = &config.workflows_dir {
            let loaded = definitions.load_dir(dir).await?;
            tracing::info!(count = loaded, dir = %dir.display(), "Workflow definitions loaded");
        }

        let engine = ExecutionEngine::new(registry, definitions.clone(), config.engine.clone());
        engine.restore().await?;
        Ok(Self::new(engine, definitions, tools))
    }
}
