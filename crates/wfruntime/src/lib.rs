//! Workflow execution runtime
//!
//! This crate provides the execution engine that runs workflow instances,
//! the executor registry, graph validation and routing, the progress
//! publisher, and the definition and execution stores.

mod config;
mod engine;
mod graph;
mod publisher;
mod registry;
mod store;

pub use config::EngineConfig;
pub use engine::{ExecutionEngine, ExecutionSubscription};
pub use graph::{successors, Route, WorkflowGraph};
pub use publisher::ProgressPublisher;
pub use registry::{ExecutorRegistry, NodeMetadata};
pub use store::{
    DefinitionStore, ExecutionFilter, ExecutionHandle, ExecutionStore, InMemoryDefinitionStore,
};
