//! Core abstractions for the workflow engine
//!
//! This crate provides the definition model, the execution state machine,
//! variable bindings and the expression language that every other crate
//! depends on. It does no I/O.

pub mod bindings;
mod error;
pub mod events;
pub mod expr;
mod node;
pub mod state;
mod workflow;

pub use bindings::Bindings;
pub use error::{DefinitionError, EngineError, NodeError};
pub use events::*;
pub use node::{
    validate_expression, CheckpointRequest, NodeContext, NodeExecutor, NodeOutcome, NodeOutput,
    TimeoutAction, TokenUsage,
};
pub use state::{
    result_key, CheckpointResponse, ErrorKind, ExecutionErrorRecord, ExecutionInstance,
    ExecutionSnapshot, ExecutionStatus, ExecutionSummary, HistoryEntry, HistoryKind, NodeMetrics,
    NodeResult, PendingCheckpoint,
};
pub use workflow::{
    Edge, EdgeKind, NodeId, NodeSpec, NodeType, RetryPolicy, WorkflowDefinition, WorkflowId,
};

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
