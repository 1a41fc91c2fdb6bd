use crate::expr::ExprError;
use crate::state::ExecutionStatus;
use crate::{ExecutionId, NodeId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Definition error: {0}")]
    Definition(#[from] DefinitionError),

    #[error("Node '{node_id}' failed: {source}")]
    Executor {
        node_id: NodeId,
        #[source]
        source: NodeError,
    },

    #[error("Node '{node_id}' exceeded the iteration ceiling of {limit}")]
    LoopLimitExceeded { node_id: NodeId, limit: u32 },

    #[error("Cannot {operation} execution {execution_id} while it is {status}")]
    InvalidState {
        execution_id: ExecutionId,
        status: ExecutionStatus,
        operation: &'static str,
    },

    #[error("Node '{node_id}' was cancelled")]
    Cancellation { node_id: NodeId },

    #[error("Invalid checkpoint response: {0}")]
    InvalidResponse(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(ExecutionId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised by node executors. Cloneable so a failure can be both
/// recorded in state and reported to observers.
#[derive(Error, Debug, Clone)]
pub enum NodeError {
    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Invalid input type for '{field}': expected {expected}, got {actual}")]
    InvalidInputType {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Expression error: {0}")]
    Expression(#[from] ExprError),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Timeout after {millis}ms")]
    Timeout { millis: u64 },

    #[error("Cancelled")]
    Cancelled,
}

impl NodeError {
    /// Whether a retry policy may re-run the executor after this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            NodeError::Cancelled | NodeError::Configuration(_) | NodeError::UnknownTool(_)
        )
    }
}

/// A workflow graph that cannot be executed. Raised before any instance exists.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DefinitionError {
    #[error("Workflow not found: {0}")]
    NotFound(String),

    #[error("Workflow has no start node")]
    NoStartNode,

    #[error("Workflow has {0} start nodes, expected exactly one")]
    MultipleStartNodes(usize),

    #[error("No end node is reachable from the start node")]
    UnreachableEnd,

    #[error("Cycle through '{0}' has no loop-back edge")]
    UnmarkedCycle(NodeId),

    #[error("Duplicate node id: {0}")]
    DuplicateNode(NodeId),

    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("No executor registered for node type '{0}'")]
    UnknownNodeType(String),

    #[error("Invalid edge from '{from}': {reason}")]
    InvalidEdge { from: NodeId, reason: String },

    #[error("Invalid config on node '{node_id}': {reason}")]
    InvalidNodeConfig { node_id: NodeId, reason: String },
}
