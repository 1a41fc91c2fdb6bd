use crate::state::{ExecutionStatus, PendingCheckpoint};
use crate::{NodeId, NodeType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type ExecutionId = Uuid;

/// Events emitted as the engine applies mutations to an execution.
///
/// `seq` starts at 1 and increases by one per event within an execution, so
/// an observer holding a snapshot with `lastSeq = n` needs exactly the
/// events with `seq > n`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ExecutionEvent {
    NodeStart {
        seq: u64,
        execution_id: ExecutionId,
        node_id: NodeId,
        node_type: NodeType,
        iteration: u32,
        timestamp: DateTime<Utc>,
    },
    NodeComplete {
        seq: u64,
        execution_id: ExecutionId,
        node_id: NodeId,
        iteration: u32,
        result_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        branch: Option<String>,
        /// Set when the node failed but the run carried on (or is about to fail).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },
    CheckpointPending {
        seq: u64,
        execution_id: ExecutionId,
        checkpoint: PendingCheckpoint,
        timestamp: DateTime<Utc>,
    },
    StatusChanged {
        seq: u64,
        execution_id: ExecutionId,
        from: ExecutionStatus,
        to: ExecutionStatus,
        timestamp: DateTime<Utc>,
    },
}

impl ExecutionEvent {
    pub fn seq(&self) -> u64 {
        match self {
            ExecutionEvent::NodeStart { seq, .. }
            | ExecutionEvent::NodeComplete { seq, .. }
            | ExecutionEvent::CheckpointPending { seq, .. }
            | ExecutionEvent::StatusChanged { seq, .. } => *seq,
        }
    }

    pub fn execution_id(&self) -> ExecutionId {
        match self {
            ExecutionEvent::NodeStart { execution_id, .. }
            | ExecutionEvent::NodeComplete { execution_id, .. }
            | ExecutionEvent::CheckpointPending { execution_id, .. }
            | ExecutionEvent::StatusChanged { execution_id, .. } => *execution_id,
        }
    }

    /// Wire name, as used for the SSE `event:` field.
    pub fn name(&self) -> &'static str {
        match self {
            ExecutionEvent::NodeStart { .. } => "node_start",
            ExecutionEvent::NodeComplete { .. } => "node_complete",
            ExecutionEvent::CheckpointPending { .. } => "checkpoint_pending",
            ExecutionEvent::StatusChanged { .. } => "status_changed",
        }
    }

    /// Whether this event moves the execution into a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionEvent::StatusChanged { to, .. } if to.is_terminal())
    }
}
