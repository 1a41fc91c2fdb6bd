//! Execution instance state machine.
//!
//! [`ExecutionInstance`] is the durable record of one workflow run. Every
//! mutation goes through a method here; each one appends the progress
//! events it implies to an outbox that the engine drains and publishes
//! while it still holds the instance lock.

use crate::events::ExecutionEvent;
use crate::node::{CheckpointRequest, NodeOutput, TimeoutAction, TokenUsage};
use crate::{EngineError, ExecutionId, NodeId, WorkflowDefinition, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    /// Ended by a checkpoint resolution that approved the run.
    Approved,
    /// Ended by a checkpoint resolution that rejected the run.
    Rejected,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Approved | Self::Rejected
        )
    }

    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        match (self, next) {
            (Pending, Running | Failed | Cancelled) => true,
            (Running, Paused | Completed | Failed | Cancelled) => true,
            (Paused, Running | Failed | Cancelled | Approved | Rejected) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| format!("unknown execution status '{}'", s))
    }
}

/// Terminal per-node outcomes recorded in the history log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    Completed,
    Failed,
    /// A human checkpoint received its response.
    Resolved,
    /// Stopped by an explicit cancel.
    Cancelled,
    /// Stopped because a sibling failed fatally.
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub node_id: NodeId,
    pub iteration: u32,
    pub timestamp: DateTime<Utc>,
    pub event_kind: HistoryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMetrics {
    pub duration_ms: u64,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub custom: Map<String, Value>,
}

/// What `nodeResults` holds for one node iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResult {
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<NodeMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NodeResult {
    pub fn from_output(output: NodeOutput, metrics: NodeMetrics) -> Self {
        Self {
            output: output.output,
            model: output.model,
            tokens: output.tokens,
            metrics: Some(metrics),
            branch: output.branch,
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>, metrics: NodeMetrics) -> Self {
        Self {
            output: Value::Null,
            model: None,
            tokens: None,
            metrics: Some(metrics),
            branch: None,
            error: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Executor,
    LoopLimitExceeded,
    Cancellation,
    CheckpointExpired,
    Stalled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionErrorRecord {
    pub node_id: Option<NodeId>,
    pub kind: ErrorKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// A human checkpoint waiting for a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingCheckpoint {
    pub node_id: NodeId,
    pub iteration: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    pub options: Vec<String>,
    pub requested_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub timeout_action: TimeoutAction,
    /// Branches that end the run instead of routing onward.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outcomes: BTreeMap<String, ExecutionStatus>,
}

impl PendingCheckpoint {
    pub fn from_request(
        node_id: NodeId,
        iteration: u32,
        request: CheckpointRequest,
        default_ttl: Option<std::time::Duration>,
    ) -> Self {
        let requested_at = Utc::now();
        let expires_at = request
            .timeout
            .or(default_ttl)
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .map(|ttl| requested_at + ttl);
        Self {
            node_id,
            iteration,
            prompt: request.prompt,
            options: request.options,
            requested_at,
            expires_at,
            timeout_action: request.timeout_action,
            outcomes: request.outcomes,
        }
    }
}

/// Human response accepted by `resume`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointResponse {
    pub branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl CheckpointResponse {
    pub fn branch(branch: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Read model served to observers: the full state at a given event sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSnapshot {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub version: u32,
    pub status: ExecutionStatus,
    pub current_nodes: BTreeSet<NodeId>,
    pub completed_nodes: BTreeSet<NodeId>,
    pub failed_nodes: BTreeSet<NodeId>,
    pub history: Vec<HistoryEntry>,
    pub node_results: BTreeMap<String, NodeResult>,
    pub pending_checkpoint: Option<PendingCheckpoint>,
    pub errors: Vec<ExecutionErrorRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_seq: u64,
}

/// Row shape for the execution list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub version: u32,
    pub status: ExecutionStatus,
    pub current_nodes: BTreeSet<NodeId>,
    pub error_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result key for one node iteration: `nodeId`, or `nodeId_iter{N}` for
/// nodes inside a loop and for any re-run of a node outside one.
pub fn result_key(node_id: &str, iteration: u32, loop_body: bool) -> String {
    if loop_body || iteration > 1 {
        format!("{}_iter{}", node_id, iteration)
    } else {
        node_id.to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionInstance {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub version: u32,
    pub status: ExecutionStatus,
    pub input_variables: Map<String, Value>,
    pub current_nodes: BTreeSet<NodeId>,
    pub completed_nodes: BTreeSet<NodeId>,
    pub failed_nodes: BTreeSet<NodeId>,
    pub history: Vec<HistoryEntry>,
    pub node_results: BTreeMap<String, NodeResult>,
    pub pending_checkpoint: Option<PendingCheckpoint>,
    #[serde(default)]
    pub queued_checkpoints: VecDeque<PendingCheckpoint>,
    pub errors: Vec<ExecutionErrorRecord>,
    /// Iteration most recently admitted for each node.
    pub iterations: BTreeMap<NodeId, u32>,
    /// Result key of the latest recorded iteration for each node.
    #[serde(default)]
    pub latest_results: BTreeMap<NodeId, String>,
    #[serde(default)]
    pub reached_end: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_seq: u64,
    #[serde(skip)]
    outbox: Vec<ExecutionEvent>,
}

impl ExecutionInstance {
    pub fn new(
        execution_id: ExecutionId,
        definition: &WorkflowDefinition,
        input_variables: Map<String, Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            execution_id,
            workflow_id: definition.id.clone(),
            version: definition.version,
            status: ExecutionStatus::Pending,
            input_variables,
            current_nodes: BTreeSet::new(),
            completed_nodes: BTreeSet::new(),
            failed_nodes: BTreeSet::new(),
            history: Vec::new(),
            node_results: BTreeMap::new(),
            pending_checkpoint: None,
            queued_checkpoints: VecDeque::new(),
            errors: Vec::new(),
            iterations: BTreeMap::new(),
            latest_results: BTreeMap::new(),
            reached_end: false,
            created_at: now,
            updated_at: now,
            last_seq: 0,
            outbox: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn ensure_mutable(&self, operation: &'static str) -> Result<(), EngineError> {
        if self.is_terminal() {
            return Err(self.invalid_state(operation));
        }
        Ok(())
    }

    pub fn invalid_state(&self, operation: &'static str) -> EngineError {
        EngineError::InvalidState {
            execution_id: self.execution_id,
            status: self.status,
            operation,
        }
    }

    fn emit(&mut self, build: impl FnOnce(ExecutionId, u64, DateTime<Utc>) -> ExecutionEvent) {
        self.last_seq += 1;
        let now = Utc::now();
        self.updated_at = now;
        let event = build(self.execution_id, self.last_seq, now);
        self.outbox.push(event);
    }

    /// Drains events produced since the last call, in application order.
    pub fn take_events(&mut self) -> Vec<ExecutionEvent> {
        std::mem::take(&mut self.outbox)
    }

    pub fn iteration_of(&self, node_id: &str) -> u32 {
        self.iterations.get(node_id).copied().unwrap_or(0)
    }

    pub fn set_status(&mut self, next: ExecutionStatus) -> Result<(), EngineError> {
        if !self.status.can_transition_to(next) {
            return Err(self.invalid_state(match next {
                ExecutionStatus::Running => "run",
                ExecutionStatus::Paused => "pause",
                ExecutionStatus::Cancelled => "cancel",
                _ => "finish",
            }));
        }
        let from = self.status;
        self.status = next;
        tracing::debug!(
            execution_id = %self.execution_id,
            %from,
            to = %next,
            "Execution status changed"
        );
        self.emit(|execution_id, seq, timestamp| ExecutionEvent::StatusChanged {
            seq,
            execution_id,
            from,
            to: next,
            timestamp,
        });
        Ok(())
    }

    /// Puts a node on the frontier as its next iteration. Fails when the
    /// iteration would pass `ceiling`; state is left unchanged in that case.
    pub fn admit(&mut self, node_id: &str, ceiling: u32) -> Result<u32, EngineError> {
        self.ensure_mutable("admit nodes to")?;
        if self.current_nodes.contains(node_id) {
            return Ok(self.iteration_of(node_id));
        }
        let next = self.iteration_of(node_id) + 1;
        if next > ceiling {
            tracing::warn!(
                execution_id = %self.execution_id,
                node_id,
                limit = ceiling,
                "Iteration ceiling reached"
            );
            return Err(EngineError::LoopLimitExceeded {
                node_id: node_id.to_string(),
                limit: ceiling,
            });
        }
        self.iterations.insert(node_id.to_string(), next);
        self.current_nodes.insert(node_id.to_string());
        Ok(next)
    }

    pub fn mark_started(&mut self, node_id: &str, node_type: crate::NodeType, iteration: u32) {
        let node_id = node_id.to_string();
        self.emit(|execution_id, seq, timestamp| ExecutionEvent::NodeStart {
            seq,
            execution_id,
            node_id,
            node_type,
            iteration,
            timestamp,
        });
    }

    fn append_history(&mut self, node_id: &str, iteration: u32, kind: HistoryKind, key: Option<String>) {
        self.history.push(HistoryEntry {
            node_id: node_id.to_string(),
            iteration,
            timestamp: Utc::now(),
            event_kind: kind,
            result_key: key,
        });
    }

    fn store_result(&mut self, node_id: &str, key: &str, result: NodeResult) {
        self.node_results.insert(key.to_string(), result);
        self.latest_results
            .insert(node_id.to_string(), key.to_string());
    }

    /// Records a successful node (or a resolved checkpoint) and removes it
    /// from the frontier.
    pub fn complete_node(
        &mut self,
        node_id: &str,
        iteration: u32,
        key: String,
        result: NodeResult,
        kind: HistoryKind,
    ) -> Result<(), EngineError> {
        self.ensure_mutable("complete a node in")?;
        self.current_nodes.remove(node_id);
        self.completed_nodes.insert(node_id.to_string());
        let branch = result.branch.clone();
        self.store_result(node_id, &key, result);
        self.append_history(node_id, iteration, kind, Some(key.clone()));
        let node_id = node_id.to_string();
        self.emit(|execution_id, seq, timestamp| ExecutionEvent::NodeComplete {
            seq,
            execution_id,
            node_id,
            iteration,
            result_key: key,
            branch,
            error: None,
            timestamp,
        });
        Ok(())
    }

    /// Records a node failure. The error entry is always appended; status
    /// is left to the caller.
    pub fn fail_node(
        &mut self,
        node_id: &str,
        iteration: u32,
        key: String,
        error: &EngineError,
        metrics: NodeMetrics,
    ) -> Result<(), EngineError> {
        self.ensure_mutable("fail a node in")?;
        let message = error.to_string();
        self.current_nodes.remove(node_id);
        self.failed_nodes.insert(node_id.to_string());
        self.store_result(node_id, &key, NodeResult::failed(message.clone(), metrics));
        self.append_history(node_id, iteration, HistoryKind::Failed, Some(key.clone()));
        self.record_error(Some(node_id), error);
        let node_id = node_id.to_string();
        self.emit(|execution_id, seq, timestamp| ExecutionEvent::NodeComplete {
            seq,
            execution_id,
            node_id,
            iteration,
            result_key: key,
            branch: None,
            error: Some(message),
            timestamp,
        });
        Ok(())
    }

    pub fn record_error(&mut self, node_id: Option<&str>, error: &EngineError) {
        let kind = match error {
            EngineError::LoopLimitExceeded { .. } => ErrorKind::LoopLimitExceeded,
            EngineError::Cancellation { .. } => ErrorKind::Cancellation,
            _ => ErrorKind::Executor,
        };
        self.push_error(node_id, kind, error.to_string());
    }

    pub fn push_error(&mut self, node_id: Option<&str>, kind: ErrorKind, message: String) {
        self.errors.push(ExecutionErrorRecord {
            node_id: node_id.map(str::to_string),
            kind,
            message,
            timestamp: Utc::now(),
        });
        self.updated_at = Utc::now();
    }

    /// Parks the given checkpoints and pauses. The first becomes pending;
    /// the rest wait their turn.
    pub fn pause(&mut self, mut checkpoints: Vec<PendingCheckpoint>) -> Result<(), EngineError> {
        if checkpoints.is_empty() {
            return Ok(());
        }
        let first = checkpoints.remove(0);
        self.queued_checkpoints.extend(checkpoints);
        self.set_status(ExecutionStatus::Paused)?;
        self.publish_checkpoint(first);
        Ok(())
    }

    fn publish_checkpoint(&mut self, checkpoint: PendingCheckpoint) {
        self.pending_checkpoint = Some(checkpoint.clone());
        self.emit(|execution_id, seq, timestamp| ExecutionEvent::CheckpointPending {
            seq,
            execution_id,
            checkpoint,
            timestamp,
        });
    }

    /// Checks that `response` answers the pending checkpoint and returns it.
    pub fn validate_response(
        &self,
        response: &CheckpointResponse,
    ) -> Result<PendingCheckpoint, EngineError> {
        if self.status != ExecutionStatus::Paused {
            return Err(self.invalid_state("resume"));
        }
        let checkpoint = self
            .pending_checkpoint
            .clone()
            .ok_or_else(|| self.invalid_state("resume"))?;
        if response.branch.trim().is_empty() {
            return Err(EngineError::InvalidResponse("branch must not be empty".to_string()));
        }
        if !checkpoint.options.is_empty() && !checkpoint.options.contains(&response.branch) {
            return Err(EngineError::InvalidResponse(format!(
                "branch '{}' is not one of {:?}",
                response.branch, checkpoint.options
            )));
        }
        Ok(checkpoint)
    }

    /// Resolves the pending checkpoint with `response`. Leaves the instance
    /// paused on the next queued checkpoint, if any; otherwise the caller
    /// decides the next status.
    pub fn resolve_checkpoint(
        &mut self,
        key: String,
        response: &CheckpointResponse,
    ) -> Result<PendingCheckpoint, EngineError> {
        let checkpoint = self.validate_response(response)?;
        self.pending_checkpoint = None;
        let mut output = Map::new();
        output.insert("branch".to_string(), Value::String(response.branch.clone()));
        output.insert("data".to_string(), response.data.clone().unwrap_or(Value::Null));
        let result = NodeResult {
            output: Value::Object(output),
            model: None,
            tokens: None,
            metrics: Some(NodeMetrics {
                duration_ms: (Utc::now() - checkpoint.requested_at)
                    .num_milliseconds()
                    .max(0) as u64,
                attempts: 1,
                custom: Map::new(),
            }),
            branch: Some(response.branch.clone()),
            error: None,
        };
        self.complete_node(
            &checkpoint.node_id,
            checkpoint.iteration,
            key,
            result,
            HistoryKind::Resolved,
        )?;
        Ok(checkpoint)
    }

    /// Moves the next queued checkpoint into the pending slot. Returns
    /// whether one was available.
    pub fn advance_checkpoint_queue(&mut self) -> bool {
        match self.queued_checkpoints.pop_front() {
            Some(next) => {
                self.publish_checkpoint(next);
                true
            }
            None => false,
        }
    }

    /// Empties the frontier, giving every node a terminal history entry.
    fn drain_frontier(&mut self, kind: HistoryKind) -> Vec<NodeId> {
        let drained: Vec<NodeId> = std::mem::take(&mut self.current_nodes).into_iter().collect();
        for node_id in &drained {
            let iteration = self.iteration_of(node_id);
            self.append_history(node_id, iteration, kind, None);
        }
        self.pending_checkpoint = None;
        self.queued_checkpoints.clear();
        drained
    }

    /// Ends the run with `status`, aborting whatever is still on the frontier.
    pub fn finish(&mut self, status: ExecutionStatus) -> Result<(), EngineError> {
        if !self.status.can_transition_to(status) || !status.is_terminal() {
            return Err(self.invalid_state("finish"));
        }
        self.drain_frontier(HistoryKind::Aborted);
        self.set_status(status)
    }

    /// Fails the run with an instance-level error.
    pub fn fail(&mut self, node_id: Option<&str>, kind: ErrorKind, message: String) -> Result<(), EngineError> {
        self.ensure_mutable("fail")?;
        self.push_error(node_id, kind, message);
        self.finish(ExecutionStatus::Failed)
    }

    /// Records `error` and fails the run unless it already ended.
    pub fn abort(&mut self, node_id: Option<&str>, error: &EngineError) -> Result<(), EngineError> {
        self.record_error(node_id, error);
        if self.is_terminal() {
            return Ok(());
        }
        self.finish(ExecutionStatus::Failed)
    }

    /// Cancels the run. Every frontier node gets a cancellation record.
    pub fn cancel(&mut self) -> Result<Vec<NodeId>, EngineError> {
        if !self.status.can_transition_to(ExecutionStatus::Cancelled) {
            return Err(self.invalid_state("cancel"));
        }
        let cancelled = self.drain_frontier(HistoryKind::Cancelled);
        for node_id in &cancelled {
            let error = EngineError::Cancellation {
                node_id: node_id.clone(),
            };
            self.record_error(Some(node_id), &error);
        }
        self.set_status(ExecutionStatus::Cancelled)?;
        Ok(cancelled)
    }

    pub fn snapshot(&self) -> ExecutionSnapshot {
        ExecutionSnapshot {
            execution_id: self.execution_id,
            workflow_id: self.workflow_id.clone(),
            version: self.version,
            status: self.status,
            current_nodes: self.current_nodes.clone(),
            completed_nodes: self.completed_nodes.clone(),
            failed_nodes: self.failed_nodes.clone(),
            history: self.history.clone(),
            node_results: self.node_results.clone(),
            pending_checkpoint: self.pending_checkpoint.clone(),
            errors: self.errors.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            last_seq: self.last_seq,
        }
    }

    pub fn summary(&self) -> ExecutionSummary {
        ExecutionSummary {
            execution_id: self.execution_id,
            workflow_id: self.workflow_id.clone(),
            version: self.version,
            status: self.status,
            current_nodes: self.current_nodes.clone(),
            error_count: self.errors.len(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Latest output of every node, keyed by node id.
    pub fn latest_outputs(&self) -> HashMap<&str, &Value> {
        self.latest_results
            .iter()
            .filter_map(|(node_id, key)| {
                self.node_results
                    .get(key)
                    .map(|r| (node_id.as_str(), &r.output))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NodeSpec, NodeType};
    use serde_json::json;
    use uuid::Uuid;

    fn instance() -> ExecutionInstance {
        let def = WorkflowDefinition::new("wf", "Test")
            .with_node(NodeSpec::new("start", NodeType::Start).to("end"))
            .with_node(NodeSpec::new("end", NodeType::End));
        ExecutionInstance::new(Uuid::new_v4(), &def, Map::new())
    }

    fn ok(value: Value) -> NodeResult {
        NodeResult::from_output(NodeOutput::new(value), NodeMetrics::default())
    }

    #[test]
    fn status_transitions_follow_lifecycle() {
        use ExecutionStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Approved));
        assert!(!Running.can_transition_to(Approved));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Cancelled.can_transition_to(Cancelled));
        assert_eq!("paused".parse::<ExecutionStatus>().unwrap(), Paused);
        assert!("sleeping".parse::<ExecutionStatus>().is_err());
    }

    #[test]
    fn loop_iterations_keep_distinct_results() {
        let mut inst = instance();
        inst.set_status(ExecutionStatus::Running).unwrap();
        for expected in 1..=3 {
            let iteration = inst.admit("body", 10).unwrap();
            assert_eq!(iteration, expected);
            inst.complete_node(
                "body",
                iteration,
                result_key("body", iteration, true),
                ok(json!(iteration)),
                HistoryKind::Completed,
            )
            .unwrap();
        }
        let keys: Vec<_> = inst.node_results.keys().cloned().collect();
        assert_eq!(keys, vec!["body_iter1", "body_iter2", "body_iter3"]);
        assert_eq!(inst.latest_outputs()["body"], &json!(3));
        assert_eq!(inst.history.len(), 3);
    }

    #[test]
    fn reruns_outside_loops_get_their_own_keys() {
        assert_eq!(result_key("join", 1, false), "join");
        assert_eq!(result_key("join", 2, false), "join_iter2");
        assert_eq!(result_key("body", 1, true), "body_iter1");
    }

    #[test]
    fn admit_enforces_iteration_ceiling() {
        let mut inst = instance();
        inst.set_status(ExecutionStatus::Running).unwrap();
        inst.admit("body", 1).unwrap();
        inst.complete_node("body", 1, "body_iter1".into(), ok(json!(1)), HistoryKind::Completed)
            .unwrap();
        let err = inst.admit("body", 1).unwrap_err();
        assert!(matches!(err, EngineError::LoopLimitExceeded { limit: 1, .. }));
        assert!(!inst.current_nodes.contains("body"));
    }

    #[test]
    fn events_carry_increasing_sequence_numbers() {
        let mut inst = instance();
        inst.set_status(ExecutionStatus::Running).unwrap();
        inst.admit("start", 10).unwrap();
        inst.mark_started("start", NodeType::Start, 1);
        inst.complete_node("start", 1, "start".into(), ok(json!({})), HistoryKind::Completed)
            .unwrap();
        let seqs: Vec<u64> = inst.take_events().iter().map(|e| e.seq()).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert!(inst.take_events().is_empty());
        assert_eq!(inst.snapshot().last_seq, 3);
    }

    #[test]
    fn resume_requires_paused_status() {
        let mut inst = instance();
        inst.set_status(ExecutionStatus::Running).unwrap();
        let before = inst.snapshot();
        let err = inst
            .resolve_checkpoint("human1".into(), &CheckpointResponse::branch("approve"))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { .. }));
        assert_eq!(inst.snapshot(), before);
    }

    #[test]
    fn checkpoint_round_trip_validates_options() {
        let mut inst = instance();
        inst.set_status(ExecutionStatus::Running).unwrap();
        inst.admit("human1", 10).unwrap();
        let request = CheckpointRequest::new(vec!["approve".into(), "reject".into()]);
        inst.pause(vec![PendingCheckpoint::from_request("human1".into(), 1, request, None)])
            .unwrap();
        assert_eq!(inst.status, ExecutionStatus::Paused);
        assert!(inst.current_nodes.contains("human1"));

        let err = inst
            .resolve_checkpoint("human1".into(), &CheckpointResponse::branch("maybe"))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidResponse(_)));

        let resolved = inst
            .resolve_checkpoint(
                "human1".into(),
                &CheckpointResponse::branch("approve").with_data(json!({"note": "ok"})),
            )
            .unwrap();
        assert_eq!(resolved.node_id, "human1");
        assert!(inst.pending_checkpoint.is_none());
        assert!(!inst.current_nodes.contains("human1"));
        assert_eq!(inst.node_results["human1"].output["data"]["note"], "ok");
        assert_eq!(inst.history.last().unwrap().event_kind, HistoryKind::Resolved);
    }

    #[test]
    fn cancel_records_errors_and_is_terminal() {
        let mut inst = instance();
        inst.set_status(ExecutionStatus::Running).unwrap();
        inst.admit("a", 10).unwrap();
        inst.admit("b", 10).unwrap();
        let cancelled = inst.cancel().unwrap();
        assert_eq!(cancelled, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(inst.status, ExecutionStatus::Cancelled);
        assert!(inst.current_nodes.is_empty());
        assert_eq!(inst.errors.len(), 2);
        assert!(inst.errors.iter().all(|e| e.kind == ErrorKind::Cancellation));
        assert!(matches!(inst.cancel(), Err(EngineError::InvalidState { .. })));
        assert!(inst.admit("c", 10).is_err());
    }

    #[test]
    fn abort_records_the_error_and_fails_once() {
        let mut inst = instance();
        inst.set_status(ExecutionStatus::Running).unwrap();
        inst.admit("a", 10).unwrap();
        let error = EngineError::Executor {
            node_id: "a".into(),
            source: crate::NodeError::ExecutionFailed("no edge matches".into()),
        };
        inst.abort(Some("a"), &error).unwrap();
        assert_eq!(inst.status, ExecutionStatus::Failed);
        assert!(inst.current_nodes.is_empty());
        assert_eq!(inst.history.last().unwrap().event_kind, HistoryKind::Aborted);
        assert_eq!(inst.errors.len(), 1);
        assert_eq!(inst.errors[0].kind, ErrorKind::Executor);
        assert_eq!(inst.errors[0].node_id.as_deref(), Some("a"));

        // a second failure after the run ended is still recorded
        inst.abort(Some("a"), &error).unwrap();
        assert_eq!(inst.status, ExecutionStatus::Failed);
        assert_eq!(inst.errors.len(), 2);
    }
}
