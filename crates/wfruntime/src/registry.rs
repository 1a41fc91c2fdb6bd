use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use wfcore::{DefinitionError, NodeExecutor, NodeType, WorkflowDefinition};

/// Metadata about a node type
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMetadata {
    pub node_type: NodeType,
    pub description: String,
}

/// One executor per node type. Dispatch is a lookup on the node's
/// declared [`NodeType`]; there is no string-keyed plugin surface.
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: BTreeMap<NodeType, Arc<dyn NodeExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: BTreeMap::new(),
        }
    }

    /// Register an executor, replacing any previous one for the same type
    pub fn register(&mut self, executor: Arc<dyn NodeExecutor>) {
        let node_type = executor.node_type();
        tracing::info!("Registering executor for node type: {}", node_type);
        self.executors.insert(node_type, executor);
    }

    pub fn with(mut self, executor: impl NodeExecutor + 'static) -> Self {
        self.register(Arc::new(executor));
        self
    }

    pub fn get(&self, node_type: NodeType) -> Result<&Arc<dyn NodeExecutor>, DefinitionError> {
        self.executors
            .get(&node_type)
            .ok_or_else(|| DefinitionError::UnknownNodeType(node_type.to_string()))
    }

    /// Node types that still lack an executor.
    pub fn missing_types(&self) -> Vec<NodeType> {
        NodeType::ALL
            .into_iter()
            .filter(|t| !self.executors.contains_key(t))
            .collect()
    }

    /// Checks that every node has an executor and passes its config checks.
    pub fn validate(&self, definition: &WorkflowDefinition) -> Result<(), DefinitionError> {
        for node in &definition.nodes {
            let executor = self.get(node.node_type)?;
            executor
                .validate_config(node)
                .map_err(|e| DefinitionError::InvalidNodeConfig {
                    node_id: node.id.clone(),
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    }

    pub fn list(&self) -> Vec<NodeMetadata> {
        self.executors
            .values()
            .map(|e| NodeMetadata {
                node_type: e.node_type(),
                description: e.description().to_string(),
            })
            .collect()
    }
}
