use crate::graph::WorkflowGraph;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use wfcore::{
    EngineError, ErrorKind, ExecutionId, ExecutionInstance, ExecutionStatus, ExecutionSummary,
    WorkflowDefinition,
};

/// Read-only source of workflow definitions.
#[async_trait]
pub trait DefinitionStore: Send + Sync {
    /// A specific version, or the highest one when `version` is `None`.
    async fn get(&self, workflow_id: &str, version: Option<u32>) -> Option<Arc<WorkflowDefinition>>;

    /// Latest version of every workflow.
    async fn list(&self) -> Vec<Arc<WorkflowDefinition>>;
}

#[derive(Default)]
pub struct InMemoryDefinitionStore {
    workflows: RwLock<HashMap<(String, u32), Arc<WorkflowDefinition>>>,
}

impl InMemoryDefinitionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow definition. Re-registering a version replaces it.
    pub async fn insert(&self, definition: WorkflowDefinition) -> Arc<WorkflowDefinition> {
        let definition = Arc::new(definition);
        let mut workflows = self.workflows.write().await;
        workflows.insert(
            (definition.id.clone(), definition.version),
            definition.clone(),
        );
        definition
    }

    /// Loads every `*.json` file in `dir` as a workflow definition.
    pub async fn load_dir(&self, dir: &Path) -> Result<usize, EngineError> {
        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut loaded = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension() != Some("json".as_ref()) {
                continue;
            }
            let text = tokio::fs::read_to_string(&path).await?;
            let definition: WorkflowDefinition = serde_json::from_str(&text)?;
            tracing::info!(
                workflow_id = %definition.id,
                version = definition.version,
                path = %path.display(),
                "Loaded workflow definition"
            );
            self.insert(definition).await;
            loaded += 1;
        }
        Ok(loaded)
    }
}

#[async_trait]
impl DefinitionStore for InMemoryDefinitionStore {
    async fn get(&self, workflow_id: &str, version: Option<u32>) -> Option<Arc<WorkflowDefinition>> {
        let workflows = self.workflows.read().await;
        match version {
            Some(v) => workflows.get(&(workflow_id.to_string(), v)).cloned(),
            None => workflows
                .values()
                .filter(|d| d.id == workflow_id)
                .max_by_key(|d| d.version)
                .cloned(),
        }
    }

    async fn list(&self) -> Vec<Arc<WorkflowDefinition>> {
        let workflows = self.workflows.read().await;
        let mut latest: HashMap<&str, &Arc<WorkflowDefinition>> = HashMap::new();
        for definition in workflows.values() {
            let entry = latest.entry(definition.id.as_str()).or_insert(definition);
            if definition.version > entry.version {
                *entry = definition;
            }
        }
        let mut list: Vec<_> = latest.into_values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }
}

/// Everything the engine keeps for one execution.
///
/// `state` is locked only for short, non-blocking mutations; executor calls
/// happen outside it. `advance_lock` serialises whole steps.
pub struct ExecutionHandle {
    pub(crate) definition: Arc<WorkflowDefinition>,
    pub(crate) graph: Arc<WorkflowGraph>,
    pub(crate) state: Mutex<ExecutionInstance>,
    pub(crate) advance_lock: Mutex<()>,
    pub(crate) cancellation: CancellationToken,
    status: watch::Sender<ExecutionStatus>,
}

impl ExecutionHandle {
    pub(crate) fn new(
        definition: Arc<WorkflowDefinition>,
        graph: Arc<WorkflowGraph>,
        instance: ExecutionInstance,
    ) -> Self {
        let (status, _) = watch::channel(instance.status);
        Self {
            definition,
            graph,
            state: Mutex::new(instance),
            advance_lock: Mutex::new(()),
            cancellation: CancellationToken::new(),
            status,
        }
    }

    pub(crate) fn notify_status(&self, status: ExecutionStatus) {
        self.status.send_replace(status);
    }

    pub(crate) fn watch_status(&self) -> watch::Receiver<ExecutionStatus> {
        self.status.subscribe()
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }
}

/// Query for the execution list.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionFilter {
    pub workflow_id: Option<String>,
    pub status: Option<ExecutionStatus>,
}

impl ExecutionFilter {
    fn matches(&self, summary: &ExecutionSummary) -> bool {
        self.workflow_id
            .as_ref()
            .map_or(true, |w| *w == summary.workflow_id)
            && self.status.map_or(true, |s| s == summary.status)
    }
}

/// Process-wide, instance-partitioned store of executions.
pub struct ExecutionStore {
    executions: RwLock<HashMap<ExecutionId, Arc<ExecutionHandle>>>,
    archive_dir: Option<PathBuf>,
}

impl ExecutionStore {
    pub fn new(archive_dir: Option<PathBuf>) -> Self {
        Self {
            executions: RwLock::new(HashMap::new()),
            archive_dir,
        }
    }

    pub(crate) async fn insert(&self, handle: Arc<ExecutionHandle>) -> Arc<ExecutionHandle> {
        let execution_id = handle.state.lock().await.execution_id;
        self.executions
            .write()
            .await
            .insert(execution_id, handle.clone());
        handle
    }

    pub async fn get(&self, execution_id: ExecutionId) -> Result<Arc<ExecutionHandle>, EngineError> {
        self.executions
            .read()
            .await
            .get(&execution_id)
            .cloned()
            .ok_or(EngineError::ExecutionNotFound(execution_id))
    }

    /// Summaries matching `filter`, newest first.
    pub async fn list(&self, filter: &ExecutionFilter) -> Vec<ExecutionSummary> {
        let handles: Vec<_> = self.executions.read().await.values().cloned().collect();
        let mut summaries = Vec::with_capacity(handles.len());
        for handle in handles {
            let summary = handle.state.lock().await.summary();
            if filter.matches(&summary) {
                summaries.push(summary);
            }
        }
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        summaries
    }

    fn record_path(dir: &Path, execution_id: ExecutionId) -> PathBuf {
        dir.join(format!("{}.json", execution_id))
    }

    /// Writes the instance record when an archive directory is configured.
    pub(crate) async fn persist(&self, instance: &ExecutionInstance) -> Result<(), EngineError> {
        let Some(dir) = &self.archive_dir else {
            return Ok(());
        };
        tokio::fs::create_dir_all(dir).await?;
        let path = Self::record_path(dir, instance.execution_id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(instance)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Reloads archived records. Runs interrupted mid-step cannot be
    /// resumed and are marked failed; paused and finished runs come back
    /// as they were.
    pub async fn load_archive(&self, definitions: &dyn DefinitionStore) -> Result<usize, EngineError> {
        let Some(dir) = &self.archive_dir else {
            return Ok(0);
        };
        if !tokio::fs::try_exists(dir).await? {
            return Ok(0);
        }
        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut loaded = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension() != Some("json".as_ref()) {
                continue;
            }
            let text = tokio::fs::read_to_string(&path).await?;
            let mut instance: ExecutionInstance = match serde_json::from_str(&text) {
                Ok(instance) => instance,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable execution record");
                    continue;
                }
            };
            let Some(definition) = definitions
                .get(&instance.workflow_id, Some(instance.version))
                .await
            else {
                tracing::warn!(
                    execution_id = %instance.execution_id,
                    workflow_id = %instance.workflow_id,
                    "Skipping execution record for unknown workflow version"
                );
                continue;
            };
            let graph = Arc::new(WorkflowGraph::build(&definition)?);
            if matches!(instance.status, ExecutionStatus::Pending | ExecutionStatus::Running) {
                instance.fail(
                    None,
                    ErrorKind::Stalled,
                    "execution was interrupted by a restart".to_string(),
                )?;
                instance.take_events();
                self.persist(&instance).await?;
            }
            self.insert(Arc::new(ExecutionHandle::new(definition, graph, instance)))
                .await;
            loaded += 1;
        }
        Ok(loaded)
    }
}
