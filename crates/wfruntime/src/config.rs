use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the execution engine
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on frontier nodes dispatched at once within one step.
    pub max_parallel_nodes: usize,
    /// Hard ceiling on iterations of any single node; nodes may lower or
    /// raise it with `maxIterations`.
    pub max_iterations_per_node: u32,
    /// Default time a checkpoint may stay unanswered. `None` waits forever.
    pub checkpoint_ttl_secs: Option<u64>,
    /// Default per-attempt executor timeout.
    pub node_timeout_ms: Option<u64>,
    /// Global context merged into every node's bindings.
    pub globals: Map<String, Value>,
    /// Where execution records are written, one JSON file per execution.
    pub archive_dir: Option<PathBuf>,
}

impl EngineConfig {
    pub fn checkpoint_ttl(&self) -> Option<Duration> {
        self.checkpoint_ttl_secs.map(Duration::from_secs)
    }

    pub fn node_timeout(&self) -> Option<Duration> {
        self.node_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_nodes: 10,
            max_iterations_per_node: 100,
            checkpoint_ttl_secs: None,
            node_timeout_ms: None,
            globals: Map::new(),
            archive_dir: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"max_iterations_per_node": 5}"#).unwrap();
        assert_eq!(config.max_iterations_per_node, 5);
        assert_eq!(config.max_parallel_nodes, 10);
        assert!(config.checkpoint_ttl().is_none());
        assert!(config.archive_dir.is_none());
    }
}
