use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use wfcore::{
    CheckpointRequest, ExecutionStatus, NodeContext, NodeError, NodeExecutor, NodeOutcome,
    NodeSpec, NodeType, TimeoutAction,
};

const DEFAULT_OPTIONS: [&str; 2] = ["approve", "reject"];

fn options(config: &Map<String, Value>) -> Result<Vec<String>, NodeError> {
    match config.get("options") {
        None => Ok(DEFAULT_OPTIONS.iter().map(|s| s.to_string()).collect()),
        Some(raw) => {
            let options: Vec<String> = serde_json::from_value(raw.clone()).map_err(|_| {
                NodeError::Configuration("options must be a list of strings".to_string())
            })?;
            if options.is_empty() || options.iter().any(|o| o.trim().is_empty()) {
                return Err(NodeError::Configuration(
                    "options must be non-empty strings".to_string(),
                ));
            }
            Ok(options)
        }
    }
}

fn outcomes(config: &Map<String, Value>) -> Result<BTreeMap<String, ExecutionStatus>, NodeError> {
    let Some(raw) = config.get("outcomes") else {
        return Ok(BTreeMap::new());
    };
    let outcomes: BTreeMap<String, ExecutionStatus> = serde_json::from_value(raw.clone())
        .map_err(|e| NodeError::Configuration(format!("invalid outcomes: {}", e)))?;
    if let Some((branch, status)) = outcomes
        .iter()
        .find(|(_, s)| !matches!(s, ExecutionStatus::Approved | ExecutionStatus::Rejected))
    {
        return Err(NodeError::Configuration(format!(
            "outcome for '{}' must be approved or rejected, not {}",
            branch, status
        )));
    }
    Ok(outcomes)
}

fn timeout_action(config: &Map<String, Value>, options: &[String]) -> Result<TimeoutAction, NodeError> {
    let default_branch = config.get("defaultBranch").and_then(Value::as_str);
    let action = config
        .get("timeoutAction")
        .and_then(Value::as_str)
        .unwrap_or(if default_branch.is_some() { "default" } else { "fail" });
    match action {
        "fail" => Ok(TimeoutAction::Fail),
        "default" => {
            let branch = default_branch.ok_or_else(|| {
                NodeError::Configuration("timeoutAction 'default' needs defaultBranch".to_string())
            })?;
            if !options.iter().any(|o| o == branch) {
                return Err(NodeError::Configuration(format!(
                    "defaultBranch '{}' is not one of {:?}",
                    branch, options
                )));
            }
            Ok(TimeoutAction::Default {
                branch: branch.to_string(),
            })
        }
        other => Err(NodeError::Configuration(format!(
            "unknown timeoutAction '{}'",
            other
        ))),
    }
}

/// Suspends the run until a person answers.
pub struct HumanExecutor;

#[async_trait]
impl NodeExecutor for HumanExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::Human
    }

    fn description(&self) -> &str {
        "Pauses the execution until a human chooses one of the options"
    }

    fn validate_config(&self, spec: &NodeSpec) -> Result<(), NodeError> {
        let options = options(&spec.config)?;
        outcomes(&spec.config)?;
        timeout_action(&spec.config, &options)?;
        Ok(())
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutcome, NodeError> {
        let options = options(&ctx.config)?;
        let mut request = CheckpointRequest::new(options);
        request.timeout_action = timeout_action(&ctx.config, &request.options)?;
        request.outcomes = outcomes(&ctx.config)?;
        request.timeout = ctx
            .config
            .get("timeoutSecs")
            .and_then(Value::as_u64)
            .map(Duration::from_secs);
        if let Some(prompt) = ctx.render("prompt")? {
            request = request.with_prompt(prompt);
        }
        tracing::info!(node_id = %ctx.node_id, iteration = ctx.iteration, "Awaiting human input");
        Ok(NodeOutcome::Pause(request))
    }
}
