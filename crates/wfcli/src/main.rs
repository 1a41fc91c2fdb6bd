use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;
use wfcore::{
    CheckpointResponse, Edge, ExecutionEvent, ExecutionSnapshot, ExecutionStatus, NodeSpec,
    NodeType, PendingCheckpoint, WorkflowDefinition,
};
use wfnodes::{AgentBackend, EchoBackend, OpenAiBackend, OpenAiConfig, ToolRegistry};
use wfruntime::{EngineConfig, ExecutionEngine, ExecutorRegistry, InMemoryDefinitionStore};

#[derive(Parser)]
#[command(name = "wf")]
#[command(about = "Workflow engine CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow file
    Run {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Input variables as a JSON object
        #[arg(short, long)]
        input: Option<String>,

        /// Answer every human checkpoint with this branch instead of asking
        #[arg(short, long)]
        branch: Option<String>,

        #[arg(long, value_enum, default_value_t = Backend::Echo)]
        backend: Backend,

        /// Model for the OpenAI-compatible backend
        #[arg(long)]
        model: Option<String>,

        #[arg(long, env = "OPENAI_BASE_URL")]
        base_url: Option<String>,

        #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
        api_key: Option<String>,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Validate a workflow file
    Validate {
        /// Path to workflow JSON file
        file: PathBuf,
    },

    /// List node types and built-in tools
    Nodes,

    /// Create a new example workflow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "workflow.json")]
        output: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    Echo,
    Openai,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let verbose = matches!(cli.command, Commands::Run { verbose: true, .. });
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(if verbose { "debug" } else { "warn" })
        }))
        .init();

    match cli.command {
        Commands::Run {
            file,
            input,
            branch,
            backend,
            model,
            base_url,
            api_key,
            ..
        } => {
            let backend: Arc<dyn AgentBackend> = match backend {
                Backend::Echo => Arc::new(EchoBackend),
                Backend::Openai => {
                    let mut config = OpenAiConfig::default();
                    if let Some(base_url) = base_url {
                        config.base_url = base_url;
                    }
                    if let Some(model) = model {
                        config.default_model = model;
                    }
                    config.api_key = api_key;
                    Arc::new(OpenAiBackend::new(config))
                }
            };
            run_workflow(&file, input, branch, backend).await?;
        }

        Commands::Validate { file } => {
            validate_workflow(&file)?;
        }

        Commands::Nodes => {
            list_nodes();
        }

        Commands::Init { output } => {
            create_example_workflow(&output)?;
        }
    }

    Ok(())
}

fn load_workflow(file: &Path) -> Result<WorkflowDefinition> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("cannot read {}", file.display()))?;
    serde_json::from_str(&text).with_context(|| format!("{} is not a workflow", file.display()))
}

fn engine(backend: Arc<dyn AgentBackend>) -> ExecutionEngine {
    let mut registry = ExecutorRegistry::new();
    wfnodes::register_all(&mut registry, backend, Arc::new(ToolRegistry::with_builtins()));
    ExecutionEngine::new(
        registry,
        Arc::new(InMemoryDefinitionStore::new()),
        EngineConfig::default(),
    )
}

fn parse_inputs(input: Option<String>) -> Result<Map<String, Value>> {
    let Some(text) = input else {
        return Ok(Map::new());
    };
    match serde_json::from_str(&text)? {
        Value::Object(map) => Ok(map),
        _ => Err(anyhow!("Input must be a JSON object")),
    }
}

async fn run_workflow(
    file: &Path,
    input: Option<String>,
    branch: Option<String>,
    backend: Arc<dyn AgentBackend>,
) -> Result<()> {
    println!("🚀 Loading workflow from: {}", file.display());
    let definition = Arc::new(load_workflow(file)?);
    println!("📋 Workflow: {} (v{})", definition.name, definition.version);
    println!("   Nodes: {}", definition.nodes.len());
    println!();

    let engine = engine(backend);
    let execution_id = engine
        .create_from(definition.clone(), parse_inputs(input)?)
        .await?;

    // Subscribe before launching so no event is missed.
    let subscription = engine.subscribe(execution_id).await?;
    let printer = tokio::spawn(subscription.events.for_each(|event| async move {
        print_event(&event);
    }));
    engine.launch(execution_id).await?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let snapshot = loop {
        let snapshot = engine.wait_settled(execution_id).await?;
        if snapshot.status != ExecutionStatus::Paused {
            break snapshot;
        }
        let checkpoint = snapshot
            .pending_checkpoint
            .ok_or_else(|| anyhow!("execution is paused without a checkpoint"))?;
        let answer = match &branch {
            Some(branch) => branch.clone(),
            None => ask(&checkpoint, &mut stdin).await?,
        };
        engine
            .resume(execution_id, CheckpointResponse::branch(answer))
            .await?;
    };
    printer.await?;

    print_summary(&definition, &snapshot);
    if snapshot.status == ExecutionStatus::Failed {
        bail!("execution {} failed", execution_id);
    }
    Ok(())
}

async fn ask<R>(
    checkpoint: &PendingCheckpoint,
    lines: &mut tokio::io::Lines<R>,
) -> Result<String>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    loop {
        println!();
        println!(
            "🙋 {} [{}]",
            checkpoint
                .prompt
                .as_deref()
                .unwrap_or("Choose a branch"),
            checkpoint.options.join("/")
        );
        let Some(line) = lines.next_line().await? else {
            bail!("stdin closed while waiting for an answer");
        };
        let answer = line.trim();
        if checkpoint.options.iter().any(|o| o == answer) {
            return Ok(answer.to_string());
        }
        println!("   '{}' is not one of the options", answer);
    }
}

fn print_event(event: &ExecutionEvent) {
    match event {
        ExecutionEvent::NodeStart {
            node_id,
            node_type,
            iteration,
            ..
        } => {
            if *iteration > 1 {
                println!("  ⚡ Starting node: {} ({}, iteration {})", node_id, node_type, iteration);
            } else {
                println!("  ⚡ Starting node: {} ({})", node_id, node_type);
            }
        }
        ExecutionEvent::NodeComplete {
            result_key,
            branch,
            error,
            ..
        } => match (error, branch) {
            (Some(error), _) => println!("  ❌ Node {} failed: {}", result_key, error),
            (None, Some(branch)) => println!("  ✅ Node {} took '{}'", result_key, branch),
            (None, None) => println!("  ✅ Node {} completed", result_key),
        },
        ExecutionEvent::CheckpointPending { checkpoint, .. } => {
            println!("  ⏸️  Waiting on {}", checkpoint.node_id);
        }
        ExecutionEvent::StatusChanged { from, to, .. } => {
            println!("  ▶️  {} → {}", from, to);
        }
    }
}

fn print_summary(definition: &WorkflowDefinition, snapshot: &ExecutionSnapshot) {
    println!();
    println!("📊 Execution Summary:");
    println!("   Execution ID: {}", snapshot.execution_id);
    println!("   Status: {}", snapshot.status);
    println!(
        "   Completed: {}/{} nodes",
        snapshot.completed_nodes.len(),
        definition.nodes.len()
    );

    let ends: Vec<_> = definition
        .nodes
        .iter()
        .filter(|n| n.node_type == NodeType::End)
        .filter_map(|n| snapshot.node_results.get(&n.id).map(|r| (&n.id, r)))
        .filter(|(_, r)| !r.output.is_null())
        .collect();
    if !ends.is_empty() {
        println!();
        println!("📤 Outputs:");
        for (node_id, result) in ends {
            println!("   {}: {}", node_id, result.output);
        }
    }

    if !snapshot.errors.is_empty() {
        println!();
        println!("💥 Errors:");
        for error in &snapshot.errors {
            println!(
                "   [{}] {}",
                error.node_id.as_deref().unwrap_or("-"),
                error.message
            );
        }
    }
}

fn validate_workflow(file: &Path) -> Result<()> {
    println!("🔍 Validating workflow: {}", file.display());

    let definition = load_workflow(file)?;
    engine(Arc::new(EchoBackend)).validate(&definition)?;

    println!("✅ Workflow is valid:");
    println!("   Name: {}", definition.name);
    println!("   Version: {}", definition.version);
    println!("   Nodes: {}", definition.nodes.len());
    println!(
        "   Edges: {}",
        definition.nodes.iter().map(|n| n.edges.len()).sum::<usize>()
    );
    Ok(())
}

fn list_nodes() {
    println!("📦 Available Node Types:");
    println!();
    for metadata in engine(Arc::new(EchoBackend)).registry().list() {
        println!("  • {}", metadata.node_type);
        println!("    {}", metadata.description);
    }

    println!();
    println!("🔧 Built-in Tools:");
    println!();
    for tool in ToolRegistry::with_builtins().list() {
        println!("  • {}", tool.name);
        println!("    {}", tool.description);
    }
}

fn create_example_workflow(output: &Path) -> Result<()> {
    let mut workflow = WorkflowDefinition::new("draft-review", "Draft and review")
        .with_node(NodeSpec::new("start", NodeType::Start).to("draft"))
        .with_node(
            NodeSpec::new("draft", NodeType::Agent)
                .with_name("Write draft")
                .with_config("prompt", "Write a short note about {{ topic }}")
                .with_config("outputVariable", "draft")
                .to("review"),
        )
        .with_node(
            NodeSpec::new("review", NodeType::Human)
                .with_name("Review draft")
                .with_config("prompt", "Publish this draft? {{ draft }}")
                .with_config("options", json!(["approve", "revise"]))
                .with_edge(Edge::branch("publish", "approve"))
                .with_edge(Edge::loop_back("draft", "revise")),
        )
        .with_node(
            NodeSpec::new("publish", NodeType::Transform)
                .with_config("template", "Published: {{ draft }}")
                .to("end"),
        )
        .with_node(NodeSpec::new("end", NodeType::End).with_config("output", "publish"));
    workflow.description = Some("Drafts a note with an agent and asks a human to approve it".to_string());

    engine(Arc::new(EchoBackend)).validate(&workflow)?;
    std::fs::write(output, serde_json::to_string_pretty(&workflow)?)?;

    println!("✨ Created example workflow: {}", output.display());
    println!();
    println!("Run it with:");
    println!(
        "  wf run --file {} --input '{{\"topic\": \"tide pools\"}}'",
        output.display()
    );
    Ok(())
}
