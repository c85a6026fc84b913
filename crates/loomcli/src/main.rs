use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use loomcore::{
    ExecutionEvent, ExecutionMode, Item, NodeEvent, NodeId, NodeInstance, NodeOutcome, Value,
    Workflow,
};
use loomnodes::items_from_value;
use loomruntime::{
    ConnectionGraph, ExecutionResult, LoomRuntime, NodeTypeRegistry, RunStart, RuntimeConfig,
    WorkflowLoader,
};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "loom")]
#[command(about = "Loom workflow runtime CLI", long_about = None)]
struct Cli {
    /// Show debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Runtime configuration JSON file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

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

        /// Start node, by id or name (defaults to the first start candidate)
        #[arg(short, long)]
        start: Option<String>,

        /// Input items as JSON (an array yields one item per element)
        #[arg(short, long)]
        input: Option<String>,
    },

    /// Validate a workflow file by building its connection graph
    Validate {
        /// Path to workflow JSON file
        file: PathBuf,
    },

    /// List available node types
    Nodes,

    /// Create a new example workflow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "workflow.json")]
        output: PathBuf,
    },

    /// Invoke a trigger node manually and run the workflow with what it emits
    Trigger {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Trigger node, by id or name
        #[arg(short, long)]
        node: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = match &cli.config {
        Some(path) => RuntimeConfig::from_file(path)
            .with_context(|| format!("reading runtime config {}", path.display()))?,
        None => RuntimeConfig::default(),
    };
    tracing::debug!(?config, "Runtime configuration");

    match cli.command {
        Commands::Run { file, start, input } => {
            run_workflow(config, &file, start.as_deref(), input.as_deref()).await?;
        }

        Commands::Validate { file } => {
            validate_workflow(config, &file).await?;
        }

        Commands::Nodes => {
            list_nodes()?;
        }

        Commands::Init { output } => {
            create_example_workflow(&output)?;
        }

        Commands::Trigger { file, node } => {
            invoke_trigger(config, &file, &node).await?;
        }
    }

    Ok(())
}

fn registry() -> Result<NodeTypeRegistry> {
    let mut registry = NodeTypeRegistry::new();
    loomnodes::register_all(&mut registry)?;
    Ok(registry)
}

/// Accepts a node id or a node name.
fn find_node(workflow: &Workflow, reference: &str) -> Result<NodeId> {
    if let Ok(id) = reference.parse::<NodeId>() {
        if workflow.find_node(id).is_some() {
            return Ok(id);
        }
    }
    workflow
        .find_node_by_name(reference)
        .map(|n| n.id)
        .ok_or_else(|| anyhow!("No node '{}' in workflow '{}'", reference, workflow.name))
}

fn default_start(graph: &ConnectionGraph) -> Result<NodeId> {
    graph
        .start_candidates()
        .first()
        .map(|n| n.id())
        .ok_or_else(|| anyhow!("Workflow has no trigger or source node to start from"))
}

fn parse_input(input: &str) -> Result<Vec<Item>> {
    let json: serde_json::Value = serde_json::from_str(input).context("parsing --input")?;
    Ok(items_from_value(Value::Json(json)))
}

/// Print events as they arrive until the returned token is cancelled.
fn spawn_event_printer(runtime: &LoomRuntime) -> CancellationToken {
    let mut events = runtime.subscribe_events();
    let stop = CancellationToken::new();
    let stopped = stop.clone();

    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = stopped.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => event,
                    Err(_) => break,
                },
            };
            match event {
                ExecutionEvent::RunStarted { start_node, mode, .. } => {
                    println!("▶️  Run started at {} ({:?})", start_node, mode);
                }
                ExecutionEvent::NodeStarted { node_id, node_type, attempt, .. } => {
                    if attempt > 1 {
                        println!("  🔁 Retrying node: {} ({}), attempt {}", node_id, node_type, attempt);
                    } else {
                        println!("  ⚡ Starting node: {} ({})", node_id, node_type);
                    }
                }
                ExecutionEvent::NodeFinished { record, .. } => match &record.outcome {
                    NodeOutcome::Items { count } => {
                        println!(
                            "  ✅ Node {} produced {} item(s) in {}ms",
                            record.node_id,
                            count,
                            record.duration_ms()
                        );
                    }
                    NodeOutcome::Error { message, .. } => {
                        println!("  ❌ Node {} failed: {}", record.node_id, message);
                    }
                },
                ExecutionEvent::NodeSkipped { node_id, .. } => {
                    println!("  ⏭️  Node {} skipped", node_id);
                }
                ExecutionEvent::NodeEvent { node_id, event, .. } => match event {
                    NodeEvent::Info { message } => {
                        println!("     ℹ️  [{}] {}", node_id, message);
                    }
                    NodeEvent::Warning { message } => {
                        println!("     ⚠️  [{}] {}", node_id, message);
                    }
                    NodeEvent::Progress { percent, message } => match message {
                        Some(msg) => println!("     📊 [{}] {}% - {}", node_id, percent, msg),
                        None => println!("     📊 [{}] {}%", node_id, percent),
                    },
                },
                ExecutionEvent::RunFinished { status, duration_ms, .. } => {
                    println!("🏁 Run finished: {:?} after {}ms", status, duration_ms);
                }
                ExecutionEvent::TriggerActivated { node_id, mode, .. } => {
                    println!("🔔 Trigger {} activated ({})", node_id, mode);
                }
                ExecutionEvent::TriggerEmitted { node_id, item_count, .. } => {
                    println!("🔔 Trigger {} emitted {} item(s)", node_id, item_count);
                }
                ExecutionEvent::TriggerDeactivated { node_id, .. } => {
                    println!("🔕 Trigger {} deactivated", node_id);
                }
            }
        }
    });

    stop
}

fn print_summary(workflow: &Workflow, result: &ExecutionResult) {
    println!();
    println!("📊 Execution Summary:");
    println!("   Execution ID: {}", result.execution_id);
    println!("   Status: {:?}", result.status);
    println!("   Executed: {} node(s), skipped: {}", result.outputs.len(), result.skipped.len());
    if let Some(error) = &result.error {
        println!("   Error: {}", error);
    }

    let mut produced: Vec<_> = result
        .outputs
        .iter()
        .filter(|(_, output)| output.item_count() > 0)
        .collect();
    if produced.is_empty() {
        return;
    }
    produced.sort_by_key(|(id, _)| workflow.nodes.iter().position(|n| n.id == **id));

    println!();
    println!("📤 Outputs:");
    for (node_id, output) in produced {
        let label = workflow
            .find_node(*node_id)
            .map(NodeInstance::label)
            .unwrap_or_else(|| node_id.to_string());
        println!("   {}:", label);
        for (index, items) in output.outputs.iter().enumerate() {
            for item in items {
                println!("     [{}] {}", index, item.json.to_plain_json());
            }
        }
    }
}

async fn run_workflow(
    config: RuntimeConfig,
    file: &Path,
    start: Option<&str>,
    input: Option<&str>,
) -> Result<()> {
    println!("🚀 Loading workflow from: {}", file.display());

    let workflow = WorkflowLoader::load_file(file).await?;
    println!("📋 Workflow: {}", workflow.name);
    println!("   Nodes: {}", workflow.nodes.len());
    println!("   Connections: {}", workflow.connections.len());
    println!();

    let runtime = LoomRuntime::with_config(registry()?, config);
    let graph = runtime.validate(&workflow)?;
    let start_node = match start {
        Some(reference) => find_node(&workflow, reference)?,
        None => default_start(&graph)?,
    };
    let mut run_start = RunStart::new(start_node);
    if let Some(input) = input {
        run_start = run_start.with_items(parse_input(input)?);
    }

    let printer = spawn_event_printer(&runtime);
    let result = runtime
        .execute_workflow(&workflow, run_start, ExecutionMode::Manual)
        .await;

    // Let the printer drain what the run emitted.
    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    printer.cancel();

    let result = result?;
    print_summary(&workflow, &result);
    if !result.is_success() {
        bail!("Run ended with status {:?}", result.status);
    }
    Ok(())
}

async fn validate_workflow(config: RuntimeConfig, file: &Path) -> Result<()> {
    println!("🔍 Validating workflow: {}", file.display());

    let workflow = WorkflowLoader::load_file(file).await?;
    let runtime = LoomRuntime::with_config(registry()?, config);
    let graph = runtime.validate(&workflow)?;

    println!("✅ Workflow is valid:");
    println!("   Name: {}", workflow.name);
    println!("   Nodes: {}", graph.node_count());
    println!("   Edges: {}", graph.edges().len());
    println!("   Triggers: {}", graph.trigger_nodes().len());
    for node in graph.nodes() {
        println!(
            "   • {} ({} v{}, {})",
            node.instance.label(),
            node.description.name,
            node.description.version,
            node.role()
        );
    }

    Ok(())
}

fn list_nodes() -> Result<()> {
    println!("📦 Available Node Types:");
    println!();

    let registry = registry()?;
    for description in registry.catalog() {
        let versions = registry
            .versions(&description.name)
            .map(|v| {
                v.versions()
                    .iter()
                    .map(|n| n.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_default();
        println!("  • {} ({}) [versions: {}]", description.name, description.category, versions);
        if !description.description.is_empty() {
            println!("    {}", description.description);
        }
    }
    Ok(())
}

fn create_example_workflow(output: &Path) -> Result<()> {
    let mut workflow = Workflow::new("Example Agent Workflow");
    workflow.description = Some("Answers prompts with an agent backed by a model, memory and tools".to_string());

    let trigger = workflow.add_node(
        NodeInstance::new("trigger.manual")
            .with_name("Start")
            .with_parameter(
                "items",
                serde_json::json!([{"prompt": "hello"}, {"prompt": "/calculator (2 + 3) * 4"}]),
            )
            .with_position(100.0, 100.0),
    );
    let agent = workflow.add_node(
        NodeInstance::new("agent.simple")
            .with_name("Agent")
            .with_position(300.0, 100.0),
    );
    let model = workflow.add_node(
        NodeInstance::new("lm.echo")
            .with_name("Model")
            .with_position(250.0, 250.0),
    );
    let memory = workflow.add_node(
        NodeInstance::new("memory.buffer")
            .with_name("Memory")
            .with_parameter("window", 20i64)
            .with_position(300.0, 250.0),
    );
    let tools = workflow.add_node(
        NodeInstance::new("toolkit.basic")
            .with_name("Tools")
            .with_position(350.0, 250.0),
    );
    let log = workflow.add_node(
        NodeInstance::new("debug.log")
            .with_name("Log Answers")
            .with_position(500.0, 100.0),
    );

    workflow.connect(trigger, 0, agent, 0);
    workflow.connect(model, 0, agent, 1);
    workflow.connect(memory, 0, agent, 2);
    workflow.connect(tools, 0, agent, 3);
    workflow.connect(agent, 0, log, 0);

    let json = serde_json::to_string_pretty(&workflow)?;
    std::fs::write(output, json)?;

    println!("✨ Created example workflow: {}", output.display());
    println!();
    println!("Run it with:");
    println!("  loom trigger --file {} --node Start", output.display());

    Ok(())
}

async fn invoke_trigger(config: RuntimeConfig, file: &Path, node: &str) -> Result<()> {
    let workflow = WorkflowLoader::load_file(file).await?;
    let node_id = find_node(&workflow, node)?;

    let runtime = LoomRuntime::with_config(registry()?, config);
    let printer = spawn_event_printer(&runtime);
    let workflow_id = runtime.load_workflow(workflow.clone()).await?;
    let result = runtime.invoke_trigger_manually(workflow_id, node_id).await;

    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    printer.cancel();
    runtime.shutdown().await;

    let result = result?;
    print_summary(&workflow, &result);
    if !result.is_success() {
        bail!("Run ended with status {:?}", result.status);
    }
    Ok(())
}
