use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use craftcore::{Blueprint, BroadcastEventBus, EdgeDef, NodeDef};
use craftruntime::{
    FlowcraftRuntime, GraphAnalysis, InitialState, NodeRegistry, RunOptions, RuntimeConfig,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flowcraft")]
#[command(about = "Flowcraft workflow engine CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a blueprint file
    Run {
        /// Path to blueprint JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Initial context values as a JSON object
        #[arg(short, long)]
        input: Option<String>,

        /// Print execution events as they happen
        #[arg(short, long)]
        verbose: bool,
    },

    /// Validate a blueprint file
    Validate {
        /// Path to blueprint JSON file
        file: PathBuf,
    },

    /// Print start nodes, terminal nodes, and cycles of a blueprint
    Analyze {
        /// Path to blueprint JSON file
        file: PathBuf,
    },

    /// Create a new example blueprint
    Init {
        /// Output file path
        #[arg(short, long, default_value = "blueprint.json")]
        output: PathBuf,
    },
}

fn load_blueprint(path: &PathBuf) -> Result<Blueprint> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let raw = serde_json::from_str(&text)
        .with_context(|| format!("parsing {}", path.display()))?;
    let blueprint = Blueprint::sanitize(&raw)?;
    blueprint.validate()?;
    Ok(blueprint)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            input,
            verbose,
        } => {
            let blueprint = load_blueprint(&file)?;

            let mut registry = NodeRegistry::new();
            craftnodes::register_all(&mut registry);

            let bus = Arc::new(BroadcastEventBus::new(1024));
            let runtime = FlowcraftRuntime::with_config(RuntimeConfig {
                registry,
                event_bus: Some(bus.clone()),
                ..Default::default()
            });

            if verbose {
                let mut events = bus.subscribe();
                tokio::spawn(async move {
                    while let Ok(event) = events.recv().await {
                        if let Ok(line) = serde_json::to_string(&event) {
                            println!("{line}");
                        }
                    }
                });
            }

            let initial = match input {
                Some(text) => {
                    let values = serde_json::from_str(&text).context("parsing --input")?;
                    InitialState::Values(values)
                }
                None => InitialState::Empty,
            };

            let result = runtime
                .run(&blueprint, initial, RunOptions::default())
                .await?;
            println!("status: {:?}", result.status);
            println!("{}", serde_json::to_string_pretty(&result.context)?);
            if !result.errors.is_empty() {
                for error in &result.errors {
                    eprintln!("error: {} ({})", error.message, error.name);
                }
                std::process::exit(1);
            }
        }

        Commands::Validate { file } => {
            let blueprint = load_blueprint(&file)?;
            println!(
                "blueprint '{}' is valid: {} nodes, {} edges",
                blueprint.id,
                blueprint.nodes.len(),
                blueprint.edges.len()
            );
        }

        Commands::Analyze { file } => {
            let blueprint = load_blueprint(&file)?;
            let analysis = GraphAnalysis::analyze(&blueprint);
            println!("start nodes:    {:?}", analysis.start_node_ids);
            println!("terminal nodes: {:?}", analysis.terminal_node_ids);
            if analysis.cycles.is_empty() {
                println!("cycles:         none");
            } else {
                for cycle in &analysis.cycles {
                    println!("cycle:          {}", cycle.join(" -> "));
                }
            }
        }

        Commands::Init { output } => {
            let blueprint = example_blueprint();
            let text = serde_json::to_string_pretty(&blueprint)?;
            std::fs::write(&output, text)
                .with_context(|| format!("writing {}", output.display()))?;
            println!("wrote example blueprint to {}", output.display());
        }
    }

    Ok(())
}

fn example_blueprint() -> Blueprint {
    let mut blueprint = Blueprint::new("example");
    blueprint
        .add_node(
            NodeDef::new("parse", "json-parse")
                .with_inputs(craftcore::InputSpec::Key("_payload".into())),
        )
        .add_node(NodeDef::new("report", "log"))
        .add_node(NodeDef::new("render", "json-stringify"))
        .add_edge(EdgeDef::new("parse", "report"))
        .add_edge(EdgeDef::new("report", "render"));
    blueprint.metadata.extra.insert(
        "description".to_string(),
        json!("parse a JSON payload, log it, and render it back"),
    );
    blueprint
}
