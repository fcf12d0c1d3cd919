mod demo;
mod prompt;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use relay_core::events::listener;
use relay_core::state::io::{checkpoint_db_path, checkpoint_dir, CONTEXT_FILE};
use relay_core::state::{CheckpointStore, FileCheckpointStore, RelayDb, SqliteCheckpointStore};
use relay_core::{
    CheckpointBackend, Event, EventKind, Orchestrator, OrchestratorConfig,
    ResearchContext, StageGraph, WorkflowState,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{prelude::*, EnvFilter};

use demo::{TemplateAgent, WordCountSupervisor};

const DEFAULT_CONFIG: &str = "relay.json";
const MIN_WORDS: usize = 40;

#[derive(Parser, Clone)]
#[command(author, version, about = "Relay - resumable human-in-the-loop agent pipeline")]
struct Args {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Clone)]
enum CliCommand {
    /// Run the research pipeline with the offline template agents
    Run {
        /// Research topic
        #[arg(short, long, default_value = "adaptive notch filters")]
        topic: String,
        /// Config file (JSON)
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        /// Confirm every stage without asking
        #[arg(short, long)]
        yes: bool,
        /// Grade every stage with the word-count supervisor
        #[arg(long)]
        supervisor: bool,
        /// Override engine.max_supervisor_retries
        #[arg(long)]
        max_retries: Option<u32>,
    },
    /// Resume a run from its newest checkpoint
    Resume {
        /// Project directory of the interrupted run
        project_dir: PathBuf,
        /// Config file (JSON)
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        /// Confirm every stage without asking
        #[arg(short, long)]
        yes: bool,
        /// Grade every stage with the word-count supervisor
        #[arg(long)]
        supervisor: bool,
    },
    /// List the checkpoints saved in a project directory
    Checkpoints {
        project_dir: PathBuf,
    },
    /// Print the stage graph
    Stages {
        /// Config file (JSON)
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(log_filter(
            std::env::var(EnvFilter::DEFAULT_ENV).ok(),
        )))
        .init();
}

/// `RUST_LOG` directives as given; `info` when unset or unparsable
fn log_filter(directives: Option<String>) -> EnvFilter {
    directives
        .and_then(|d| match EnvFilter::try_new(&d) {
            Ok(filter) => Some(filter),
            Err(e) => {
                eprintln!("⚠️  Ignoring invalid {}={:?}: {}", EnvFilter::DEFAULT_ENV, d, e);
                None
            }
        })
        .unwrap_or_else(|| EnvFilter::new("info"))
}

/// Orchestrator with a template agent behind every stage
fn build_orchestrator(
    config: OrchestratorConfig,
    with_supervisor: bool,
) -> Result<Arc<Orchestrator<ResearchContext>>> {
    let mut orchestrator = Orchestrator::new(config)?;
    for agent in TemplateAgent::for_stages(orchestrator.graph().stages()) {
        orchestrator.register_agent(agent)?;
    }
    if with_supervisor {
        let agents = orchestrator.graph().agents().clone();
        orchestrator.set_supervisor(Arc::new(WordCountSupervisor::new(agents, MIN_WORDS)));
    }

    let orchestrator = Arc::new(orchestrator);
    print_progress(&orchestrator);
    Ok(orchestrator)
}

/// Log lines already reach the terminal through tracing; progress is
/// printed here
fn print_progress(orchestrator: &Orchestrator<ResearchContext>) {
    orchestrator.events().subscribe(
        EventKind::ProgressUpdated,
        listener(|event: &Event| {
            let percent = event.data["percent"].as_u64().unwrap_or(0);
            println!("[{:>3}%] {}", percent, event.str_field("description").unwrap_or_default());
            Ok(())
        }),
    );
}

/// Wait for the run, answering confirmations meanwhile
async fn drive(orchestrator: &Arc<Orchestrator<ResearchContext>>, auto_confirm: bool) -> Result<()> {
    let confirmer = prompt::spawn_confirmer(orchestrator, auto_confirm);
    let result = orchestrator.wait().await;
    confirmer.abort();
    let context = result?;

    let project_dir = orchestrator.project_dir().unwrap_or_default();
    match orchestrator.state() {
        WorkflowState::Completed => {
            println!("\n✅ Pipeline completed: {} stage outputs", context.outputs.len());
            println!("   Project: {}", project_dir.display());
        }
        WorkflowState::Stopped => {
            println!("\n⏹  Pipeline stopped");
            println!("   Resume with: relay resume {}", project_dir.display());
        }
        state => {
            println!("\n❌ Pipeline ended in state `{}`", state);
            println!("   Resume with: relay resume {}", project_dir.display());
        }
    }
    Ok(())
}

async fn load_config(path: &Path, max_retries: Option<u32>) -> Result<OrchestratorConfig> {
    let mut config = OrchestratorConfig::load(path).await?;
    if let Some(retries) = max_retries {
        config.engine.max_supervisor_retries = retries;
    }
    Ok(config)
}

/// A project written with the SQLite backend has `checkpoints.db`
async fn detect_backend(project_dir: &Path) -> CheckpointBackend {
    if tokio::fs::try_exists(checkpoint_db_path(project_dir))
        .await
        .unwrap_or(false)
    {
        CheckpointBackend::Sqlite
    } else {
        CheckpointBackend::Files
    }
}

async fn run(
    topic: String,
    config: PathBuf,
    yes: bool,
    supervisor: bool,
    max_retries: Option<u32>,
) -> Result<()> {
    let config = load_config(&config, max_retries).await?;
    let orchestrator = build_orchestrator(config, supervisor)?;

    let context = ResearchContext::new(
        json!({ "topic": topic }),
        orchestrator.graph().stage_keys(),
    );
    let project_dir = orchestrator.start_workflow(context).await?;
    println!("🚀 Running pipeline on \"{}\"", topic);
    println!("   Project: {}", project_dir.display());

    drive(&orchestrator, yes).await
}

async fn resume(project_dir: PathBuf, config: PathBuf, yes: bool, supervisor: bool) -> Result<()> {
    let mut config = load_config(&config, None).await?;
    config.checkpoint_backend = detect_backend(&project_dir).await;
    let orchestrator = build_orchestrator(config, supervisor)?;

    // Used only when the project has no checkpoint yet
    let saved = project_dir.join(CONTEXT_FILE);
    let fallback = match ResearchContext::load_from_file(&saved).await {
        Ok(context) => context,
        Err(_) => ResearchContext::new(json!({}), orchestrator.graph().stage_keys()),
    };

    let index = orchestrator.resume_workflow(&project_dir, fallback).await?;
    let stages = orchestrator.active_stage_keys();
    match stages.get(index) {
        Some(stage) => println!("🔁 Resuming at stage {} (`{}`)", index + 1, stage),
        None => println!("🔁 Every stage already has a checkpoint"),
    }

    drive(&orchestrator, yes).await
}

async fn list_checkpoints(project_dir: PathBuf) -> Result<()> {
    let store: Box<dyn CheckpointStore> = match detect_backend(&project_dir).await {
        CheckpointBackend::Sqlite => {
            let db = RelayDb::open_at(checkpoint_db_path(&project_dir))?;
            Box::new(SqliteCheckpointStore::new(&db))
        }
        CheckpointBackend::Files => Box::new(FileCheckpointStore::new(checkpoint_dir(&project_dir))),
    };

    let checkpoints = store
        .list()
        .await
        .with_context(|| format!("Failed to list checkpoints in {:?}", project_dir))?;
    if checkpoints.is_empty() {
        println!("No checkpoints in {}", project_dir.display());
        return Ok(());
    }
    for checkpoint in checkpoints {
        println!(
            "{:<24} {:<16} {}",
            checkpoint.name,
            checkpoint.stage_key,
            checkpoint.saved_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

async fn print_stages(config: PathBuf) -> Result<()> {
    let config = load_config(&config, None).await?;
    let graph = match config.stages {
        Some(stages) => StageGraph::new(stages)?,
        None => StageGraph::research()?,
    };
    for (index, stage) in graph.stages().iter().enumerate() {
        let depends = if stage.depends_on.is_empty() {
            String::new()
        } else {
            format!("  <- {}", stage.depends_on.join(", "))
        };
        println!(
            "{}. {:<12} {:<12} {:>3}%  {}{}",
            index + 1,
            stage.key,
            stage.agent_key,
            stage.progress,
            stage.description,
            depends
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let args = Args::parse();
    match args.command {
        CliCommand::Run {
            topic,
            config,
            yes,
            supervisor,
            max_retries,
        } => run(topic, config, yes, supervisor, max_retries).await,
        CliCommand::Resume {
            project_dir,
            config,
            yes,
            supervisor,
        } => resume(project_dir, config, yes, supervisor).await,
        CliCommand::Checkpoints { project_dir } => list_checkpoints(project_dir).await,
        CliCommand::Stages { config } => print_stages(config).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_filter_keeps_directives() {
        assert_eq!(
            log_filter(Some("relay_core=debug".to_string())).to_string(),
            "relay_core=debug"
        );
    }

    #[test]
    fn test_log_filter_defaults_to_info() {
        assert_eq!(log_filter(None).to_string(), "info");
    }
}
