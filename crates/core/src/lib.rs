//! # Relay Core
//!
//! Resumable, human-in-the-loop agent pipeline: agents run one after
//! another over a shared context, a supervisor grades each stage, and a
//! human confirms (or rolls back) before the pipeline moves on.
//!
//! ## Architecture
//!
//! - `events/` - Typed event bus with bounded history
//! - `context/` - The `PipelineContext` contract and the stock `ResearchContext`
//! - `agents/` - `Agent` and `Supervisor` traits
//! - `workflow/` - State machine: stages, checkpoints, retries, redo, rollback
//! - `orchestration/` - Stage graph, project directories, sessions
//! - `state/` - Checkpoint stores (JSON files or SQLite) and project I/O
//!
//! ## Usage
//!
//! ```rust,ignore
//! use relay_core::{Orchestrator, OrchestratorConfig, ResearchContext};
//!
//! let mut orchestrator = Orchestrator::new(OrchestratorConfig::default())?;
//! orchestrator.register_agent(Arc::new(MyArchitect))?;
//! let project_dir = orchestrator.start_workflow(ResearchContext::default()).await?;
//! orchestrator.confirm_stage(None, None)?;
//! let context = orchestrator.wait().await?;
//! ```

pub mod agents;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod orchestration;
pub mod state;
pub mod workflow;

pub use agents::{Agent, EvaluationResult, Supervisor};
pub use config::{CheckpointBackend, EngineConfig, OrchestratorConfig};
pub use context::{Artifact, PipelineContext, RedoRequest, ResearchContext};
pub use error::WorkflowError;
pub use events::{Event, EventBus, EventKind, LogLevel};
pub use orchestration::{Orchestrator, SessionManager, StageConfig, StageGraph};
pub use workflow::{Confirmation, WorkflowEngine, WorkflowState};
