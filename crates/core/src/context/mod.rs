//! # Pipeline Context
//!
//! The state bag carried through the pipeline. The engine only relies on the
//! [`PipelineContext`] contract; the caller's domain model implements it.
//! [`ResearchContext`] is the stock implementation used by the orchestrator
//! and the CLI.

pub mod research;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::agents::EvaluationResult;

pub use research::{ExecutionLogEntry, ResearchContext, SupervisionRecord};

/// A downstream stage asking for an upstream stage to be re-run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RedoRequest {
    /// Agent key of the stage to re-run
    #[serde(alias = "agent")]
    pub target_agent: String,
    /// Why the downstream agent wants the redo; injected as feedback
    pub reason: String,
}

impl RedoRequest {
    pub fn new(target_agent: &str, reason: &str) -> Self {
        Self {
            target_agent: target_agent.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// A file exported into the project directory when a run completes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Artifact {
    /// Path relative to the project directory
    pub relative_path: PathBuf,
    pub content: String,
}

/// Contract between the engine and the caller's domain model.
///
/// Handlers get exclusive `&mut` access one at a time; the engine never hands
/// the context to two handlers at once.
pub trait PipelineContext:
    Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Retry guidance keyed by agent key
    fn pending_feedback(&self) -> &HashMap<String, String>;

    fn pending_feedback_mut(&mut self) -> &mut HashMap<String, String>;

    fn redo_request(&self) -> Option<&RedoRequest>;

    /// Replace the outstanding redo request (at most one exists)
    fn set_redo_request(&mut self, request: RedoRequest);

    /// Read and clear the outstanding redo request
    fn take_redo_request(&mut self) -> Option<RedoRequest>;

    /// Drop the outputs of `stage_key` and every stage after it
    fn clear_outputs_from(&mut self, stage_key: &str);

    /// Called after every supervisor evaluation (1-based iteration)
    fn record_supervision(&mut self, _agent_key: &str, _iteration: u32, _result: &EvaluationResult) {}

    /// Files to write into the project directory on completion
    fn artifacts(&self) -> Vec<Artifact> {
        Vec::new()
    }

    /// Feedback waiting for `agent_key`, if any
    fn feedback_for(&self, agent_key: &str) -> Option<&str> {
        self.pending_feedback().get(agent_key).map(String::as_str)
    }

    /// Serialize for checkpointing
    fn to_snapshot(&self) -> anyhow::Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Deserialize from a checkpoint
    fn from_snapshot(snapshot: serde_json::Value) -> anyhow::Result<Self> {
        Ok(serde_json::from_value(snapshot)?)
    }
}
