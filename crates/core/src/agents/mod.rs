//! # Agents
//!
//! Contracts for the external collaborators the pipeline drives: stage
//! agents that transform the context, and the supervisor that grades their
//! output.
//!
//! Agents are thin wrappers (prompt construction, LLM calls); the engine
//! only needs the two traits below.

pub mod supervisor;

use async_trait::async_trait;

use crate::context::PipelineContext;

pub use supervisor::{EvaluationResult, Supervisor};

/// A pipeline agent. One agent backs exactly one stage.
///
/// An agent should read `context.feedback_for(self.key())` and adjust when
/// feedback is present, and may call `context.set_redo_request(..)` to ask
/// for an upstream stage to be re-run.
#[async_trait]
pub trait Agent<C: PipelineContext>: Send + Sync {
    /// Agent key (e.g. "architect")
    fn key(&self) -> &str;

    /// Transform the context in place
    async fn execute(&self, context: &mut C) -> anyhow::Result<()>;
}
