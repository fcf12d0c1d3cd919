//! # Stages
//!
//! A stage is one named step of the pipeline: a handler plus the progress
//! metadata the engine reports while running it.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::context::PipelineContext;

/// Transforms the context for one stage. May fail; failure is reported in a
/// [`StageResult`], never raised past the engine.
#[async_trait]
pub trait StageHandler<C: PipelineContext>: Send + Sync {
    async fn handle(&self, context: &mut C) -> anyhow::Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<C, F> StageHandler<C> for FnHandler<F>
where
    C: PipelineContext,
    F: Fn(&mut C) -> anyhow::Result<()> + Send + Sync,
{
    async fn handle(&self, context: &mut C) -> anyhow::Result<()> {
        (self.0)(context)
    }
}

/// Wrap a synchronous closure as a stage handler
pub fn handler_fn<C, F>(f: F) -> Arc<dyn StageHandler<C>>
where
    C: PipelineContext,
    F: Fn(&mut C) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

/// A registered stage
pub struct StageDefinition<C: PipelineContext> {
    pub key: String,
    pub handler: Arc<dyn StageHandler<C>>,
    pub description: String,
    /// Percentage reported when the stage starts
    pub target_progress: u8,
}

impl<C: PipelineContext> Clone for StageDefinition<C> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            handler: Arc::clone(&self.handler),
            description: self.description.clone(),
            target_progress: self.target_progress,
        }
    }
}

impl<C: PipelineContext> StageDefinition<C> {
    pub fn new(
        key: &str,
        handler: Arc<dyn StageHandler<C>>,
        description: &str,
        target_progress: u8,
    ) -> Self {
        Self {
            key: key.to_string(),
            handler,
            description: description.to_string(),
            target_progress: target_progress.min(100),
        }
    }
}

/// Outcome of one stage execution attempt. The context itself is mutated in
/// place, so it is not carried here.
#[derive(Debug, Clone, PartialEq)]
pub struct StageResult {
    pub stage_key: String,
    pub success: bool,
    pub duration: Duration,
    pub error: Option<String>,
}

impl StageResult {
    pub fn succeeded(stage_key: &str, duration: Duration) -> Self {
        Self {
            stage_key: stage_key.to_string(),
            success: true,
            duration,
            error: None,
        }
    }

    pub fn failed(stage_key: &str, duration: Duration, error: String) -> Self {
        Self {
            stage_key: stage_key.to_string(),
            success: false,
            duration,
            error: Some(error),
        }
    }
}
