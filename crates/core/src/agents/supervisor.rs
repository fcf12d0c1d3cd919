//! # Supervisor
//!
//! Quality gate evaluated after every successful stage. A failing evaluation
//! triggers the engine's retry loop with the issues and suggestions injected
//! as feedback.

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::context::PipelineContext;

/// Output of one supervisor evaluation
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct EvaluationResult {
    /// Quality score (0 - 100)
    pub score: f64,
    /// Whether the stage output is acceptable as is
    pub passed: bool,
    /// Problems found in the output
    #[serde(default)]
    pub issues: Vec<String>,
    /// Concrete improvement hints
    #[serde(default)]
    pub suggestions: Vec<String>,
    /// Agent key the supervisor recommends rolling back to
    #[serde(default)]
    pub rollback_to: Option<String>,
}

impl EvaluationResult {
    /// A passing evaluation with no remarks
    pub fn pass(score: f64) -> Self {
        Self {
            score,
            passed: true,
            issues: Vec::new(),
            suggestions: Vec::new(),
            rollback_to: None,
        }
    }

    /// A failing evaluation
    pub fn fail(score: f64, issues: Vec<String>, suggestions: Vec<String>) -> Self {
        Self {
            score,
            passed: false,
            issues,
            suggestions,
            rollback_to: None,
        }
    }

    /// Feedback text handed to the agent on retry
    pub fn feedback(&self) -> String {
        let mut parts = Vec::new();
        if !self.issues.is_empty() {
            parts.push(format!("Issues: {}", self.issues.join("; ")));
        }
        if !self.suggestions.is_empty() {
            parts.push(format!("Suggestions: {}", self.suggestions.join("; ")));
        }
        parts.join("\n")
    }
}

/// External quality gate
#[async_trait]
pub trait Supervisor<C: PipelineContext>: Send + Sync {
    /// Grade the output of `agent_key`. An error aborts only the retry loop.
    async fn evaluate(&self, agent_key: &str, context: &C) -> anyhow::Result<EvaluationResult>;
}
