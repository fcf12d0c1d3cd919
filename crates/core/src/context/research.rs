//! # Research Context
//!
//! Stock [`PipelineContext`] implementation. Each stage writes one JSON output
//! keyed by its stage key; rollback clears by position in `stage_order`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::fs;

use super::{Artifact, PipelineContext, RedoRequest};
use crate::agents::EvaluationResult;

/// One line of the agent execution log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionLogEntry {
    pub timestamp: DateTime<Utc>,
    pub agent: String,
    pub action: String,
    /// started, success, failed, warning
    pub status: String,
    #[serde(default)]
    pub details: String,
}

/// One supervisor evaluation of an agent's output
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SupervisionRecord {
    pub iteration: u32,
    pub timestamp: DateTime<Utc>,
    pub score: f64,
    pub passed: bool,
    pub issues: Vec<String>,
    pub suggestions: Vec<String>,
    pub rollback_to: Option<String>,
}

/// Context relayed between research agents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchContext {
    /// Caller-supplied research configuration
    #[serde(default)]
    pub research_config: serde_json::Value,
    /// Stage keys in pipeline order; drives `clear_outputs_from`
    #[serde(default)]
    pub stage_order: Vec<String>,
    /// Stage key -> output produced by that stage
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Value>,
    /// Stage key -> files that stage wants exported
    #[serde(default)]
    pub artifacts: BTreeMap<String, Vec<Artifact>>,
    /// Transient retry guidance; never checkpointed
    #[serde(skip)]
    pub pending_feedback: HashMap<String, String>,
    #[serde(default)]
    pub redo_request: Option<RedoRequest>,
    #[serde(default)]
    pub execution_log: Vec<ExecutionLogEntry>,
    #[serde(default)]
    pub supervision_history: HashMap<String, Vec<SupervisionRecord>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for ResearchContext {
    fn default() -> Self {
        Self::new(serde_json::Value::Null, Vec::new())
    }
}

impl ResearchContext {
    pub fn new(research_config: serde_json::Value, stage_order: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            research_config,
            stage_order,
            outputs: BTreeMap::new(),
            artifacts: BTreeMap::new(),
            pending_feedback: HashMap::new(),
            redo_request: None,
            execution_log: Vec::new(),
            supervision_history: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Store (or replace) a stage's output
    pub fn record_output(&mut self, stage_key: &str, output: serde_json::Value) {
        self.outputs.insert(stage_key.to_string(), output);
        self.touch();
    }

    pub fn output(&self, stage_key: &str) -> Option<&serde_json::Value> {
        self.outputs.get(stage_key)
    }

    /// Output as a plain string, if the stage stored one
    pub fn output_str(&self, stage_key: &str) -> Option<&str> {
        self.outputs.get(stage_key).and_then(|v| v.as_str())
    }

    /// Attach an exported file to a stage, replacing one at the same path
    pub fn add_artifact(&mut self, stage_key: &str, relative_path: impl Into<PathBuf>, content: String) {
        let relative_path = relative_path.into();
        let files = self.artifacts.entry(stage_key.to_string()).or_default();
        files.retain(|a| a.relative_path != relative_path);
        files.push(Artifact {
            relative_path,
            content,
        });
        self.touch();
    }

    pub fn log_execution(&mut self, agent: &str, action: &str, status: &str, details: &str) {
        self.execution_log.push(ExecutionLogEntry {
            timestamp: Utc::now(),
            agent: agent.to_string(),
            action: action.to_string(),
            status: status.to_string(),
            details: details.to_string(),
        });
        self.touch();
    }

    /// Score of the newest evaluation recorded for `agent_key`
    pub fn latest_supervision_score(&self, agent_key: &str) -> Option<f64> {
        self.supervision_history
            .get(agent_key)
            .and_then(|records| records.last())
            .map(|r| r.score)
    }

    /// Write the context as pretty JSON
    pub async fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)
            .await
            .with_context(|| format!("Failed to write context: {:?}", path))
    }

    pub async fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read context: {:?}", path))?;
        serde_json::from_str(&json).with_context(|| format!("Invalid context file: {:?}", path))
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

impl PipelineContext for ResearchContext {
    fn pending_feedback(&self) -> &HashMap<String, String> {
        &self.pending_feedback
    }

    fn pending_feedback_mut(&mut self) -> &mut HashMap<String, String> {
        &mut self.pending_feedback
    }

    fn redo_request(&self) -> Option<&RedoRequest> {
        self.redo_request.as_ref()
    }

    fn set_redo_request(&mut self, request: RedoRequest) {
        self.redo_request = Some(request);
    }

    fn take_redo_request(&mut self) -> Option<RedoRequest> {
        self.redo_request.take()
    }

    fn clear_outputs_from(&mut self, stage_key: &str) {
        let cleared: Vec<String> = match self.stage_order.iter().position(|k| k == stage_key) {
            Some(start) => self.stage_order[start..].to_vec(),
            None => vec![stage_key.to_string()],
        };
        for key in &cleared {
            self.outputs.remove(key);
            self.artifacts.remove(key);
        }
        self.touch();
    }

    fn record_supervision(&mut self, agent_key: &str, iteration: u32, result: &EvaluationResult) {
        self.supervision_history
            .entry(agent_key.to_string())
            .or_default()
            .push(SupervisionRecord {
                iteration,
                timestamp: Utc::now(),
                score: result.score,
                passed: result.passed,
                issues: result.issues.clone(),
                suggestions: result.suggestions.clone(),
                rollback_to: result.rollback_to.clone(),
            });
        self.touch();
    }

    fn artifacts(&self) -> Vec<Artifact> {
        self.artifacts.values().flatten().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stages() -> Vec<String> {
        ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_clear_outputs_from_uses_stage_order() {
        let mut ctx = ResearchContext::new(json!({}), stages());
        for key in ["a", "b", "c", "d"] {
            ctx.record_output(key, json!(format!("{key}-out")));
        }
        ctx.add_artifact("c", "code/c.txt", "c".to_string());

        ctx.clear_outputs_from("b");

        assert_eq!(ctx.output_str("a"), Some("a-out"));
        assert!(ctx.output("b").is_none());
        assert!(ctx.output("c").is_none());
        assert!(ctx.output("d").is_none());
        assert!(PipelineContext::artifacts(&ctx).is_empty());
    }

    #[test]
    fn test_clear_outputs_from_unknown_stage_only_clears_that_key() {
        let mut ctx = ResearchContext::new(json!({}), stages());
        ctx.record_output("a", json!(1));
        ctx.record_output("extra", json!(2));

        ctx.clear_outputs_from("extra");

        assert!(ctx.output("a").is_some());
        assert!(ctx.output("extra").is_none());
    }

    #[test]
    fn test_pending_feedback_is_not_checkpointed() {
        let mut ctx = ResearchContext::new(json!({"topic": "x"}), stages());
        ctx.pending_feedback_mut()
            .insert("architect".to_string(), "narrow the scope".to_string());
        ctx.set_redo_request(RedoRequest::new("architect", "why"));

        let restored = ResearchContext::from_snapshot(ctx.to_snapshot().unwrap()).unwrap();

        assert!(restored.pending_feedback.is_empty());
        assert_eq!(restored.redo_request, Some(RedoRequest::new("architect", "why")));
        assert_eq!(restored.research_config["topic"], "x");
    }

    #[test]
    fn test_take_redo_request_clears_it() {
        let mut ctx = ResearchContext::default();
        ctx.set_redo_request(RedoRequest::new("theorist", "bad model"));

        assert!(ctx.take_redo_request().is_some());
        assert!(ctx.redo_request().is_none());
    }

    #[test]
    fn test_record_supervision_history() {
        let mut ctx = ResearchContext::default();
        let result = EvaluationResult {
            score: 62.0,
            passed: false,
            issues: vec!["thin".to_string()],
            suggestions: vec![],
            rollback_to: None,
        };
        ctx.record_supervision("scribe", 1, &result);
        ctx.record_supervision("scribe", 2, &EvaluationResult::pass(88.0));

        assert_eq!(ctx.supervision_history["scribe"].len(), 2);
        assert_eq!(ctx.latest_supervision_score("scribe"), Some(88.0));
        assert_eq!(ctx.latest_supervision_score("architect"), None);
    }

    #[tokio::test]
    async fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("context.json");
        let mut ctx = ResearchContext::new(json!({"topic": "observer design"}), stages());
        ctx.record_output("a", json!("literature"));
        ctx.log_execution("architect", "search", "success", "");

        ctx.save_to_file(&path).await.unwrap();
        let loaded = ResearchContext::load_from_file(&path).await.unwrap();

        assert_eq!(loaded.output_str("a"), Some("literature"));
        assert_eq!(loaded.execution_log.len(), 1);
        assert_eq!(loaded.stage_order, stages());
    }
}
