//! Offline template agents and a word-count supervisor, so the pipeline
//! can be driven end to end without any model provider.

use anyhow::Result;
use async_trait::async_trait;
use relay_core::orchestration::StageAgentMap;
use relay_core::{
    Agent, EvaluationResult, PipelineContext, RedoRequest, ResearchContext, StageConfig, Supervisor,
};
use std::sync::Arc;

/// Marker the scribe looks for in the derivation before writing the paper
const STABILITY_MARKER: &str = "stability analysis";

/// Writes a markdown section for its stage from the topic, the outputs of
/// the stages it depends on, and any pending feedback.
pub struct TemplateAgent {
    stage: StageConfig,
}

impl TemplateAgent {
    pub fn new(stage: StageConfig) -> Self {
        Self { stage }
    }

    /// One agent per stage in `stages`
    pub fn for_stages(stages: &[StageConfig]) -> Vec<Arc<dyn Agent<ResearchContext>>> {
        stages
            .iter()
            .cloned()
            .map(|stage| Arc::new(TemplateAgent::new(stage)) as Arc<dyn Agent<ResearchContext>>)
            .collect()
    }

    fn render(&self, context: &ResearchContext) -> String {
        let topic = topic(context);
        let mut out = format!("# {}\n\nTopic: {}\n", self.stage.description, topic);

        for dependency in &self.stage.depends_on {
            let upstream = context.output_str(dependency).unwrap_or("(missing)");
            let first_line = upstream
                .lines()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("(empty)");
            out.push_str(&format!("\nBuilds on `{}`: {}\n", dependency, first_line));
        }

        out.push_str(&format!(
            "\nThis section covers the {} step for {}.\n",
            self.stage.key, topic
        ));

        if let Some(feedback) = context.feedback_for(&self.stage.agent_key) {
            out.push_str("\n## Revision notes\n\n");
            out.push_str(feedback);
            out.push('\n');
            out.push_str(&format!(
                "\nThe revised {} adds a {} of the {} model, spells out the \
                 assumptions behind every step, and lists the parameters used.\n",
                self.stage.key, STABILITY_MARKER, topic
            ));
        }
        out
    }

    /// The scribe refuses to write until the derivation is complete
    fn wants_redo(&self, context: &ResearchContext) -> Option<RedoRequest> {
        if self.stage.agent_key != "scribe" {
            return None;
        }
        let derivation = context.output_str("derivation")?;
        if derivation.contains(STABILITY_MARKER) {
            return None;
        }
        Some(RedoRequest::new(
            "theorist",
            "The derivation needs a stability analysis before the paper can cite it",
        ))
    }
}

#[async_trait]
impl Agent<ResearchContext> for TemplateAgent {
    fn key(&self) -> &str {
        &self.stage.agent_key
    }

    async fn execute(&self, context: &mut ResearchContext) -> Result<()> {
        let agent = self.stage.agent_key.clone();
        let revising = context.feedback_for(&agent).is_some();
        context.log_execution(
            &agent,
            &self.stage.key,
            "started",
            if revising { "with feedback" } else { "" },
        );

        let text = self.render(context);
        context.record_output(&self.stage.key, serde_json::Value::String(text.clone()));
        context.add_artifact(&self.stage.key, format!("{}/{}.md", self.stage.key, agent), text);

        if let Some(redo) = self.wants_redo(context) {
            tracing::info!(agent = %agent, target = %redo.target_agent, "Requesting redo");
            context.set_redo_request(redo);
        }

        context.log_execution(&agent, &self.stage.key, "success", "");
        Ok(())
    }
}

/// Grades a stage by the length of its output
pub struct WordCountSupervisor {
    agents: StageAgentMap,
    min_words: usize,
}

impl WordCountSupervisor {
    pub fn new(agents: StageAgentMap, min_words: usize) -> Self {
        Self { agents, min_words }
    }
}

#[async_trait]
impl Supervisor<ResearchContext> for WordCountSupervisor {
    async fn evaluate(&self, agent_key: &str, context: &ResearchContext) -> Result<EvaluationResult> {
        let stage_key = self.agents.stage_for(agent_key);
        let Some(output) = context.output_str(stage_key) else {
            let mut result = EvaluationResult::fail(
                0.0,
                vec![format!("No output recorded for {}", stage_key)],
                vec!["Produce the stage output before handing off".to_string()],
            );
            result.rollback_to = Some(agent_key.to_string());
            return Ok(result);
        };

        let words = output.split_whitespace().count();
        let score = ((words as f64 / self.min_words.max(1) as f64) * 80.0).min(100.0);
        if words >= self.min_words {
            return Ok(EvaluationResult::pass(score));
        }
        Ok(EvaluationResult::fail(
            score,
            vec![format!("Output is too short ({} words, want {})", words, self.min_words)],
            vec!["State the assumptions and parameters explicitly".to_string()],
        ))
    }
}

fn topic(context: &ResearchContext) -> String {
    context
        .research_config
        .get("topic")
        .and_then(|t| t.as_str())
        .unwrap_or("an unnamed topic")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::orchestration::{default_stages, StageGraph};
    use serde_json::json;

    fn context() -> ResearchContext {
        let order = default_stages().into_iter().map(|s| s.key).collect();
        ResearchContext::new(json!({ "topic": "adaptive notch filters" }), order)
    }

    fn agent(key: &str) -> TemplateAgent {
        let stage = default_stages()
            .into_iter()
            .find(|s| s.agent_key == key)
            .unwrap();
        TemplateAgent::new(stage)
    }

    fn supervisor() -> WordCountSupervisor {
        WordCountSupervisor::new(StageGraph::research().unwrap().agents().clone(), 40)
    }

    #[tokio::test]
    async fn test_agent_records_output_and_artifact() {
        let mut ctx = context();
        agent("architect").execute(&mut ctx).await.unwrap();

        let output = ctx.output_str("literature").unwrap();
        assert!(output.contains("adaptive notch filters"));
        assert_eq!(ctx.artifacts()[0].relative_path.to_str(), Some("literature/architect.md"));
        assert_eq!(ctx.execution_log.len(), 2);
    }

    #[tokio::test]
    async fn test_scribe_requests_redo_until_stability_is_covered() {
        let mut ctx = context();
        agent("theorist").execute(&mut ctx).await.unwrap();
        agent("scribe").execute(&mut ctx).await.unwrap();
        assert_eq!(ctx.take_redo_request().unwrap().target_agent, "theorist");

        ctx.pending_feedback_mut()
            .insert("theorist".into(), "Downstream feedback: add stability".into());
        agent("theorist").execute(&mut ctx).await.unwrap();
        ctx.pending_feedback_mut().clear();
        agent("scribe").execute(&mut ctx).await.unwrap();
        assert!(ctx.redo_request().is_none());
    }

    #[tokio::test]
    async fn test_supervisor_passes_after_feedback() {
        let supervisor = supervisor();
        let mut ctx = context();

        agent("architect").execute(&mut ctx).await.unwrap();
        let first = supervisor.evaluate("architect", &ctx).await.unwrap();
        assert!(!first.passed);
        assert!(!first.issues.is_empty());

        ctx.pending_feedback_mut().insert("architect".into(), first.feedback());
        agent("architect").execute(&mut ctx).await.unwrap();
        let second = supervisor.evaluate("architect", &ctx).await.unwrap();
        assert!(second.passed);
        assert!(second.score > first.score);
    }

    #[tokio::test]
    async fn test_supervisor_flags_missing_output() {
        let result = supervisor()
            .evaluate("engineer", &context())
            .await
            .unwrap();
        assert!(!result.passed);
        assert_eq!(result.rollback_to.as_deref(), Some("engineer"));
    }
}
