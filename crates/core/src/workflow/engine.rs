//! # Workflow Engine
//!
//! Walks an ordered list of stage keys, one stage at a time:
//!
//! 1. execute the stage handler
//! 2. heal the stage through an upstream redo if the handler asked for one
//! 3. checkpoint the context
//! 4. run the supervisor retry loop
//! 5. block until confirmed (or stopped), then advance or roll back
//!
//! Stage failures never surface as `Err`: they settle the engine into a
//! terminal state and are reported through the event bus.

use futures::FutureExt;
use serde_json::json;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::signals::{Confirmation, Control, EngineHandle};
use super::stage::{StageDefinition, StageResult};
use super::state::WorkflowState;
use crate::agents::{EvaluationResult, Supervisor};
use crate::config::EngineConfig;
use crate::context::PipelineContext;
use crate::error::WorkflowError;
use crate::events::{EventBus, EventKind, LogLevel};
use crate::orchestration::mapping::StageAgentMap;
use crate::state::checkpoints::{Checkpoint, CheckpointStore};

const SOURCE: &str = "workflow_engine";

/// Stage-sequencing state machine
pub struct WorkflowEngine<C: PipelineContext> {
    stages: HashMap<String, StageDefinition<C>>,
    order: Vec<String>,
    agents: StageAgentMap,
    supervisor: Option<Arc<dyn Supervisor<C>>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    config: EngineConfig,
    events: Arc<EventBus>,
    control: Arc<Control>,
    confirmations: Mutex<mpsc::Receiver<Confirmation>>,
}

impl<C: PipelineContext> WorkflowEngine<C> {
    pub fn new(config: EngineConfig) -> Self {
        let (control, confirmations) = Control::new();
        let events = Arc::new(EventBus::with_capacity(config.event_history_capacity));
        Self {
            stages: HashMap::new(),
            order: Vec::new(),
            agents: StageAgentMap::new(),
            supervisor: None,
            checkpoints: None,
            config,
            events,
            control,
            confirmations: Mutex::new(confirmations),
        }
    }

    /// Publish on an existing bus instead of a private one
    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn with_supervisor(mut self, supervisor: Arc<dyn Supervisor<C>>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// Stage/agent table used for feedback, supervision and redo resolution.
    /// Stages missing from it act as their own agent.
    pub fn with_agent_map(mut self, agents: StageAgentMap) -> Self {
        self.agents = agents;
        self
    }

    pub fn register_stage(&mut self, stage: StageDefinition<C>) -> Result<(), WorkflowError> {
        if self.stages.contains_key(&stage.key) {
            return Err(WorkflowError::DuplicateStage(stage.key));
        }
        self.order.push(stage.key.clone());
        self.stages.insert(stage.key.clone(), stage);
        Ok(())
    }

    /// Registered stage keys, in registration order
    pub fn stage_keys(&self) -> &[String] {
        &self.order
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle::new(Arc::clone(&self.control))
    }

    pub fn state(&self) -> WorkflowState {
        self.control.status().state
    }

    pub fn is_running(&self) -> bool {
        self.state().is_active()
    }

    pub fn current_stage_index(&self) -> usize {
        self.control.status().stage_index
    }

    pub fn stop(&self) -> Result<(), WorkflowError> {
        self.handle().stop()
    }

    pub fn confirm_stage(
        &self,
        modification: Option<String>,
        rollback_to: Option<String>,
    ) -> Result<(), WorkflowError> {
        self.handle().confirm_stage(modification, rollback_to)
    }

    /// Run `stage_keys` from `resume_index` to a terminal state and hand the
    /// context back. Only misuse (already running, bad index) is an `Err`.
    pub async fn run(
        &self,
        context: C,
        stage_keys: &[String],
        resume_index: usize,
    ) -> Result<C, WorkflowError> {
        self.control.begin(stage_keys.len(), resume_index)?;
        Ok(self.drive(context, stage_keys, resume_index).await)
    }

    /// Like [`run`](Self::run) but on a spawned task. The engine is claimed
    /// before this returns, so `stop` and `confirm_stage` work immediately.
    pub fn start(
        self: &Arc<Self>,
        context: C,
        stage_keys: Vec<String>,
        resume_index: usize,
    ) -> Result<JoinHandle<C>, WorkflowError> {
        self.control.begin(stage_keys.len(), resume_index)?;
        let engine = Arc::clone(self);
        Ok(tokio::spawn(async move {
            engine.drive(context, &stage_keys, resume_index).await
        }))
    }

    async fn drive(&self, mut context: C, stage_keys: &[String], mut index: usize) -> C {
        let total = stage_keys.len();
        self.events
            .publish_awaiting(
                EventKind::WorkflowStarted,
                json!({ "stages": stage_keys, "resume_index": index }),
                SOURCE,
            )
            .await;
        if index > 0 {
            self.log(
                LogLevel::Info,
                format!("Resuming workflow at stage {}/{}", index + 1, total),
            );
        }

        while index < total {
            let key = stage_keys[index].as_str();
            self.control.set_stage_index(index);

            if self.control.stop_requested() {
                return self.finish_stopped(context, index).await;
            }

            let result = self.execute_stage(key, &mut context).await;
            if self.control.stop_requested() {
                return self.finish_stopped(context, index).await;
            }
            if !result.success {
                let message = format!(
                    "Stage '{}' failed: {}",
                    key,
                    result.error.unwrap_or_default()
                );
                return self.finish_error(context, key, message).await;
            }

            if let Err(message) = self.resolve_redo(&mut context, stage_keys, index).await {
                return self.finish_error(context, key, message).await;
            }
            if self.control.stop_requested() {
                return self.finish_stopped(context, index).await;
            }

            self.checkpoint(key, &context).await;

            let evaluation = self.supervise(key, &mut context).await;

            let Some(confirmation) = self
                .wait_for_confirmation(key, evaluation.as_ref(), &context)
                .await
            else {
                return self.finish_stopped(context, index).await;
            };
            if self.control.stop_requested() {
                return self.finish_stopped(context, index).await;
            }

            if let Some(target) = confirmation.rollback_to.as_deref() {
                match self.agents.resolve_index(stage_keys, target) {
                    Some(rollback_index) if rollback_index < index => {
                        let rollback_key = stage_keys[rollback_index].as_str();
                        context.clear_outputs_from(rollback_key);
                        self.log(
                            LogLevel::Warning,
                            format!("Rolling back from '{}' to '{}'", key, rollback_key),
                        );
                        index = rollback_index;
                        continue;
                    }
                    Some(_) => self.log(
                        LogLevel::Warning,
                        format!(
                            "Ignoring rollback to '{}': it does not precede '{}'",
                            target, key
                        ),
                    ),
                    None => self.log(
                        LogLevel::Warning,
                        format!("Ignoring rollback to unknown stage '{}'", target),
                    ),
                }
            }

            index += 1;
        }

        self.control.set_stage_index(total);
        self.control.set_state(WorkflowState::Completed);
        self.events.publish(
            EventKind::ProgressUpdated,
            json!({ "percent": 100, "description": "Workflow complete" }),
            SOURCE,
        );
        self.log(LogLevel::Success, "Workflow completed");
        self.events
            .publish_awaiting(
                EventKind::WorkflowCompleted,
                json!({ "context": self.snapshot(&context) }),
                SOURCE,
            )
            .await;

        context
    }

    /// Run one stage. Unregistered keys succeed as no-ops; handler errors
    /// and panics become a failed result.
    async fn execute_stage(&self, key: &str, context: &mut C) -> StageResult {
        let Some(stage) = self.stages.get(key) else {
            self.log(
                LogLevel::Warning,
                format!("Stage '{}' is not registered, skipping", key),
            );
            return StageResult::succeeded(key, Default::default());
        };

        self.events.publish(
            EventKind::ProgressUpdated,
            json!({ "percent": stage.target_progress, "description": stage.description }),
            SOURCE,
        );
        self.log(LogLevel::Agent, format!("Started: {}", stage.description));

        let span = tracing::info_span!(
            "workflow_stage",
            stage = %key,
            description = %stage.description
        );
        let started = Instant::now();
        let outcome = AssertUnwindSafe(stage.handler.handle(context))
            .catch_unwind()
            .instrument(span)
            .await;
        let duration = started.elapsed();

        let error = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{:#}", e)),
            Err(_) => Some("stage handler panicked".to_string()),
        };

        match error {
            None => {
                tracing::debug!(stage = %key, elapsed_ms = duration.as_millis() as u64, "Stage finished");
                self.events
                    .publish_awaiting(
                        EventKind::StageCompleted,
                        json!({
                            "stage_key": key,
                            "description": stage.description,
                            "duration_ms": duration.as_millis() as u64,
                        }),
                        SOURCE,
                    )
                    .await;
                StageResult::succeeded(key, duration)
            }
            Some(message) => {
                self.log(
                    LogLevel::Error,
                    format!("Stage '{}' failed: {}", key, message),
                );
                StageResult::failed(key, duration, message)
            }
        }
    }

    /// Honor a redo request that targets an earlier stage: re-run the target
    /// with the reason as feedback, checkpoint it, then re-run the current
    /// stage. Returns the failure message if either re-run fails.
    async fn resolve_redo(
        &self,
        context: &mut C,
        stage_keys: &[String],
        index: usize,
    ) -> Result<(), String> {
        let Some(redo) = context.take_redo_request() else {
            return Ok(());
        };

        let current_key = stage_keys[index].as_str();
        let target_stage = self.agents.stage_for(&redo.target_agent);
        let target_index = match stage_keys.iter().position(|k| k == target_stage) {
            Some(target_index) if target_index < index => target_index,
            _ => {
                self.log(
                    LogLevel::Warning,
                    format!(
                        "Ignoring redo of '{}' requested by '{}': not an earlier stage",
                        redo.target_agent, current_key
                    ),
                );
                return Ok(());
            }
        };

        let target_key = stage_keys[target_index].as_str();
        let target_agent = self.agents.agent_for(target_key).to_string();
        self.log(
            LogLevel::Warning,
            format!(
                "'{}' requested redo of '{}': {}",
                self.agents.agent_for(current_key),
                target_agent,
                redo.reason
            ),
        );

        context.pending_feedback_mut().insert(
            target_agent.clone(),
            format!("Downstream feedback: {}", redo.reason),
        );
        let healed = self.execute_stage(target_key, context).await;
        if !healed.success {
            context.pending_feedback_mut().remove(&target_agent);
            return Err(format!(
                "Redo of stage '{}' failed: {}",
                target_key,
                healed.error.unwrap_or_default()
            ));
        }
        self.checkpoint(target_key, context).await;
        context.pending_feedback_mut().remove(&target_agent);

        self.log(
            LogLevel::Agent,
            format!("Re-running '{}' after redo of '{}'", current_key, target_key),
        );
        let rerun = self.execute_stage(current_key, context).await;
        if !rerun.success {
            return Err(format!(
                "Stage '{}' failed after redo: {}",
                current_key,
                rerun.error.unwrap_or_default()
            ));
        }

        if let Some(nested) = context.take_redo_request() {
            self.log(
                LogLevel::Warning,
                format!(
                    "Discarding nested redo of '{}' raised during redo handling",
                    nested.target_agent
                ),
            );
        }
        Ok(())
    }

    /// Supervisor retry loop. Returns the last successful evaluation.
    async fn supervise(&self, key: &str, context: &mut C) -> Option<EvaluationResult> {
        let supervisor = self.supervisor.as_ref()?;
        if !self.stages.contains_key(key) {
            return None;
        }

        let agent = self.agents.agent_for(key).to_string();
        let max_retries = self.config.max_supervisor_retries;
        let mut result = self.evaluate(&**supervisor, &agent, context, 1).await?;
        let mut retries = 0;

        while !result.passed && retries < max_retries {
            if self.control.stop_requested() {
                break;
            }

            self.log(
                LogLevel::Warning,
                format!(
                    "Supervisor scored '{}' at {:.0}; revising (attempt {}/{})",
                    agent,
                    result.score,
                    retries + 1,
                    max_retries
                ),
            );
            for issue in &result.issues {
                self.log(LogLevel::Warning, format!("Issue: {}", issue));
            }
            for suggestion in &result.suggestions {
                self.log(LogLevel::Info, format!("Suggestion: {}", suggestion));
            }

            context
                .pending_feedback_mut()
                .insert(agent.clone(), result.feedback());
            let rerun = self.execute_stage(key, context).await;
            context.pending_feedback_mut().remove(&agent);

            if !rerun.success {
                tracing::warn!(
                    stage = %key,
                    agent = %agent,
                    error = rerun.error.as_deref().unwrap_or_default(),
                    "Re-execution failed during supervision, abandoning retries"
                );
                self.log(
                    LogLevel::Warning,
                    format!("Revision of '{}' failed; keeping the last evaluation", agent),
                );
                break;
            }
            if let Some(redo) = context.take_redo_request() {
                self.log(
                    LogLevel::Warning,
                    format!(
                        "Discarding redo of '{}' raised while revising '{}'",
                        redo.target_agent, agent
                    ),
                );
            }

            self.checkpoint(key, context).await;
            retries += 1;

            match self
                .evaluate(&**supervisor, &agent, context, retries + 1)
                .await
            {
                Some(next) => result = next,
                None => break,
            }
        }

        if result.passed {
            self.log(
                LogLevel::Success,
                format!("Supervisor approved '{}' (score {:.0})", agent, result.score),
            );
        } else if retries >= max_retries {
            self.log(
                LogLevel::Warning,
                format!(
                    "'{}' still below the bar after {} revisions",
                    agent, max_retries
                ),
            );
        }

        Some(result)
    }

    async fn evaluate(
        &self,
        supervisor: &dyn Supervisor<C>,
        agent: &str,
        context: &mut C,
        iteration: u32,
    ) -> Option<EvaluationResult> {
        match supervisor.evaluate(agent, context).await {
            Ok(result) => {
                context.record_supervision(agent, iteration, &result);
                Some(result)
            }
            Err(e) => {
                self.log(
                    LogLevel::Warning,
                    format!("Supervisor evaluation of '{}' failed: {:#}", agent, e),
                );
                None
            }
        }
    }

    /// Block until a confirmation arrives. `None` means stop was requested.
    async fn wait_for_confirmation(
        &self,
        key: &str,
        evaluation: Option<&EvaluationResult>,
        context: &C,
    ) -> Option<Confirmation> {
        let mut confirmations = self.confirmations.lock().await;
        while confirmations.try_recv().is_ok() {
            tracing::debug!(stage = %key, "Discarding stale confirmation");
        }

        self.control.set_state(WorkflowState::WaitingConfirmation);
        self.log(
            LogLevel::Info,
            format!("Waiting for confirmation of '{}'", key),
        );
        self.events
            .publish_awaiting(
                EventKind::StageConfirmationRequired,
                json!({
                    "stage_key": key,
                    "agent_key": self.agents.agent_for(key),
                    "evaluation": evaluation,
                    "context": self.snapshot(context),
                }),
                SOURCE,
            )
            .await;

        let token = self.control.token();
        let poll = self.config.confirmation_poll_interval();
        let confirmation = loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return None,
                received = confirmations.recv() => match received {
                    Some(confirmation) => break confirmation,
                    None => return None,
                },
                _ = tokio::time::sleep(poll) => {
                    tracing::trace!(stage = %key, "Still waiting for confirmation");
                }
            }
        };

        self.control.set_state(WorkflowState::Running);
        if let Some(modification) = &confirmation.modification {
            self.log(
                LogLevel::Info,
                format!("Confirmation note for '{}': {}", key, modification),
            );
        }
        self.events
            .publish_awaiting(
                EventKind::StageConfirmed,
                json!({
                    "stage_key": key,
                    "modification": confirmation.modification,
                    "rollback_to": confirmation.rollback_to,
                }),
                SOURCE,
            )
            .await;

        Some(confirmation)
    }

    /// Write a checkpoint; failures only degrade resumability
    async fn checkpoint(&self, key: &str, context: &C) {
        let Some(store) = &self.checkpoints else {
            return;
        };

        let saved = match context.to_snapshot() {
            Ok(state) => store.save(&Checkpoint::new(key, state)).await,
            Err(e) => Err(e),
        };
        match saved {
            Ok(()) => tracing::debug!(stage = %key, "Checkpoint saved"),
            Err(e) => self.log(
                LogLevel::Warning,
                format!("Checkpoint for '{}' failed: {:#}", key, e),
            ),
        }
    }

    async fn finish_stopped(&self, context: C, index: usize) -> C {
        self.control.set_state(WorkflowState::Stopped);
        self.log(LogLevel::Warning, "Workflow stopped");
        self.events
            .publish_awaiting(
                EventKind::WorkflowStopped,
                json!({ "stage_index": index, "context": self.snapshot(&context) }),
                SOURCE,
            )
            .await;
        context
    }

    async fn finish_error(&self, context: C, key: &str, message: String) -> C {
        self.control.set_state(WorkflowState::Error);
        self.log(LogLevel::Error, message.clone());
        self.events
            .publish_awaiting(
                EventKind::WorkflowError,
                json!({ "stage_key": key, "message": message }),
                SOURCE,
            )
            .await;
        context
    }

    fn snapshot(&self, context: &C) -> serde_json::Value {
        context.to_snapshot().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Context snapshot failed");
            serde_json::Value::Null
        })
    }

    /// Publish a log line and mirror it to tracing
    fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Error => tracing::error!("{}", message),
            LogLevel::Warning => tracing::warn!("{}", message),
            _ => tracing::info!("{}", message),
        }
        self.events.publish(
            EventKind::LogMessage,
            json!({ "message": message, "level": level }),
            SOURCE,
        );
    }
}
