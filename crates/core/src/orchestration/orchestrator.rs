//! # Orchestrator
//!
//! Builds a workflow engine from the stage graph and the registered agents,
//! gives every run its own project directory and checkpoint store, and
//! re-publishes engine events on a long-lived bus that outlives any single
//! engine.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::graph::{default_stages, StageGraph};
use crate::agents::{Agent, Supervisor};
use crate::config::{CheckpointBackend, OrchestratorConfig};
use crate::context::PipelineContext;
use crate::error::WorkflowError;
use crate::events::{async_listener, listener, Event, EventBus, EventKind, LogLevel};
use crate::state::checkpoints::{
    resume_point, CheckpointStore, FileCheckpointStore, SqliteCheckpointStore,
};
use crate::state::db::RelayDb;
use crate::state::io::{
    checkpoint_db_path, checkpoint_dir, create_project_dir, write_artifacts, CONTEXT_FILE,
};
use crate::workflow::{StageDefinition, StageHandler, WorkflowEngine, WorkflowState};

const SOURCE: &str = "orchestrator";

/// Runs an agent as a stage handler inside an `agent_execution` span
struct AgentStage<C: PipelineContext> {
    agent: Arc<dyn Agent<C>>,
}

#[async_trait]
impl<C: PipelineContext> StageHandler<C> for AgentStage<C> {
    async fn handle(&self, context: &mut C) -> Result<()> {
        let span = tracing::info_span!("agent_execution", agent = %self.agent.key());
        self.agent.execute(context).instrument(span).await
    }
}

struct ActiveRun<C: PipelineContext> {
    engine: Arc<WorkflowEngine<C>>,
    project_dir: PathBuf,
    task: Option<JoinHandle<Result<C>>>,
}

/// Research pipeline orchestrator
pub struct Orchestrator<C: PipelineContext> {
    config: OrchestratorConfig,
    graph: StageGraph,
    agents: HashMap<String, Arc<dyn Agent<C>>>,
    supervisor: Option<Arc<dyn Supervisor<C>>>,
    events: Arc<EventBus>,
    context: Arc<Mutex<Option<C>>>,
    active: Mutex<Option<ActiveRun<C>>>,
}

impl<C: PipelineContext> Orchestrator<C> {
    /// Create from config; the stage graph is validated here
    pub fn new(config: OrchestratorConfig) -> Result<Self, WorkflowError> {
        let graph = StageGraph::new(config.stages.clone().unwrap_or_else(default_stages))?;
        let events = Arc::new(EventBus::with_capacity(config.engine.event_history_capacity));
        Ok(Self {
            config,
            graph,
            agents: HashMap::new(),
            supervisor: None,
            events,
            context: Arc::new(Mutex::new(None)),
            active: Mutex::new(None),
        })
    }

    /// Register an agent under its key. The key must back a stage.
    pub fn register_agent(&mut self, agent: Arc<dyn Agent<C>>) -> Result<&mut Self, WorkflowError> {
        let key = agent.key().to_string();
        if !self.graph.agents().contains_agent(&key) {
            return Err(WorkflowError::UnmappedAgent(key));
        }
        tracing::debug!(agent = %key, "Registered agent");
        self.agents.insert(key, agent);
        Ok(self)
    }

    pub fn unregister_agent(&mut self, key: &str) -> &mut Self {
        self.agents.remove(key);
        self
    }

    pub fn set_supervisor(&mut self, supervisor: Arc<dyn Supervisor<C>>) -> &mut Self {
        self.supervisor = Some(supervisor);
        self
    }

    /// Session-level bus; survives across runs
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn graph(&self) -> &StageGraph {
        &self.graph
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Stages whose agent is registered, in graph order
    pub fn active_stage_keys(&self) -> Vec<String> {
        self.graph
            .stages()
            .iter()
            .filter(|s| self.agents.contains_key(&s.agent_key))
            .map(|s| s.key.clone())
            .collect()
    }

    /// Start a new run in a fresh project directory under `output_dir`
    pub async fn start_workflow(&self, context: C) -> Result<PathBuf> {
        self.ensure_idle()?;

        let project_dir = create_project_dir(&self.config.output_dir).await?;
        let (engine, _) = self.build_engine(&project_dir)?;
        self.launch(engine, context, project_dir.clone(), 0)?;
        Ok(project_dir)
    }

    /// Resume the run in `project_dir` after its newest checkpoint. Starts
    /// from the first stage with `fallback` when there is no checkpoint.
    /// Returns the resume index.
    pub async fn resume_workflow(&self, project_dir: impl AsRef<Path>, fallback: C) -> Result<usize> {
        self.ensure_idle()?;

        let project_dir = project_dir.as_ref().to_path_buf();
        let (engine, store) = self.build_engine(&project_dir)?;

        let (resume_index, context) =
            match resume_point(store.as_ref(), &self.active_stage_keys()).await? {
                Some((index, checkpoint)) => {
                    tracing::info!(
                        stage = %checkpoint.stage_key,
                        saved_at = %checkpoint.saved_at,
                        "Resuming from checkpoint"
                    );
                    (index, C::from_snapshot(checkpoint.state)?)
                }
                None => {
                    tracing::info!(path = ?project_dir, "No checkpoint found, starting over");
                    (0, fallback)
                }
            };

        self.launch(engine, context, project_dir, resume_index)?;
        Ok(resume_index)
    }

    pub fn confirm_stage(
        &self,
        modification: Option<String>,
        rollback_to: Option<String>,
    ) -> Result<(), WorkflowError> {
        self.engine()
            .ok_or(WorkflowError::NotRunning)?
            .confirm_stage(modification, rollback_to)
    }

    pub fn stop_workflow(&self) -> Result<(), WorkflowError> {
        self.engine().ok_or(WorkflowError::NotRunning)?.stop()
    }

    pub fn state(&self) -> WorkflowState {
        self.engine()
            .map(|engine| engine.state())
            .unwrap_or_default()
    }

    pub fn is_running(&self) -> bool {
        self.state().is_active()
    }

    /// Context at the last hand-off: the initial one while running, the
    /// final one once the run ended
    pub fn context(&self) -> Option<C> {
        self.context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn project_dir(&self) -> Option<PathBuf> {
        self.active().as_ref().map(|run| run.project_dir.clone())
    }

    /// Wait for the current run to end and return its final context
    pub async fn wait(&self) -> Result<C> {
        let task = self
            .active()
            .as_mut()
            .and_then(|run| run.task.take())
            .ok_or(WorkflowError::NotRunning)?;
        task.await.context("Workflow task panicked")?
    }

    fn active(&self) -> MutexGuard<'_, Option<ActiveRun<C>>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn engine(&self) -> Option<Arc<WorkflowEngine<C>>> {
        self.active().as_ref().map(|run| Arc::clone(&run.engine))
    }

    fn ensure_idle(&self) -> Result<(), WorkflowError> {
        if self.is_running() {
            return Err(WorkflowError::AlreadyRunning);
        }
        Ok(())
    }

    fn checkpoint_store(&self, project_dir: &Path) -> Result<Arc<dyn CheckpointStore>> {
        let store: Arc<dyn CheckpointStore> = match self.config.checkpoint_backend {
            CheckpointBackend::Files => Arc::new(FileCheckpointStore::new(checkpoint_dir(project_dir))),
            CheckpointBackend::Sqlite => {
                let db = RelayDb::open_at(checkpoint_db_path(project_dir))?;
                Arc::new(SqliteCheckpointStore::new(&db))
            }
        };
        Ok(store)
    }

    fn build_engine(
        &self,
        project_dir: &Path,
    ) -> Result<(Arc<WorkflowEngine<C>>, Arc<dyn CheckpointStore>)> {
        let store = self.checkpoint_store(project_dir)?;
        let mut engine = WorkflowEngine::new(self.config.engine.clone())
            .with_agent_map(self.graph.agents().clone())
            .with_checkpoint_store(Arc::clone(&store));

        for stage in self.graph.stages() {
            let Some(agent) = self.agents.get(&stage.agent_key) else {
                tracing::debug!(stage = %stage.key, "No agent registered, stage left out");
                continue;
            };
            let handler = Arc::new(AgentStage {
                agent: Arc::clone(agent),
            });
            engine.register_stage(StageDefinition::new(
                &stage.key,
                handler,
                &stage.description,
                stage.progress,
            ))?;
        }

        if let Some(supervisor) = &self.supervisor {
            engine = engine.with_supervisor(Arc::clone(supervisor));
        }

        self.forward_events(engine.events());
        Ok((Arc::new(engine), store))
    }

    /// Re-publish engine events here. Completion is published by the run
    /// task once outputs are on disk.
    fn forward_events(&self, engine_bus: &EventBus) {
        engine_bus.clear();
        for kind in EventKind::all() {
            if kind == EventKind::WorkflowCompleted {
                continue;
            }
            let target = Arc::clone(&self.events);
            if kind.is_lifecycle() {
                engine_bus.subscribe_async(
                    kind,
                    async_listener(move |event: Event| {
                        let target = Arc::clone(&target);
                        async move {
                            target
                                .publish_awaiting(event.kind, event.data, &event.source)
                                .await;
                            Ok(())
                        }
                    }),
                );
            } else {
                engine_bus.subscribe(
                    kind,
                    listener(move |event| {
                        target.publish(event.kind, event.data.clone(), &event.source);
                        Ok(())
                    }),
                );
            }
        }
    }

    fn launch(
        &self,
        engine: Arc<WorkflowEngine<C>>,
        context: C,
        project_dir: PathBuf,
        resume_index: usize,
    ) -> Result<()> {
        let stage_keys = self.active_stage_keys();
        if stage_keys.is_empty() {
            tracing::warn!("No agents registered, the workflow has no stages");
        }

        *self.context.lock().unwrap_or_else(PoisonError::into_inner) = Some(context.clone());
        // Registered before the engine starts so early confirmations find it
        *self.active() = Some(ActiveRun {
            engine: Arc::clone(&engine),
            project_dir: project_dir.clone(),
            task: None,
        });
        let run = engine.start(context, stage_keys, resume_index)?;

        let watched = Arc::clone(&engine);
        let events = Arc::clone(&self.events);
        let shared_context = Arc::clone(&self.context);
        let dir = project_dir.clone();
        let task = tokio::spawn(async move {
            let context = run.await.context("Workflow engine task panicked")?;
            *shared_context.lock().unwrap_or_else(PoisonError::into_inner) = Some(context.clone());

            if watched.state() == WorkflowState::Completed {
                if let Err(e) = save_outputs(&dir, &context).await {
                    tracing::error!(path = ?dir, "Saving outputs failed: {:#}", e);
                    events.publish(
                        EventKind::LogMessage,
                        json!({
                            "message": format!("Saving outputs failed: {:#}", e),
                            "level": LogLevel::Error,
                        }),
                        SOURCE,
                    );
                }
                events
                    .publish_awaiting(
                        EventKind::WorkflowCompleted,
                        json!({
                            "context": context.to_snapshot().unwrap_or_default(),
                            "project_dir": dir,
                        }),
                        SOURCE,
                    )
                    .await;
            }

            Ok(context)
        });

        tracing::info!(path = ?project_dir, resume_index, "Workflow launched");
        if let Some(active) = self.active().as_mut() {
            active.task = Some(task);
        }
        Ok(())
    }
}

/// Write `context.json` and every artifact into the project directory
async fn save_outputs<C: PipelineContext>(project_dir: &Path, context: &C) -> Result<()> {
    let snapshot = context.to_snapshot()?;
    let path = project_dir.join(CONTEXT_FILE);
    tokio::fs::write(&path, serde_json::to_string_pretty(&snapshot)?)
        .await
        .with_context(|| format!("Failed to write context: {:?}", path))?;

    let written = write_artifacts(project_dir, &context.artifacts()).await?;
    tracing::info!(path = ?project_dir, artifacts = written.len(), "Outputs saved");
    Ok(())
}
