//! # Sessions
//!
//! Many independent pipeline runs side by side. Each session owns an
//! orchestrator with its own working directory and keeps a bounded,
//! sequence-numbered log of everything its bus published, so pollers can
//! catch up with `events_since`.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::Notify;

use super::orchestrator::Orchestrator;
use crate::config::OrchestratorConfig;
use crate::context::PipelineContext;
use crate::error::WorkflowError;
use crate::events::{listener, Event, EventKind};
use crate::workflow::WorkflowState;

/// Events retained per session
pub const MAX_EVENT_LOG: usize = 2000;

/// Builds a fully wired orchestrator (agents, supervisor) for a new session
pub type OrchestratorFactory<C> =
    Arc<dyn Fn(OrchestratorConfig) -> Result<Orchestrator<C>> + Send + Sync>;

/// An event with its position in the session log
#[derive(Debug, Clone, Serialize)]
pub struct SessionEvent {
    pub seq: u64,
    #[serde(flatten)]
    pub event: Event,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SessionStatus {
    pub session_id: String,
    pub state: WorkflowState,
    pub progress: u8,
    pub current_stage: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SessionSummary {
    pub session_id: String,
    pub state: WorkflowState,
    pub progress: u8,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
struct SessionLog {
    events: VecDeque<SessionEvent>,
    seq: u64,
    progress: u8,
    current_stage: String,
    error: Option<String>,
}

pub struct Session<C: PipelineContext> {
    id: String,
    orchestrator: Orchestrator<C>,
    log: Mutex<SessionLog>,
    notify: Notify,
    created_at: DateTime<Utc>,
}

impl<C: PipelineContext> Session<C> {
    fn new(id: String, orchestrator: Orchestrator<C>) -> Arc<Self> {
        let session = Arc::new(Self {
            id,
            orchestrator,
            log: Mutex::new(SessionLog::default()),
            notify: Notify::new(),
            created_at: Utc::now(),
        });

        // Weak: the bus is owned by the session itself
        for kind in EventKind::all() {
            let weak: Weak<Self> = Arc::downgrade(&session);
            session.orchestrator.events().subscribe(
                kind,
                listener(move |event| {
                    if let Some(session) = weak.upgrade() {
                        session.record(event);
                    }
                    Ok(())
                }),
            );
        }

        session
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn orchestrator(&self) -> &Orchestrator<C> {
        &self.orchestrator
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn status(&self) -> SessionStatus {
        let log = self.log();
        SessionStatus {
            session_id: self.id.clone(),
            state: self.orchestrator.state(),
            progress: log.progress,
            current_stage: log.current_stage.clone(),
            error: log.error.clone(),
        }
    }

    /// Sequence number of the newest recorded event (0 before any)
    pub fn last_seq(&self) -> u64 {
        self.log().seq
    }

    /// Logged events with `seq > after`, oldest first
    pub fn events_since(&self, after: u64) -> Vec<SessionEvent> {
        self.log()
            .events
            .iter()
            .filter(|e| e.seq > after)
            .cloned()
            .collect()
    }

    /// Like `events_since`, but waits up to `timeout` for something new
    pub async fn wait_for_events(&self, after: u64, timeout: Duration) -> Vec<SessionEvent> {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let events = self.events_since(after);
        if !events.is_empty() {
            return events;
        }
        let _ = tokio::time::timeout(timeout, notified).await;
        self.events_since(after)
    }

    fn record(&self, event: &Event) {
        {
            let mut log = self.log();
            match event.kind {
                EventKind::ProgressUpdated => {
                    if let Some(percent) = event.data.get("percent").and_then(|p| p.as_u64()) {
                        log.progress = percent.min(100) as u8;
                    }
                    if let Some(description) = event.str_field("description") {
                        log.current_stage = description.to_string();
                    }
                }
                EventKind::WorkflowError => {
                    log.error = Some(
                        event
                            .str_field("message")
                            .map(str::to_string)
                            .unwrap_or_else(|| event.data.to_string()),
                    );
                }
                EventKind::WorkflowCompleted => log.progress = 100,
                _ => {}
            }

            log.seq += 1;
            let seq = log.seq;
            log.events.push_back(SessionEvent {
                seq,
                event: event.clone(),
            });
            while log.events.len() > MAX_EVENT_LOG {
                log.events.pop_front();
            }
        }
        self.notify.notify_waiters();
    }

    fn log(&self) -> MutexGuard<'_, SessionLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Creates, tracks and reaps sessions
pub struct SessionManager<C: PipelineContext> {
    config: OrchestratorConfig,
    factory: OrchestratorFactory<C>,
    sessions: Mutex<HashMap<String, Arc<Session<C>>>>,
}

impl<C: PipelineContext> SessionManager<C> {
    /// `config.output_dir` is the root; each session works in
    /// `<output_dir>/<session_id>`.
    pub fn new(config: OrchestratorConfig, factory: OrchestratorFactory<C>) -> Self {
        Self {
            config,
            factory,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Create a session and start its workflow. A session whose workflow
    /// fails to start is dropped again.
    pub async fn create_session(&self, context: C) -> Result<Arc<Session<C>>> {
        let id = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();
        let mut config = self.config.clone();
        config.output_dir = self.config.output_dir.join(&id);

        let session = Session::new(id.clone(), (self.factory)(config)?);
        self.sessions().insert(id.clone(), Arc::clone(&session));

        if let Err(e) = session.orchestrator.start_workflow(context).await {
            self.sessions().remove(&id);
            return Err(e);
        }

        tracing::info!(session = %id, "Session created");
        Ok(session)
    }

    pub fn get_session(&self, session_id: &str) -> Option<Arc<Session<C>>> {
        self.sessions().get(session_id).cloned()
    }

    /// Remove a session, stopping its run first if asked. Returns whether
    /// the session existed.
    pub fn delete_session(&self, session_id: &str, stop_if_running: bool) -> bool {
        let Some(session) = self.sessions().remove(session_id) else {
            return false;
        };

        if stop_if_running && session.orchestrator.is_running() {
            if let Err(e) = session.orchestrator.stop_workflow() {
                tracing::warn!(session = %session_id, error = %e, "Stop on delete failed");
            }
        }
        session.notify.notify_waiters();
        tracing::info!(session = %session_id, "Session deleted");
        true
    }

    pub fn status(&self, session_id: &str) -> Result<SessionStatus, WorkflowError> {
        self.get_session(session_id)
            .map(|session| session.status())
            .ok_or_else(|| WorkflowError::UnknownSession(session_id.to_string()))
    }

    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        let sessions: Vec<Arc<Session<C>>> = self.sessions().values().cloned().collect();
        let mut summaries: Vec<SessionSummary> = sessions
            .iter()
            .map(|session| SessionSummary {
                session_id: session.id.clone(),
                state: session.orchestrator.state(),
                progress: session.log().progress,
                created_at: session.created_at,
            })
            .collect();
        summaries.sort_by_key(|s| s.created_at);
        summaries
    }

    /// Sessions whose workflow is running or waiting for confirmation
    pub fn active_count(&self) -> usize {
        self.sessions()
            .values()
            .filter(|s| s.orchestrator.is_running())
            .count()
    }

    /// Drop finished sessions older than `max_age`; returns how many
    pub fn cleanup_stale_sessions(&self, max_age: Duration) -> usize {
        let now = Utc::now();
        let stale: Vec<String> = self
            .sessions()
            .values()
            .filter(|s| {
                let old_enough = (now - s.created_at)
                    .to_std()
                    .map_or(false, |age| age >= max_age);
                old_enough && s.orchestrator.state().is_terminal()
            })
            .map(|s| s.id.clone())
            .collect();

        for id in &stale {
            self.delete_session(id, false);
        }
        if !stale.is_empty() {
            tracing::info!(count = stale.len(), "Removed stale sessions");
        }
        stale.len()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<Session<C>>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::Agent;
    use crate::config::EngineConfig;
    use crate::context::ResearchContext;
    use crate::orchestration::graph::StageConfig;
    use async_trait::async_trait;
    use serde_json::json;

    struct NoteAgent;

    #[async_trait]
    impl Agent<ResearchContext> for NoteAgent {
        fn key(&self) -> &str {
            "noter"
        }

        async fn execute(&self, context: &mut ResearchContext) -> Result<()> {
            context.record_output("notes", json!("taken"));
            Ok(())
        }
    }

    fn manager(output_dir: &std::path::Path) -> SessionManager<ResearchContext> {
        let config = OrchestratorConfig {
            output_dir: output_dir.to_path_buf(),
            engine: EngineConfig {
                confirmation_poll_interval_ms: 10,
                ..Default::default()
            },
            stages: Some(vec![StageConfig::new("notes", "noter", "Taking notes", 50)]),
            ..Default::default()
        };
        let factory: OrchestratorFactory<ResearchContext> = Arc::new(|config: OrchestratorConfig| -> Result<Orchestrator<ResearchContext>> {
            let mut orchestrator = Orchestrator::new(config)?;
            orchestrator.register_agent(Arc::new(NoteAgent))?;
            Ok(orchestrator)
        });
        SessionManager::new(config, factory)
    }

    async fn wait_for_state(session: &Session<ResearchContext>, state: WorkflowState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while session.orchestrator().state() != state {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());

        let session = manager
            .create_session(ResearchContext::default())
            .await
            .unwrap();
        assert!(session.orchestrator().project_dir().unwrap().starts_with(dir.path().join(session.id())));
        assert_eq!(manager.active_count(), 1);

        wait_for_state(&session, WorkflowState::WaitingConfirmation).await;
        let status = manager.status(session.id()).unwrap();
        assert_eq!(status.progress, 50);
        assert_eq!(status.current_stage, "Taking notes");

        session.orchestrator().confirm_stage(None, None).unwrap();
        session.orchestrator().wait().await.unwrap();

        let status = manager.status(session.id()).unwrap();
        assert_eq!(status.state, WorkflowState::Completed);
        assert_eq!(status.progress, 100);
        assert!(status.error.is_none());
        assert_eq!(manager.active_count(), 0);
        assert_eq!(manager.list_sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_events_since_is_incremental() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let session = manager
            .create_session(ResearchContext::default())
            .await
            .unwrap();
        wait_for_state(&session, WorkflowState::WaitingConfirmation).await;

        let first = session.events_since(0);
        assert!(!first.is_empty());
        assert!(first.windows(2).all(|pair| pair[0].seq < pair[1].seq));
        let last = session.last_seq();

        session.orchestrator().confirm_stage(None, None).unwrap();
        let newer = session.wait_for_events(last, Duration::from_secs(5)).await;
        assert!(!newer.is_empty());
        assert!(newer.iter().all(|e| e.seq > last));

        session.orchestrator().wait().await.unwrap();
        let all = session.events_since(0);
        assert_eq!(all.last().unwrap().event.kind, EventKind::WorkflowCompleted);
    }

    #[tokio::test]
    async fn test_delete_stops_running_session() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let session = manager
            .create_session(ResearchContext::default())
            .await
            .unwrap();
        wait_for_state(&session, WorkflowState::WaitingConfirmation).await;

        assert!(manager.delete_session(session.id(), true));
        assert!(!manager.delete_session(session.id(), true));
        session.orchestrator().wait().await.unwrap();

        assert_eq!(session.orchestrator().state(), WorkflowState::Stopped);
        assert!(manager.get_session(session.id()).is_none());
        assert_eq!(
            manager.status(session.id()),
            Err(WorkflowError::UnknownSession(session.id().to_string()))
        );
    }

    #[tokio::test]
    async fn test_cleanup_only_removes_finished_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());

        let finished = manager
            .create_session(ResearchContext::default())
            .await
            .unwrap();
        wait_for_state(&finished, WorkflowState::WaitingConfirmation).await;
        finished.orchestrator().stop_workflow().unwrap();
        finished.orchestrator().wait().await.unwrap();

        let running = manager
            .create_session(ResearchContext::default())
            .await
            .unwrap();

        assert_eq!(manager.cleanup_stale_sessions(Duration::from_secs(3600)), 0);
        assert_eq!(manager.cleanup_stale_sessions(Duration::ZERO), 1);
        assert!(manager.get_session(finished.id()).is_none());
        assert!(manager.get_session(running.id()).is_some());

        manager.delete_session(running.id(), true);
    }

    #[test]
    fn test_event_log_is_bounded() {
        let config = OrchestratorConfig::default();
        let orchestrator: Orchestrator<ResearchContext> = Orchestrator::new(config).unwrap();
        let session = Session::new("bounded".to_string(), orchestrator);

        for i in 0..MAX_EVENT_LOG + 5 {
            session
                .orchestrator()
                .events()
                .publish(EventKind::LogMessage, json!({ "message": i }), "test");
        }

        let events = session.events_since(0);
        assert_eq!(events.len(), MAX_EVENT_LOG);
        assert_eq!(events[0].seq, 6);
        assert_eq!(session.last_seq(), (MAX_EVENT_LOG + 5) as u64);
    }
}
