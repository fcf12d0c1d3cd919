//! # Pipeline Events
//!
//! Event types published by the workflow engine and re-published by the
//! orchestrator on its session-level bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of pipeline event
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Engine entered `Running` for a new traversal
    WorkflowStarted,
    /// A stage started; carries its target percentage
    ProgressUpdated,
    /// Human-readable log line
    LogMessage,
    /// A stage handler returned successfully
    StageCompleted,
    /// The engine is blocked until `confirm_stage` or `stop`
    StageConfirmationRequired,
    /// A confirmation payload was consumed
    StageConfirmed,
    /// All stages ran
    WorkflowCompleted,
    /// A stage failed fatally
    WorkflowError,
    /// A stop signal was observed
    WorkflowStopped,
}

impl EventKind {
    /// Every kind, in lifecycle order
    pub fn all() -> [EventKind; 9] {
        [
            EventKind::WorkflowStarted,
            EventKind::ProgressUpdated,
            EventKind::LogMessage,
            EventKind::StageCompleted,
            EventKind::StageConfirmationRequired,
            EventKind::StageConfirmed,
            EventKind::WorkflowCompleted,
            EventKind::WorkflowError,
            EventKind::WorkflowStopped,
        ]
    }

    /// Lifecycle events are published with `publish_awaiting`; progress and
    /// log lines go through the synchronous path only.
    pub fn is_lifecycle(&self) -> bool {
        !matches!(self, EventKind::ProgressUpdated | EventKind::LogMessage)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::WorkflowStarted => "workflow_started",
            EventKind::ProgressUpdated => "progress_updated",
            EventKind::LogMessage => "log_message",
            EventKind::StageCompleted => "stage_completed",
            EventKind::StageConfirmationRequired => "stage_confirmation_required",
            EventKind::StageConfirmed => "stage_confirmed",
            EventKind::WorkflowCompleted => "workflow_completed",
            EventKind::WorkflowError => "workflow_error",
            EventKind::WorkflowStopped => "workflow_stopped",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity attached to `log_message` events
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    #[default]
    Info,
    Success,
    Warning,
    Error,
    /// Agent activity (stage start, re-execution)
    Agent,
}

/// An event on a bus. Immutable once published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Kind of event
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Associated data (JSON)
    #[serde(default)]
    pub data: serde_json::Value,
    /// Timestamp
    pub timestamp: DateTime<Utc>,
    /// Component that published the event
    #[serde(default)]
    pub source: String,
}

impl Event {
    /// Create a new event stamped with the current time
    pub fn new(kind: EventKind, data: serde_json::Value, source: &str) -> Self {
        Self {
            kind,
            data,
            timestamp: Utc::now(),
            source: source.to_string(),
        }
    }

    /// Read a string field from the payload
    pub fn str_field(&self, field: &str) -> Option<&str> {
        self.data.get(field).and_then(|v| v.as_str())
    }
}
