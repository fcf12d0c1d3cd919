use serde::{Deserialize, Serialize};

/// Engine state. `Idle` is initial; `Completed`, `Error` and `Stopped` end a
/// traversal, after which a new run or resume may start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    #[default]
    Idle,
    Running,
    WaitingConfirmation,
    Completed,
    Error,
    Stopped,
}

impl WorkflowState {
    /// A traversal is in progress
    pub fn is_active(&self) -> bool {
        matches!(self, WorkflowState::Running | WorkflowState::WaitingConfirmation)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowState::Completed | WorkflowState::Error | WorkflowState::Stopped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::Idle => "idle",
            WorkflowState::Running => "running",
            WorkflowState::WaitingConfirmation => "waiting_confirmation",
            WorkflowState::Completed => "completed",
            WorkflowState::Error => "error",
            WorkflowState::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
