//! # Workflow Errors
//!
//! Control-plane misuse reported to callers. Stage failures are not errors
//! here: they settle the engine into `Error` and surface as events.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("a workflow is already running on this engine")]
    AlreadyRunning,

    #[error("no workflow is running")]
    NotRunning,

    #[error("a confirmation is already pending and has not been consumed")]
    ConfirmationPending,

    #[error("resume index {index} is out of range for {len} stages")]
    InvalidResumeIndex { index: usize, len: usize },

    #[error("duplicate stage key '{0}'")]
    DuplicateStage(String),

    #[error("agent '{0}' is mapped to more than one stage")]
    DuplicateAgent(String),

    #[error("agent '{0}' does not back any stage")]
    UnmappedAgent(String),

    #[error("stage '{stage}' depends on '{dependency}', which is not an earlier stage")]
    UnknownDependency { stage: String, dependency: String },

    #[error("unknown session '{0}'")]
    UnknownSession(String),
}
