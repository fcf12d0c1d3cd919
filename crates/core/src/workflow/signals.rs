//! # Control Signals
//!
//! Stop and confirm cross the worker boundary through an [`EngineHandle`],
//! which any task or thread may hold. Stop cancels a token that the engine
//! selects on; confirm sends a single payload through a one-slot channel.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::state::WorkflowState;
use crate::error::WorkflowError;

/// Payload delivered by `confirm_stage`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    /// Free-form note from the reviewer
    pub modification: Option<String>,
    /// Stage or agent key to roll back to
    pub rollback_to: Option<String>,
}

impl Confirmation {
    pub fn proceed() -> Self {
        Self::default()
    }

    pub fn rollback(target: &str) -> Self {
        Self {
            modification: None,
            rollback_to: Some(target.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Status {
    pub state: WorkflowState,
    pub stage_index: usize,
}

/// State shared between the engine worker and its handles
pub(crate) struct Control {
    status: Mutex<Status>,
    cancel: Mutex<CancellationToken>,
    confirm_tx: mpsc::Sender<Confirmation>,
}

impl Control {
    pub(crate) fn new() -> (Arc<Self>, mpsc::Receiver<Confirmation>) {
        let (confirm_tx, confirm_rx) = mpsc::channel(1);
        let control = Self {
            status: Mutex::new(Status::default()),
            cancel: Mutex::new(CancellationToken::new()),
            confirm_tx,
        };
        (Arc::new(control), confirm_rx)
    }

    pub(crate) fn status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Claim the engine for a new traversal and arm a fresh stop token
    pub(crate) fn begin(&self, len: usize, resume_index: usize) -> Result<(), WorkflowError> {
        let mut status = self.status();
        if status.state.is_active() {
            return Err(WorkflowError::AlreadyRunning);
        }
        if resume_index > len {
            return Err(WorkflowError::InvalidResumeIndex {
                index: resume_index,
                len,
            });
        }

        *self.cancel.lock().unwrap_or_else(PoisonError::into_inner) = CancellationToken::new();
        status.state = WorkflowState::Running;
        status.stage_index = resume_index;
        Ok(())
    }

    pub(crate) fn set_state(&self, state: WorkflowState) {
        self.status().state = state;
    }

    pub(crate) fn set_stage_index(&self, index: usize) {
        self.status().stage_index = index;
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.token().is_cancelled()
    }
}

/// Cloneable remote control for a [`WorkflowEngine`](super::WorkflowEngine)
#[derive(Clone)]
pub struct EngineHandle {
    control: Arc<Control>,
}

impl EngineHandle {
    pub(crate) fn new(control: Arc<Control>) -> Self {
        Self { control }
    }

    /// Request a stop. Also releases a pending confirmation wait.
    pub fn stop(&self) -> Result<(), WorkflowError> {
        let status = self.control.status();
        if !status.state.is_active() {
            return Err(WorkflowError::NotRunning);
        }
        self.control.token().cancel();
        tracing::info!(stage_index = status.stage_index, "Stop requested");
        Ok(())
    }

    /// Deliver one confirmation. A second confirmation sent before the
    /// engine consumed the first is rejected with `ConfirmationPending`.
    /// Confirmations that arrive while no stage is awaiting one are
    /// discarded when the next wait begins.
    pub fn confirm_stage(
        &self,
        modification: Option<String>,
        rollback_to: Option<String>,
    ) -> Result<(), WorkflowError> {
        if !self.is_running() {
            return Err(WorkflowError::NotRunning);
        }

        let confirmation = Confirmation {
            modification,
            rollback_to,
        };
        self.control
            .confirm_tx
            .try_send(confirmation)
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => WorkflowError::ConfirmationPending,
                mpsc::error::TrySendError::Closed(_) => WorkflowError::NotRunning,
            })
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_rejects_second_run_and_bad_index() {
        let (control, _rx) = Control::new();

        assert_eq!(
            control.begin(2, 3),
            Err(WorkflowError::InvalidResumeIndex { index: 3, len: 2 })
        );
        control.begin(2, 2).unwrap();
        assert_eq!(control.begin(2, 0), Err(WorkflowError::AlreadyRunning));
    }

    #[test]
    fn test_signals_require_running_engine() {
        let (control, _rx) = Control::new();
        let handle = EngineHandle::new(control);

        assert_eq!(handle.stop(), Err(WorkflowError::NotRunning));
        assert_eq!(
            handle.confirm_stage(None, None),
            Err(WorkflowError::NotRunning)
        );
    }

    #[test]
    fn test_second_confirmation_is_rejected() {
        let (control, mut rx) = Control::new();
        control.begin(1, 0).unwrap();
        let handle = EngineHandle::new(Arc::clone(&control));

        handle.confirm_stage(Some("looks good".into()), None).unwrap();
        assert_eq!(
            handle.confirm_stage(None, None),
            Err(WorkflowError::ConfirmationPending)
        );

        let received = rx.try_recv().unwrap();
        assert_eq!(received.modification.as_deref(), Some("looks good"));
    }

    #[test]
    fn test_stop_cancels_current_token_only() {
        let (control, _rx) = Control::new();
        control.begin(1, 0).unwrap();
        EngineHandle::new(Arc::clone(&control)).stop().unwrap();
        assert!(control.stop_requested());

        control.set_state(WorkflowState::Stopped);
        control.begin(1, 0).unwrap();
        assert!(!control.stop_requested());
    }
}
