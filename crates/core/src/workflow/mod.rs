//! # Workflow
//!
//! The stage state machine and the signals that steer it from outside.

pub mod engine;
pub mod signals;
pub mod stage;
pub mod state;

pub use engine::WorkflowEngine;
pub use signals::{Confirmation, EngineHandle};
pub use stage::{handler_fn, StageDefinition, StageHandler, StageResult};
pub use state::WorkflowState;
