//! # Orchestration
//!
//! Composes engines from a stage graph and registered agents, and manages
//! the sessions that run them.

pub mod graph;
pub mod mapping;
pub mod orchestrator;
pub mod session;

pub use graph::{default_stages, StageConfig, StageGraph};
pub use mapping::StageAgentMap;
pub use orchestrator::Orchestrator;
pub use session::{
    OrchestratorFactory, Session, SessionEvent, SessionManager, SessionStatus, SessionSummary,
    MAX_EVENT_LOG,
};
