//! # Configuration
//!
//! Engine and orchestrator settings. Loaded from JSON; every field has a
//! default so a partial (or missing) file is valid.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::orchestration::graph::StageConfig;

/// Environment override for `OrchestratorConfig::output_dir`
pub const OUTPUT_DIR_ENV: &str = "RELAY_OUTPUT_DIR";

/// Workflow engine settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Supervisor-driven re-executions per stage
    pub max_supervisor_retries: u32,
    /// How often the confirmation wait wakes up to re-check the stop flag
    pub confirmation_poll_interval_ms: u64,
    /// Events kept in the engine bus history
    pub event_history_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_supervisor_retries: 3,
            confirmation_poll_interval_ms: 1000,
            event_history_capacity: 500,
        }
    }
}

impl EngineConfig {
    pub fn confirmation_poll_interval(&self) -> Duration {
        Duration::from_millis(self.confirmation_poll_interval_ms.max(1))
    }
}

/// Where checkpoints are written
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointBackend {
    /// One `checkpoint_<stage>.json` per stage under `<project>/checkpoints`
    #[default]
    Files,
    /// `<project>/checkpoints.db`
    Sqlite,
}

/// Orchestrator settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Root for project directories
    pub output_dir: PathBuf,
    pub checkpoint_backend: CheckpointBackend,
    pub engine: EngineConfig,
    /// Custom stage graph (the default research graph when absent)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stages: Option<Vec<StageConfig>>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./output"),
            checkpoint_backend: CheckpointBackend::Files,
            engine: EngineConfig::default(),
            stages: None,
        }
    }
}

impl OrchestratorConfig {
    /// Load from a JSON file. A missing file yields defaults; the
    /// `RELAY_OUTPUT_DIR` environment variable overrides `output_dir`.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if tokio::fs::try_exists(path).await.unwrap_or(false) {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read config: {:?}", path))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Invalid config file: {:?}", path))?
        } else {
            tracing::debug!(path = ?path, "No config file, using defaults");
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// Write as pretty JSON, creating parent directories
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content)
            .await
            .with_context(|| format!("Failed to write config: {:?}", path))
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var(OUTPUT_DIR_ENV) {
            if !dir.is_empty() {
                self.output_dir = PathBuf::from(dir);
            }
        }
    }
}
