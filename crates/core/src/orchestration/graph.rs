//! # Stage Graph
//!
//! Ordered stage configuration: which agent backs each stage, what progress
//! it reports and which earlier stages it reads from. Validated once when
//! the graph is built.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::mapping::StageAgentMap;
use crate::error::WorkflowError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageConfig {
    pub key: String,
    pub agent_key: String,
    pub description: String,
    /// Percentage reported when the stage starts
    pub progress: u8,
    /// Earlier stages whose output this stage reads
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl StageConfig {
    pub fn new(key: &str, agent_key: &str, description: &str, progress: u8) -> Self {
        Self {
            key: key.to_string(),
            agent_key: agent_key.to_string(),
            description: description.to_string(),
            progress,
            depends_on: Vec::new(),
        }
    }

    pub fn depends_on(mut self, stages: &[&str]) -> Self {
        self.depends_on = stages.iter().map(|s| s.to_string()).collect();
        self
    }
}

/// The research pipeline
pub fn default_stages() -> Vec<StageConfig> {
    vec![
        StageConfig::new("literature", "architect", "Agent A: literature review and topic design", 15),
        StageConfig::new("derivation", "theorist", "Agent B: mathematical derivation", 30)
            .depends_on(&["literature"]),
        StageConfig::new("simulation", "engineer", "Agent C: simulation code generation", 45)
            .depends_on(&["derivation"]),
        StageConfig::new("sim_run", "simulator", "Agent C2: simulation run", 60)
            .depends_on(&["simulation"]),
        StageConfig::new("dsp_code", "dsp_coder", "Agent E: DSP code generation", 75)
            .depends_on(&["sim_run"]),
        StageConfig::new("paper", "scribe", "Agent D: paper writing", 95)
            .depends_on(&["derivation", "sim_run"]),
    ]
}

/// A validated stage sequence plus its stage/agent table
#[derive(Debug, Clone)]
pub struct StageGraph {
    stages: Vec<StageConfig>,
    agents: StageAgentMap,
}

impl StageGraph {
    /// Validate `stages`: unique stage keys, unique agent keys, and every
    /// dependency naming an earlier stage.
    pub fn new(stages: Vec<StageConfig>) -> Result<Self, WorkflowError> {
        let mut agents = StageAgentMap::new();
        let mut seen = HashSet::new();

        for stage in &stages {
            for dependency in &stage.depends_on {
                if !seen.contains(dependency.as_str()) {
                    return Err(WorkflowError::UnknownDependency {
                        stage: stage.key.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
            agents.insert(&stage.key, &stage.agent_key)?;
            seen.insert(stage.key.as_str());
        }

        Ok(Self { stages, agents })
    }

    pub fn research() -> Result<Self, WorkflowError> {
        Self::new(default_stages())
    }

    pub fn stages(&self) -> &[StageConfig] {
        &self.stages
    }

    pub fn stage_keys(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.key.clone()).collect()
    }

    pub fn agents(&self) -> &StageAgentMap {
        &self.agents
    }

    pub fn get(&self, stage_key: &str) -> Option<&StageConfig> {
        self.stages.iter().find(|s| s.key == stage_key)
    }

    /// Position of a stage, looked up by stage key or agent key
    pub fn find_stage_index(&self, key: &str) -> Option<usize> {
        self.stages
            .iter()
            .position(|s| s.key == key || s.agent_key == key)
    }
}
