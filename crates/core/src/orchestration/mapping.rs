//! # Stage/Agent Mapping
//!
//! Bijective table between stage keys and the agent keys backing them.
//! Redo requests name an agent; rollback targets may name either side.

use std::collections::HashMap;

use crate::error::WorkflowError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageAgentMap {
    stage_to_agent: HashMap<String, String>,
    agent_to_stage: HashMap<String, String>,
}

impl StageAgentMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(stage_key, agent_key)` pairs, failing on any collision
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self, WorkflowError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut map = Self::new();
        for (stage, agent) in pairs {
            map.insert(stage, agent)?;
        }
        Ok(map)
    }

    pub fn insert(&mut self, stage_key: &str, agent_key: &str) -> Result<(), WorkflowError> {
        if self.stage_to_agent.contains_key(stage_key) {
            return Err(WorkflowError::DuplicateStage(stage_key.to_string()));
        }
        if self.agent_to_stage.contains_key(agent_key) {
            return Err(WorkflowError::DuplicateAgent(agent_key.to_string()));
        }
        self.stage_to_agent
            .insert(stage_key.to_string(), agent_key.to_string());
        self.agent_to_stage
            .insert(agent_key.to_string(), stage_key.to_string());
        Ok(())
    }

    /// Agent backing `stage_key`; an unmapped stage is its own agent
    pub fn agent_for<'a>(&'a self, stage_key: &'a str) -> &'a str {
        self.stage_to_agent
            .get(stage_key)
            .map(String::as_str)
            .unwrap_or(stage_key)
    }

    /// Stage backed by `agent_key`; an unmapped agent is its own stage
    pub fn stage_for<'a>(&'a self, agent_key: &'a str) -> &'a str {
        self.agent_to_stage
            .get(agent_key)
            .map(String::as_str)
            .unwrap_or(agent_key)
    }

    pub fn contains_agent(&self, agent_key: &str) -> bool {
        self.agent_to_stage.contains_key(agent_key)
    }

    /// Position of `key` in `stages`, where `key` is a stage key or an agent key
    pub fn resolve_index(&self, stages: &[String], key: &str) -> Option<usize> {
        stages
            .iter()
            .position(|s| s == key)
            .or_else(|| {
                let stage = self.agent_to_stage.get(key)?;
                stages.iter().position(|s| s == stage)
            })
    }

    pub fn len(&self) -> usize {
        self.stage_to_agent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stage_to_agent.is_empty()
    }
}
