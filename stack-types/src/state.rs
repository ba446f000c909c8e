use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Blocked,
}

/// Mutable record per agent within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub id: String,
    pub status: AgentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
    #[serde(default)]
    pub outputs: HashMap<String, Value>,
    #[serde(default)]
    pub dependencies: HashSet<String>,
    /// Reserved for a future retrying runtime; the core never increments it.
    #[serde(default)]
    pub retries: u32,
}

impl AgentState {
    pub fn pending(id: String, dependencies: HashSet<String>) -> Self {
        Self {
            id,
            status: AgentStatus::Pending,
            error_message: None,
            start_time: None,
            end_time: None,
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            dependencies,
            retries: 0,
        }
    }
}

/// Aggregate of a run, maintained by the state manager on every transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackExecutionSummary {
    pub stack_name: String,
    pub execution_id: String,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub total_agents: usize,
    pub completed_count: usize,
    pub failed_count: usize,
    pub blocked_count: usize,
    pub agent_states: HashMap<String, AgentState>,
}

impl StackExecutionSummary {
    pub fn new(stack_name: String, execution_id: String) -> Self {
        Self {
            stack_name,
            execution_id,
            start_time: Utc::now(),
            end_time: None,
            total_agents: 0,
            completed_count: 0,
            failed_count: 0,
            blocked_count: 0,
            agent_states: HashMap::new(),
        }
    }

    pub fn running_count(&self) -> usize {
        self.agent_states
            .values()
            .filter(|s| s.status == AgentStatus::Running)
            .count()
    }

    pub fn pending_count(&self) -> usize {
        self.total_agents
            - (self.completed_count + self.failed_count + self.blocked_count + self.running_count())
    }
}
