use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// User-supplied plan. Carries no runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: String,
    pub agents: Vec<AgentSpec>,
}

/// One execution unit within a stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub id: String,
    /// Opaque reference to the agent image the runtime will invoke.
    pub uses: String,
    #[serde(default)]
    pub depends_on: HashSet<String>,
    #[serde(default)]
    pub input_from: HashSet<String>,
    /// If set, forward only this key from each source's output.
    #[serde(default)]
    pub input_key: Option<String>,
    #[serde(default)]
    pub params: HashMap<String, Value>,
}

impl StackSpec {
    pub fn agent(&self, id: &str) -> Option<&AgentSpec> {
        self.agents.iter().find(|a| a.id == id)
    }
}
