use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use stack_types::{AgentRuntime, AgentState, AgentStatus, EngineError, StackExecutionSummary, StackSpec};
use stack_stores::{BackendKind, MemoryStoreFactory, StoreConfig};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::dag::Dag;
use crate::state_manager::StateManager;

/// Broadcast on every per-agent status transition. Purely observational:
/// no subscribers means `send` is a cheap no-op and scheduling is
/// unaffected either way.
#[derive(Debug, Clone)]
pub struct AgentEvent {
    pub agent_id: String,
    pub status: AgentStatus,
    pub execution_id: String,
}

pub struct StackEngineOptions {
    pub verbose: bool,
    pub factory: Arc<MemoryStoreFactory>,
    pub backend: BackendKind,
    pub store_config: StoreConfig,
    /// Bypasses `factory`/`backend`/`store_config` entirely; primarily for
    /// tests that want to inspect or pre-seed state.
    pub state_manager_override: Option<Arc<StateManager>>,
    pub runtimes: HashMap<String, Arc<dyn AgentRuntime>>,
}

impl Default for StackEngineOptions {
    fn default() -> Self {
        Self {
            verbose: false,
            factory: Arc::new(MemoryStoreFactory::new()),
            backend: BackendKind::InMemory,
            store_config: StoreConfig { collection_name: "stacks".to_string(), ..Default::default() },
            state_manager_override: None,
            runtimes: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub timeout: Option<Duration>,
    pub initial_input: HashMap<String, Value>,
    pub runtime_tag: String,
    pub runtime_options: HashMap<String, Value>,
}

/// Drives a `StackSpec` through the pending -> running -> completed/failed/
/// blocked lifecycle. One engine instance executes at most one run
/// concurrently.
pub struct StackEngine {
    spec: StackSpec,
    dag: Dag,
    execution_id: String,
    state: Arc<StateManager>,
    cancellation: CancellationToken,
    is_running: Arc<AtomicBool>,
    runtimes: HashMap<String, Arc<dyn AgentRuntime>>,
    events: broadcast::Sender<AgentEvent>,
}

fn next_execution_id() -> String {
    format!("exec-{}", uuid::Uuid::new_v4())
}

impl StackEngine {
    pub async fn new(spec: StackSpec, options: StackEngineOptions) -> Result<Self, EngineError> {
        let dag = Dag::build(&spec)?;
        let execution_id = next_execution_id();

        let state = match options.state_manager_override {
            Some(existing) => existing,
            None => {
                let store = options.factory.create_memory_store(options.backend, options.store_config).await?;
                Arc::new(StateManager::open(store, spec.name.clone(), execution_id.clone()).await?)
            }
        };

        let agents: Vec<(String, HashSet<String>)> = spec
            .agents
            .iter()
            .map(|a| (a.id.clone(), dag.dependencies_of(&a.id).cloned().unwrap_or_default()))
            .collect();
        state.initialize_agents(&agents).await?;

        let (events, _) = broadcast::channel(256);

        if options.verbose {
            info!(stack = %spec.name, execution_id = %execution_id, agents = spec.agents.len(), "engine initialized");
        }

        Ok(Self {
            spec,
            dag,
            execution_id,
            state,
            cancellation: CancellationToken::new(),
            is_running: Arc::new(AtomicBool::new(false)),
            runtimes: options.runtimes,
            events,
        })
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    /// Cancels the in-flight run, if any. Idempotent.
    pub fn stop(&self) {
        self.cancellation.cancel();
    }

    pub async fn snapshot(&self) -> StackExecutionSummary {
        self.state.summary().await
    }

    pub async fn agent_snapshot(&self, id: &str) -> Result<AgentState, EngineError> {
        self.state.get_all(id).await
    }

    pub async fn execute(&self, options: ExecuteOptions) -> Result<StackExecutionSummary, EngineError> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyRunning);
        }
        let result = self.run(options).await;
        self.is_running.store(false, Ordering::SeqCst);
        let _ = self.state.close().await;
        result
    }

    async fn run(&self, options: ExecuteOptions) -> Result<StackExecutionSummary, EngineError> {
        let runtime = self
            .runtimes
            .get(&options.runtime_tag)
            .ok_or_else(|| EngineError::InvalidSpec(format!("unknown runtime tag '{}'", options.runtime_tag)))?
            .clone();
        runtime.configure(&options.runtime_options);

        let run_token = self.cancellation.child_token();
        let _timeout_guard = options.timeout.map(|timeout| {
            let token = run_token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                token.cancel();
            })
        });

        let mut completed: HashSet<String> = HashSet::new();
        let mut failed: HashSet<String> = HashSet::new();
        let mut blocked: HashSet<String> = HashSet::new();
        let mut was_cancelled = false;

        for id in self.dag.topological_order().to_vec() {
            if run_token.is_cancelled() {
                was_cancelled = true;
                break;
            }

            let deps = self.dag.dependencies_of(&id).cloned().unwrap_or_default();
            let blocking_dep = deps.iter().find(|d| failed.contains(*d) || blocked.contains(*d));
            if let Some(dep) = blocking_dep {
                warn!(agent = %id, blocking_dependency = %dep, "marking agent blocked");
                self.state.update_status(&id, AgentStatus::Blocked).await?;
                blocked.insert(id.clone());
                self.emit(&id, AgentStatus::Blocked);
                continue;
            }

            let agent_spec = self.spec.agent(&id).expect("dag node must exist in spec");

            self.state.update_status(&id, AgentStatus::Running).await?;
            self.emit(&id, AgentStatus::Running);

            let inputs = match self.collect_inputs(agent_spec, &options.initial_input, &completed).await {
                Ok(inputs) => inputs,
                Err(err) => {
                    error!(agent = %id, error = %err, "input collection failed");
                    self.fail_step(&id, &err.to_string()).await?;
                    failed.insert(id.clone());
                    self.emit(&id, AgentStatus::Failed);
                    continue;
                }
            };
            self.state.set(&id, "input", serde_json::to_value(&inputs).unwrap_or(Value::Null)).await?;

            match runtime.execute(run_token.clone(), agent_spec, &inputs).await {
                Ok(outputs) => {
                    self.state.set(&id, "output", serde_json::to_value(&outputs).unwrap_or(Value::Null)).await?;
                    self.state.update_status(&id, AgentStatus::Completed).await?;
                    completed.insert(id.clone());
                    self.emit(&id, AgentStatus::Completed);
                }
                Err(_err) if run_token.is_cancelled() => {
                    self.fail_step(&id, "cancelled").await?;
                    failed.insert(id.clone());
                    self.emit(&id, AgentStatus::Failed);
                    was_cancelled = true;
                    break;
                }
                Err(err) => {
                    error!(agent = %id, error = %err, "agent failed");
                    self.fail_step(&id, &err.to_string()).await?;
                    failed.insert(id.clone());
                    self.emit(&id, AgentStatus::Failed);
                }
            }
        }

        if was_cancelled {
            return Err(EngineError::Cancelled);
        }

        let summary = self.state.summary().await;
        if summary.completed_count == summary.total_agents {
            Ok(summary)
        } else {
            Err(EngineError::PartialFailure {
                completed: summary.completed_count,
                failed: failed.len(),
                failed_ids: failed.into_iter().collect(),
                blocked: blocked.len(),
                blocked_ids: blocked.into_iter().collect(),
            })
        }
    }

    async fn collect_inputs(
        &self,
        agent_spec: &stack_types::AgentSpec,
        initial_input: &HashMap<String, Value>,
        completed: &HashSet<String>,
    ) -> Result<HashMap<String, Value>, EngineError> {
        let mut inputs = initial_input.clone();
        for (key, value) in &agent_spec.params {
            inputs.insert(key.clone(), value.clone());
        }

        let mut sources: Vec<&String> = agent_spec.input_from.iter().collect();
        sources.sort();
        for source in sources {
            if !completed.contains(source) {
                return Err(EngineError::DependencyNotReady(source.clone()));
            }
            let source_state = self.state.get_all(source).await?;
            let value = match &agent_spec.input_key {
                Some(key) => source_state.outputs.get(key).cloned().unwrap_or(Value::Null),
                None => serde_json::to_value(&source_state.outputs).unwrap_or(Value::Null),
            };
            inputs.insert(source.clone(), value);
        }
        Ok(inputs)
    }

    async fn fail_step(&self, id: &str, message: &str) -> Result<(), EngineError> {
        self.state.set(id, "error", Value::String(message.to_string())).await?;
        self.state.update_status(id, AgentStatus::Failed).await
    }

    fn emit(&self, id: &str, status: AgentStatus) {
        let _ = self.events.send(AgentEvent {
            agent_id: id.to_string(),
            status,
            execution_id: self.execution_id.clone(),
        });
    }
}

/// Renders a run's summary as a table, for CLI front-ends that want a
/// human-readable dump without depending on the summary's JSON shape.
pub fn pretty_print_summary(summary: &StackExecutionSummary) -> String {
    let mut table = comfy_table::Table::new();
    table.set_header(vec!["agent", "status", "error"]);
    let mut ids: Vec<&String> = summary.agent_states.keys().collect();
    ids.sort();
    for id in ids {
        let state = &summary.agent_states[id];
        table.add_row(vec![
            state.id.clone(),
            format!("{:?}", state.status),
            state.error_message.clone().unwrap_or_default(),
        ]);
    }
    format!(
        "{} ({}/{} completed)\n{table}",
        summary.stack_name, summary.completed_count, summary.total_agents
    )
}
