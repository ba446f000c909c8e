use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use stack_types::{AgentState, AgentStatus, EngineError, StackExecutionSummary};
use stack_stores::KeyedStore;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::warn;

const SUMMARY_KEY: &str = "summary";

fn agent_key(id: &str) -> String {
    format!("agent/{id}")
}

fn input_mirror_key(id: &str) -> String {
    format!("inputs/{id}")
}

fn output_mirror_key(id: &str) -> String {
    format!("outputs/{id}")
}

/// Maps per-agent state and the aggregate summary onto a keyed store.
/// Owns the scope `(stackID, executionID)` for the lifetime of a run: all
/// writes funnel through here so the engine never talks to a store
/// directly.
pub struct StateManager {
    store: Arc<dyn KeyedStore>,
    summary: RwLock<StackExecutionSummary>,
}

impl StateManager {
    /// Opens (or rehydrates) the scope's summary record from `store`.
    pub async fn open(
        store: Arc<dyn KeyedStore>,
        stack_name: String,
        execution_id: String,
    ) -> Result<Self, EngineError> {
        let ct = CancellationToken::new();
        let summary = match store.load(&ct, SUMMARY_KEY).await {
            Ok(value) => serde_json::from_value(value)
                .map_err(|e| EngineError::StateUnavailable(format!("corrupt summary record: {e}")))?,
            Err(EngineError::NotFound(_)) => StackExecutionSummary::new(stack_name, execution_id),
            Err(other) => return Err(other),
        };
        Ok(Self { store, summary: RwLock::new(summary) })
    }

    /// Seeds pending `AgentState` records for `agents` (id, declared
    /// dependencies). Idempotent: re-running against an already-initialized
    /// scope leaves existing counts and statuses untouched.
    pub async fn initialize_agents(&self, agents: &[(String, HashSet<String>)]) -> Result<(), EngineError> {
        let mut summary = self.summary.write().await;
        if !summary.agent_states.is_empty() {
            return Ok(());
        }
        summary.total_agents = agents.len();
        for (id, deps) in agents {
            summary.agent_states.insert(id.clone(), AgentState::pending(id.clone(), deps.clone()));
        }
        self.persist_summary(&summary).await?;
        Ok(())
    }

    /// Stages the transition on a clone of the summary, persists the
    /// summary (the source of truth), and only then swaps the staged value
    /// into the lock. If the summary write fails, the lock is left exactly
    /// as it was — a transient store failure can never leave the in-memory
    /// cache holding a mutation nobody durably recorded.
    pub async fn update_status(&self, id: &str, new_status: AgentStatus) -> Result<(), EngineError> {
        let mut guard = self.summary.write().await;
        let current = guard
            .agent_states
            .get(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?
            .status;

        if !is_legal_transition(current, new_status) {
            return Err(EngineError::InvalidSpec(format!(
                "illegal transition for agent '{id}': {current:?} -> {new_status:?}"
            )));
        }
        if current == new_status {
            return Ok(());
        }

        let mut staged = guard.clone();
        decrement(&mut staged, current);
        increment(&mut staged, new_status);
        staged.agent_states.get_mut(id).unwrap().status = new_status;

        let now = chrono::Utc::now();
        match new_status {
            AgentStatus::Running => staged.agent_states.get_mut(id).unwrap().start_time = Some(now),
            AgentStatus::Completed | AgentStatus::Failed => {
                staged.agent_states.get_mut(id).unwrap().end_time = Some(now)
            }
            _ => {}
        }

        self.persist_summary(&staged).await?;
        *guard = staged;
        self.persist_agent_document(&guard, id).await;
        Ok(())
    }

    /// Upserts `key` in agent `id`'s state map. Writing `"input"`/`"output"`
    /// additionally mirrors the value to `inputs/<id>` / `outputs/<id>`.
    /// Same staged-clone-then-persist-then-swap discipline as
    /// `update_status`: only the summary write is fatal, the mirror and
    /// per-agent-document writes are best-effort once the summary (the
    /// source of truth) has durably landed.
    pub async fn set(&self, id: &str, key: &str, value: Value) -> Result<(), EngineError> {
        let mut guard = self.summary.write().await;
        if !guard.agent_states.contains_key(id) {
            return Err(EngineError::NotFound(id.to_string()));
        }

        let mut staged = guard.clone();
        {
            let agent = staged.agent_states.get_mut(id).unwrap();
            match key {
                "input" => agent.inputs = as_map(&value),
                "output" => agent.outputs = as_map(&value),
                "error" => agent.error_message = value.as_str().map(|s| s.to_string()),
                other => {
                    warn!(agent = id, field = other, "setting unrecognized agent field");
                }
            }
        }

        self.persist_summary(&staged).await?;
        *guard = staged;

        let ct = CancellationToken::new();
        match key {
            "input" => {
                if let Err(e) = self.store.save(&ct, &input_mirror_key(id), value).await {
                    warn!(agent = id, error = %e, "failed to persist mirrored input record");
                }
            }
            "output" => {
                if let Err(e) = self.store.save(&ct, &output_mirror_key(id), value).await {
                    warn!(agent = id, error = %e, "failed to persist mirrored output record");
                }
            }
            _ => {}
        }
        self.persist_agent_document(&guard, id).await;
        Ok(())
    }

    pub async fn get(&self, id: &str, key: &str) -> Result<Value, EngineError> {
        let summary = self.summary.read().await;
        let agent = summary.agent_states.get(id).ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        match key {
            "input" => Ok(serde_json::to_value(&agent.inputs).unwrap_or(Value::Null)),
            "output" => Ok(serde_json::to_value(&agent.outputs).unwrap_or(Value::Null)),
            "error" => agent.error_message.clone().map(Value::String).ok_or_else(|| EngineError::NotFound(key.to_string())),
            _ => Err(EngineError::NotFound(key.to_string())),
        }
    }

    pub async fn get_all(&self, id: &str) -> Result<AgentState, EngineError> {
        let summary = self.summary.read().await;
        summary.agent_states.get(id).cloned().ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    /// Defensive deep copy of the aggregate summary.
    pub async fn summary(&self) -> StackExecutionSummary {
        self.summary.read().await.clone()
    }

    pub async fn close(&self) -> Result<(), EngineError> {
        {
            let mut guard = self.summary.write().await;
            let mut staged = guard.clone();
            if staged.end_time.is_none() {
                staged.end_time = Some(chrono::Utc::now());
            }
            self.persist_summary(&staged).await?;
            *guard = staged;
        }
        self.store.close().await
    }

    /// Persists the aggregate summary — the source of truth the engine
    /// rebuilds everything else from on rehydration. Failure here is fatal
    /// (`StateUnavailable`): callers must not swap a staged mutation into
    /// the lock unless this succeeds.
    async fn persist_summary(&self, summary: &StackExecutionSummary) -> Result<(), EngineError> {
        let ct = CancellationToken::new();
        let value = serde_json::to_value(summary)
            .map_err(|e| EngineError::StateUnavailable(format!("summary serialization failed: {e}")))?;
        self.store.save(&ct, SUMMARY_KEY, value).await.map_err(|e| {
            EngineError::StateUnavailable(format!("failed to persist summary: {e}"))
        })
    }

    /// Persists the per-agent `agent/<id>` document, a convenience lookup
    /// derived from the summary rather than a second source of truth.
    /// Failure here is logged and swallowed: the summary already landed,
    /// so the run continues per spec.md §7's "warnings, not fatal" policy.
    async fn persist_agent_document(&self, summary: &StackExecutionSummary, id: &str) {
        let Some(agent) = summary.agent_states.get(id) else { return };
        let value = match serde_json::to_value(agent) {
            Ok(value) => value,
            Err(e) => {
                warn!(agent = id, error = %e, "failed to serialize per-agent state document");
                return;
            }
        };
        let ct = CancellationToken::new();
        if let Err(e) = self.store.save(&ct, &agent_key(id), value).await {
            warn!(agent = id, error = %e, "failed to persist per-agent state document; summary remains authoritative");
        }
    }
}

fn as_map(value: &Value) -> std::collections::HashMap<String, Value> {
    match value {
        Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        other => std::iter::once(("value".to_string(), other.clone())).collect(),
    }
}

fn is_legal_transition(from: AgentStatus, to: AgentStatus) -> bool {
    use AgentStatus::*;
    if from == to {
        return true;
    }
    matches!(
        (from, to),
        (Pending, Running)
            | (Pending, Blocked)
            | (Running, Completed)
            | (Running, Failed)
    )
}

fn increment(summary: &mut StackExecutionSummary, status: AgentStatus) {
    match status {
        AgentStatus::Completed => summary.completed_count += 1,
        AgentStatus::Failed => summary.failed_count += 1,
        AgentStatus::Blocked => summary.blocked_count += 1,
        _ => {}
    }
}

fn decrement(summary: &mut StackExecutionSummary, status: AgentStatus) {
    match status {
        AgentStatus::Completed => summary.completed_count = summary.completed_count.saturating_sub(1),
        AgentStatus::Failed => summary.failed_count = summary.failed_count.saturating_sub(1),
        AgentStatus::Blocked => summary.blocked_count = summary.blocked_count.saturating_sub(1),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stack_stores::memory::InMemoryStore;
    use stack_stores::StoreConfig;

    async fn manager() -> StateManager {
        let store: Arc<dyn KeyedStore> = Arc::new(InMemoryStore::new(&StoreConfig {
            collection_name: "test".to_string(),
            ..Default::default()
        }));
        StateManager::open(store, "stack".to_string(), "exec-1".to_string()).await.unwrap()
    }

    #[tokio::test]
    async fn initialize_agents_is_idempotent() {
        let manager = manager().await;
        let agents = vec![("A".to_string(), HashSet::new())];
        manager.initialize_agents(&agents).await.unwrap();
        manager.update_status("A", AgentStatus::Running).await.unwrap();
        manager.initialize_agents(&agents).await.unwrap();
        let summary = manager.summary().await;
        assert_eq!(summary.agent_states["A"].status, AgentStatus::Running);
    }

    #[tokio::test]
    async fn counters_track_transitions_without_double_counting() {
        let manager = manager().await;
        manager.initialize_agents(&[("A".to_string(), HashSet::new())]).await.unwrap();
        manager.update_status("A", AgentStatus::Running).await.unwrap();
        manager.update_status("A", AgentStatus::Failed).await.unwrap();
        manager.update_status("A", AgentStatus::Failed).await.unwrap();
        let summary = manager.summary().await;
        assert_eq!(summary.failed_count, 1);
    }

    #[tokio::test]
    async fn set_input_mirrors_to_inputs_record() {
        let manager = manager().await;
        manager.initialize_agents(&[("A".to_string(), HashSet::new())]).await.unwrap();
        manager.set("A", "input", serde_json::json!({"text": "hi"})).await.unwrap();
        let ct = CancellationToken::new();
        let mirrored = manager.store.load(&ct, "inputs/A").await.unwrap();
        assert_eq!(mirrored, serde_json::json!({"text": "hi"}));
    }

    /// Wraps `InMemoryStore`, injecting one failure into the next `summary`
    /// save so tests can exercise the "persist failed, cache must not
    /// change" path without a real flaky backend.
    struct FlakySummaryStore {
        inner: InMemoryStore,
        fail_next_summary_save: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl KeyedStore for FlakySummaryStore {
        async fn save(&self, ct: &CancellationToken, key: &str, value: Value) -> Result<(), EngineError> {
            if key == SUMMARY_KEY
                && self.fail_next_summary_save.swap(false, std::sync::atomic::Ordering::SeqCst)
            {
                return Err(EngineError::StateUnavailable("injected failure".to_string()));
            }
            self.inner.save(ct, key, value).await
        }
        async fn load(&self, ct: &CancellationToken, key: &str) -> Result<Value, EngineError> {
            self.inner.load(ct, key).await
        }
        async fn delete(&self, ct: &CancellationToken, key: &str) -> Result<(), EngineError> {
            self.inner.delete(ct, key).await
        }
        async fn list(&self, ct: &CancellationToken, key_prefix: &str) -> Result<Vec<String>, EngineError> {
            self.inner.list(ct, key_prefix).await
        }
        async fn clear(&self, ct: &CancellationToken) -> Result<(), EngineError> {
            self.inner.clear(ct).await
        }
        async fn close(&self) -> Result<(), EngineError> {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn failed_summary_persist_leaves_cache_unchanged() {
        let inner = InMemoryStore::new(&StoreConfig { collection_name: "flaky".to_string(), ..Default::default() });
        let flaky = Arc::new(FlakySummaryStore { inner, fail_next_summary_save: std::sync::atomic::AtomicBool::new(false) });
        let store: Arc<dyn KeyedStore> = flaky.clone();
        let manager = StateManager::open(store, "stack".to_string(), "exec-flaky".to_string()).await.unwrap();
        manager.initialize_agents(&[("A".to_string(), HashSet::new())]).await.unwrap();

        flaky.fail_next_summary_save.store(true, std::sync::atomic::Ordering::SeqCst);
        let err = manager.update_status("A", AgentStatus::Running).await.unwrap_err();
        assert!(matches!(err, EngineError::StateUnavailable(_)));

        let summary = manager.summary().await;
        assert_eq!(summary.agent_states["A"].status, AgentStatus::Pending);
        assert_eq!(summary.running_count(), 0);

        // the flaky flag only injected one failure; the same transition
        // now succeeds and the cache reflects it.
        manager.update_status("A", AgentStatus::Running).await.unwrap();
        assert_eq!(manager.summary().await.agent_states["A"].status, AgentStatus::Running);
    }

    #[tokio::test]
    async fn rehydration_restores_counts() {
        let store: Arc<dyn KeyedStore> = Arc::new(InMemoryStore::new(&StoreConfig {
            collection_name: "shared".to_string(),
            ..Default::default()
        }));
        let manager = StateManager::open(store.clone(), "stack".to_string(), "exec-2".to_string()).await.unwrap();
        manager.initialize_agents(&[("A".to_string(), HashSet::new())]).await.unwrap();
        manager.update_status("A", AgentStatus::Running).await.unwrap();
        manager.update_status("A", AgentStatus::Completed).await.unwrap();

        let reopened = StateManager::open(store, "stack".to_string(), "exec-2".to_string()).await.unwrap();
        let summary = reopened.summary().await;
        assert_eq!(summary.completed_count, 1);
    }
}
