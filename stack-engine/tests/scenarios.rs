use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use stack_engine::{
    AgentOutputs, AgentRuntime, AgentSpec, AgentStatus, EngineError, ExecuteOptions, StackEngine, StackEngineOptions,
    StackSpec,
};
use tokio_util::sync::CancellationToken;

fn agent(id: &str, depends_on: &[&str], input_from: &[&str], input_key: Option<&str>) -> AgentSpec {
    AgentSpec {
        id: id.to_string(),
        uses: "noop".to_string(),
        depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
        input_from: input_from.iter().map(|s| s.to_string()).collect(),
        input_key: input_key.map(|s| s.to_string()),
        params: HashMap::new(),
    }
}

fn spec(name: &str, agents: Vec<AgentSpec>) -> StackSpec {
    StackSpec { name: name.to_string(), description: String::new(), version: "1".to_string(), agents }
}

fn direct_runtime<F>(f: F) -> HashMap<String, Arc<dyn AgentRuntime>>
where
    F: Fn(&AgentSpec, &HashMap<String, Value>) -> anyhow::Result<AgentOutputs> + Send + Sync + 'static,
{
    let mut runtimes: HashMap<String, Arc<dyn AgentRuntime>> = HashMap::new();
    runtimes.insert("direct".to_string(), Arc::new(stack_engine::DirectRuntime::new(f)));
    runtimes
}

fn execute_options() -> ExecuteOptions {
    ExecuteOptions { runtime_tag: "direct".to_string(), ..Default::default() }
}

#[tokio::test]
async fn linear_pipeline_threads_text_through_each_agent() {
    let s = spec("linear", vec![
        agent("A", &[], &[], None),
        agent("B", &[], &["A"], None),
        agent("C", &[], &["B"], None),
    ]);

    let runtimes = direct_runtime(|agent_spec, inputs| {
        let source_text = agent_spec
            .input_from
            .iter()
            .next()
            .and_then(|source| inputs.get(source))
            .and_then(|v| v.get("text"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .or_else(|| inputs.get("text").and_then(|v| v.as_str()).map(|s| s.to_string()))
            .unwrap_or_default();
        let mut out = AgentOutputs::new();
        out.insert("text".to_string(), Value::String(format!("{source_text}+{}", agent_spec.id)));
        Ok(out)
    });

    let mut options = StackEngineOptions { runtimes, ..Default::default() };
    options.store_config.collection_name = "linear-pipeline".to_string();
    let engine = StackEngine::new(s, options).await.unwrap();

    let mut exec_options = execute_options();
    exec_options.initial_input.insert("text".to_string(), json!("hi"));
    let summary = engine.execute(exec_options).await.unwrap();

    assert_eq!(summary.completed_count, 3);
    assert_eq!(summary.agent_states["A"].outputs["text"], json!("hi+A"));
    assert_eq!(summary.agent_states["B"].outputs["text"], json!("hi+A+B"));
    assert_eq!(summary.agent_states["C"].outputs["text"], json!("hi+A+B+C"));
    for id in ["A", "B", "C"] {
        assert_eq!(summary.agent_states[id].status, AgentStatus::Completed);
    }
}

#[tokio::test]
async fn diamond_forwards_both_upstream_outputs_to_sink() {
    let s = spec("diamond", vec![
        agent("A", &[], &[], None),
        agent("B", &[], &["A"], None),
        agent("C", &[], &["A"], None),
        agent("D", &[], &["B", "C"], None),
    ]);

    let runtimes = direct_runtime(|agent_spec, _inputs| {
        let mut out = AgentOutputs::new();
        out.insert("val".to_string(), Value::String(agent_spec.id.clone()));
        Ok(out)
    });

    let mut options = StackEngineOptions { runtimes, ..Default::default() };
    options.store_config.collection_name = "diamond".to_string();
    let engine = StackEngine::new(s, options).await.unwrap();

    let summary = engine.execute(execute_options()).await.unwrap();

    assert_eq!(summary.completed_count, 4);
    let d_inputs = &summary.agent_states["D"].inputs;
    assert_eq!(d_inputs["B"], json!({"val": "B"}));
    assert_eq!(d_inputs["C"], json!({"val": "C"}));
}

#[tokio::test]
async fn cycle_is_rejected_before_any_state_is_created() {
    let mut a = agent("A", &[], &[], None);
    a.depends_on.insert("B".to_string());
    let b = agent("B", &[], &["A"], None);
    let s = spec("cycle", vec![a, b]);

    let runtimes = direct_runtime(|_spec, _inputs| Ok(AgentOutputs::new()));
    let mut options = StackEngineOptions { runtimes, ..Default::default() };
    options.store_config.collection_name = "cycle".to_string();

    let err = StackEngine::new(s, options).await.unwrap_err();
    assert!(matches!(err, EngineError::CycleDetected(_)));
}

#[tokio::test]
async fn mid_run_failure_blocks_downstream_but_not_independent_branches() {
    let s = spec("mid-run-failure", vec![
        agent("A", &[], &[], None),
        agent("B", &[], &["A"], None),
        agent("C", &[], &["B"], None),
        agent("D", &[], &["A"], None),
    ]);

    let runtimes = direct_runtime(|agent_spec, _inputs| {
        if agent_spec.id == "B" {
            anyhow::bail!("boom");
        }
        Ok(AgentOutputs::new())
    });

    let mut options = StackEngineOptions { runtimes, ..Default::default() };
    options.store_config.collection_name = "mid-run-failure".to_string();
    let engine = StackEngine::new(s, options).await.unwrap();

    let err = engine.execute(execute_options()).await.unwrap_err();
    match err {
        EngineError::PartialFailure { completed, failed, blocked, .. } => {
            assert_eq!(completed, 2);
            assert_eq!(failed, 1);
            assert_eq!(blocked, 1);
        }
        other => panic!("expected PartialFailure, got {other:?}"),
    }

    let summary = engine.snapshot().await;
    assert_eq!(summary.agent_states["A"].status, AgentStatus::Completed);
    assert_eq!(summary.agent_states["B"].status, AgentStatus::Failed);
    assert_eq!(summary.agent_states["C"].status, AgentStatus::Blocked);
    assert_eq!(summary.agent_states["D"].status, AgentStatus::Completed);
}

struct SlowRuntime {
    delay: Duration,
}

#[async_trait::async_trait]
impl AgentRuntime for SlowRuntime {
    async fn execute(
        &self,
        cancellation: CancellationToken,
        agent_spec: &AgentSpec,
        _inputs: &HashMap<String, Value>,
    ) -> anyhow::Result<AgentOutputs> {
        tokio::select! {
            _ = tokio::time::sleep(self.delay) => {
                let mut out = AgentOutputs::new();
                out.insert("id".to_string(), Value::String(agent_spec.id.clone()));
                Ok(out)
            }
            _ = cancellation.cancelled() => {
                anyhow::bail!("cancelled")
            }
        }
    }
}

#[tokio::test]
async fn stop_during_first_agent_cancels_remaining_as_pending() {
    let s = spec("cancellation", vec![
        agent("A", &[], &[], None),
        agent("B", &[], &["A"], None),
        agent("C", &[], &["B"], None),
        agent("D", &[], &["A"], None),
    ]);

    let mut runtimes: HashMap<String, Arc<dyn AgentRuntime>> = HashMap::new();
    runtimes.insert("direct".to_string(), Arc::new(SlowRuntime { delay: Duration::from_millis(200) }));

    let mut options = StackEngineOptions { runtimes, ..Default::default() };
    options.store_config.collection_name = "cancellation".to_string();
    let engine = Arc::new(StackEngine::new(s, options).await.unwrap());

    let stopper = engine.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        stopper.stop();
    });

    let err = engine.execute(execute_options()).await.unwrap_err();
    assert!(matches!(err, EngineError::Cancelled));

    let summary = engine.snapshot().await;
    assert_eq!(summary.agent_states["A"].status, AgentStatus::Failed);
    assert_eq!(summary.agent_states["A"].error_message.as_deref(), Some("cancelled"));
    for id in ["B", "C", "D"] {
        assert_eq!(summary.agent_states[id].status, AgentStatus::Pending);
    }
}

#[tokio::test]
async fn input_key_forwards_single_field_not_whole_map() {
    let s = spec("input-key", vec![agent("A", &[], &[], None), agent("B", &[], &["A"], Some("result"))]);

    let runtimes = direct_runtime(|agent_spec, _inputs| {
        let mut out = AgentOutputs::new();
        if agent_spec.id == "A" {
            out.insert("result".to_string(), json!(42));
            out.insert("debug".to_string(), json!("x"));
        }
        Ok(out)
    });

    let mut options = StackEngineOptions { runtimes, ..Default::default() };
    options.store_config.collection_name = "input-key".to_string();
    let engine = StackEngine::new(s, options).await.unwrap();

    let summary = engine.execute(execute_options()).await.unwrap();
    let b_inputs = &summary.agent_states["B"].inputs;
    assert_eq!(b_inputs["A"], json!(42));
    assert!(!b_inputs.contains_key("debug"));
}

#[tokio::test]
async fn concurrent_execute_is_rejected() {
    let s = spec("already-running", vec![agent("A", &[], &[], None)]);
    let mut runtimes: HashMap<String, Arc<dyn AgentRuntime>> = HashMap::new();
    runtimes.insert("direct".to_string(), Arc::new(SlowRuntime { delay: Duration::from_millis(100) }));
    let mut options = StackEngineOptions { runtimes, ..Default::default() };
    options.store_config.collection_name = "already-running".to_string();
    let engine = Arc::new(StackEngine::new(s, options).await.unwrap());

    let first = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.execute(execute_options()).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = engine.execute(execute_options()).await;

    assert!(matches!(second, Err(EngineError::AlreadyRunning)));
    first.await.unwrap().unwrap();
}
