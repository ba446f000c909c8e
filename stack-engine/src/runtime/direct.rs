use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use stack_types::{AgentOutputs, AgentRuntime, AgentSpec};
use tokio_util::sync::CancellationToken;

type Handler = dyn Fn(&AgentSpec, &HashMap<String, Value>) -> anyhow::Result<AgentOutputs> + Send + Sync;

/// In-process runtime selected by the `"direct"` tag. Dispatches every
/// agent to a single closure supplied at construction; intended for tests
/// and for embedding the engine directly inside a host process that
/// already has the agent logic in-process.
#[derive(Clone)]
pub struct DirectRuntime {
    handler: Arc<Handler>,
}

impl DirectRuntime {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&AgentSpec, &HashMap<String, Value>) -> anyhow::Result<AgentOutputs> + Send + Sync + 'static,
    {
        Self { handler: Arc::new(handler) }
    }

    /// Convenience constructor for agents whose output is just their spec's
    /// `id` echoed back under `"id"`, the shape the diamond scenario uses.
    pub fn echo_id() -> Self {
        Self::new(|spec, _inputs| {
            let mut out = AgentOutputs::new();
            out.insert("id".to_string(), Value::String(spec.id.clone()));
            Ok(out)
        })
    }
}

#[async_trait::async_trait]
impl AgentRuntime for DirectRuntime {
    async fn execute(
        &self,
        cancellation: CancellationToken,
        spec: &AgentSpec,
        inputs: &HashMap<String, Value>,
    ) -> anyhow::Result<AgentOutputs> {
        if cancellation.is_cancelled() {
            anyhow::bail!("cancelled");
        }
        (self.handler)(spec, inputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_id_returns_spec_id() {
        let runtime = DirectRuntime::echo_id();
        let spec = AgentSpec {
            id: "A".to_string(),
            uses: "noop".to_string(),
            depends_on: Default::default(),
            input_from: Default::default(),
            input_key: None,
            params: Default::default(),
        };
        let out = runtime.execute(CancellationToken::new(), &spec, &HashMap::new()).await.unwrap();
        assert_eq!(out.get("id"), Some(&Value::String("A".to_string())));
    }
}
