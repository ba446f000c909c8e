use std::collections::HashMap;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::spec::AgentSpec;

pub type AgentOutputs = HashMap<String, Value>;

/// The capability the engine invokes per agent. Implementations range from
/// in-process (tests) to out-of-process (a CLI subprocess). Implementations
/// must respect `cancellation`, must not mutate `inputs`, and must return
/// JSON-serializable outputs.
#[async_trait::async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn execute(
        &self,
        cancellation: CancellationToken,
        spec: &AgentSpec,
        inputs: &HashMap<String, Value>,
    ) -> anyhow::Result<AgentOutputs>;

    /// Releases any transient resources held by the runtime. Safe to call
    /// even if `execute` was never invoked.
    async fn cleanup(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Applies the opaque runtime-options map supplied to `Execute`, before
    /// any agent is dispatched. Most runtimes have nothing to configure.
    fn configure(&self, _options: &HashMap<String, Value>) {}
}
