use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use stack_types::{AgentOutputs, AgentRuntime, AgentSpec};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, serde::Serialize)]
struct CliRequest<'a> {
    spec: &'a AgentSpec,
    inputs: &'a HashMap<String, Value>,
}

/// Out-of-process runtime selected by the `"cli"` tag. Spawns `binary
/// <uses>`, writes a JSON request `{spec, inputs}` to stdin, and expects a
/// JSON outputs object on stdout. Cancellation kills the child process;
/// a non-zero exit status or malformed stdout is surfaced as a step
/// failure, never a panic.
pub struct CliRuntime {
    binary: String,
    timeout: Duration,
}

impl CliRuntime {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into(), timeout: Duration::from_secs(300) }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait::async_trait]
impl AgentRuntime for CliRuntime {
    async fn execute(
        &self,
        cancellation: CancellationToken,
        spec: &AgentSpec,
        inputs: &HashMap<String, Value>,
    ) -> anyhow::Result<AgentOutputs> {
        if cancellation.is_cancelled() {
            anyhow::bail!("cancelled");
        }

        let request = serde_json::to_vec(&CliRequest { spec, inputs })?;

        let mut child = Command::new(&self.binary)
            .arg(&spec.uses)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child.stdin.take().expect("stdin piped");
        stdin.write_all(&request).await?;
        drop(stdin);

        let output = tokio::select! {
            result = tokio::time::timeout(self.timeout, child.wait_with_output()) => {
                result.map_err(|_| anyhow::anyhow!("agent '{}' timed out after {:?}", spec.id, self.timeout))??
            }
            _ = cancellation.cancelled() => {
                anyhow::bail!("cancelled");
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(agent = spec.id, status = ?output.status, "cli runtime exited non-zero");
            anyhow::bail!("agent '{}' exited with {}: {}", spec.id, output.status, stderr);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        debug!(agent = spec.id, bytes = stdout.len(), "cli runtime produced output");
        let outputs: AgentOutputs = serde_json::from_str(stdout.trim())
            .map_err(|e| anyhow::anyhow!("agent '{}' produced non-JSON output: {e}", spec.id))?;
        Ok(outputs)
    }

    async fn cleanup(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
