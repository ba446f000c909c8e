use thiserror::Error;

/// Error taxonomy surfaced by the core. Construction errors (`InvalidSpec`,
/// `CycleDetected`) abort before any state is created; step-level errors
/// are recorded on the agent and influence downstream scheduling.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    #[error("cycle detected among agents: {0:?}")]
    CycleDetected(Vec<String>),

    #[error("engine is already running")]
    AlreadyRunning,

    #[error("dependency not ready: agent {0} read before its dependency completed")]
    DependencyNotReady(String),

    #[error("agent {agent_id} failed: {message}")]
    AgentFailed { agent_id: String, message: String },

    #[error("run finished with partial failure: {completed} completed, {failed} failed ({failed_ids:?}), {blocked} blocked ({blocked_ids:?})")]
    PartialFailure {
        completed: usize,
        failed: usize,
        failed_ids: Vec<String>,
        blocked: usize,
        blocked_ids: Vec<String>,
    },

    #[error("execution cancelled")]
    Cancelled,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("entry expired: {0}")]
    Expired(String),

    #[error("vector dimension mismatch: expected {expected}, got {got}")]
    InvalidDimension { expected: usize, got: usize },

    #[error("store is closed")]
    Closed,

    #[error("operation unsupported by this store: {0}")]
    Unsupported(String),

    #[error("state could not be persisted: {0}")]
    StateUnavailable(String),
}
