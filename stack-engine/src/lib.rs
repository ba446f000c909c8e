mod dag;
mod engine;
mod runtime;
mod state_manager;

pub use dag::Dag;
pub use engine::{pretty_print_summary, AgentEvent, ExecuteOptions, StackEngine, StackEngineOptions};
pub use runtime::{CliRuntime, DirectRuntime};
pub use state_manager::StateManager;

pub use stack_stores::{BackendKind, KeyedStore, MemoryStoreFactory, StoreConfig, VectorStore};
pub use stack_types::{
    AgentOutputs, AgentRuntime, AgentSpec, AgentState, AgentStatus, EngineError, StackExecutionSummary, StackSpec,
};

/// Installs a `tracing` subscriber reading verbosity from `RUST_LOG`,
/// defaulting to `info` when unset. Safe to call more than once; only the
/// first call takes effect.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}
