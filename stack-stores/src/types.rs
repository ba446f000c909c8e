use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use stack_types::EngineError;
use tokio_util::sync::CancellationToken;

// re-exported so backend modules don't need to name stack-types directly
// for these two types.
pub use stack_types::{VectorMatch, VectorRecord};

/// Selects a backend family. `Plugin` names a dynamically located backend
/// exposing `CreateMemoryStore`/`CreateVectorStore` with the required
/// signatures; resolution is left to the caller (out of scope for the core).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    InMemory,
    Sqlite,
    Http,
    Plugin(String),
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::InMemory => write!(f, "in_memory"),
            BackendKind::Sqlite => write!(f, "sqlite"),
            BackendKind::Http => write!(f, "http"),
            BackendKind::Plugin(name) => write!(f, "plugin:{name}"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub connection_string: Option<String>,
    pub collection_name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    /// Per-entry expiration in seconds; `0` or `None` means no expiry.
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
    #[serde(default)]
    pub vector_dimensions: Option<usize>,
    #[serde(default)]
    pub additional_options: HashMap<String, Value>,
}

impl StoreConfig {
    pub fn ttl(&self) -> Option<chrono::Duration> {
        match self.ttl_seconds {
            Some(0) | None => None,
            Some(secs) => Some(chrono::Duration::seconds(secs as i64)),
        }
    }

    pub fn vector_dimensions(&self) -> usize {
        self.vector_dimensions.unwrap_or(1536)
    }
}

/// Keyed persistence capability. Keys are opaque strings; values must
/// round-trip through JSON. A namespace, if configured at construction,
/// transparently prefixes every key with `"<namespace>:"`.
#[async_trait::async_trait]
pub trait KeyedStore: Send + Sync {
    async fn save(
        &self,
        cancellation: &CancellationToken,
        key: &str,
        value: Value,
    ) -> Result<(), EngineError>;

    async fn load(&self, cancellation: &CancellationToken, key: &str) -> Result<Value, EngineError>;

    async fn delete(&self, cancellation: &CancellationToken, key: &str) -> Result<(), EngineError>;

    /// Returns keys under `key_prefix`, namespace prefix stripped, in
    /// lexicographic order.
    async fn list(
        &self,
        cancellation: &CancellationToken,
        key_prefix: &str,
    ) -> Result<Vec<String>, EngineError>;

    /// Deletes only entries within this store's namespace (if any).
    async fn clear(&self, cancellation: &CancellationToken) -> Result<(), EngineError>;

    /// Idempotent; a closed store rejects further operations with `Closed`.
    async fn close(&self) -> Result<(), EngineError>;
}

/// Vector similarity capability, layered on top of keyed storage.
#[async_trait::async_trait]
pub trait VectorStore: KeyedStore {
    async fn store_vector(
        &self,
        cancellation: &CancellationToken,
        id: &str,
        vector: Vec<f32>,
        metadata: HashMap<String, Value>,
    ) -> Result<(), EngineError>;

    async fn find_similar(
        &self,
        cancellation: &CancellationToken,
        query_vector: &[f32],
        limit: usize,
    ) -> Result<Vec<VectorMatch>, EngineError>;

    async fn get_vector(
        &self,
        cancellation: &CancellationToken,
        id: &str,
    ) -> Result<VectorRecord, EngineError>;

    async fn delete_vector(&self, cancellation: &CancellationToken, id: &str) -> Result<(), EngineError>;
}
