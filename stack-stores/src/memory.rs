use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use stack_types::{cosine_similarity, EngineError, MemoryEntry, VectorMatch, VectorRecord};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::types::{KeyedStore, StoreConfig, VectorStore};

/// Process-local keyed store backed by a `HashMap` behind an async `RwLock`.
/// Suitable for tests and single-process deployments; state does not
/// survive process restart.
pub struct InMemoryStore {
    namespace: Option<String>,
    ttl: Option<chrono::Duration>,
    vector_dimensions: usize,
    entries: Arc<RwLock<HashMap<String, MemoryEntry>>>,
    vectors: Arc<RwLock<HashMap<String, VectorRecord>>>,
    closed: AtomicBool,
}

impl InMemoryStore {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            namespace: config.namespace.clone(),
            ttl: config.ttl(),
            vector_dimensions: config.vector_dimensions(),
            entries: Arc::new(RwLock::new(HashMap::new())),
            vectors: Arc::new(RwLock::new(HashMap::new())),
            closed: AtomicBool::new(false),
        }
    }

    fn namespaced(&self, key: &str) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}:{key}"),
            None => key.to_string(),
        }
    }

    fn strip_namespace<'a>(&self, key: &'a str) -> &'a str {
        match &self.namespace {
            Some(ns) => key.strip_prefix(&format!("{ns}:")).unwrap_or(key),
            None => key,
        }
    }

    fn check_open(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl KeyedStore for InMemoryStore {
    async fn save(
        &self,
        _cancellation: &CancellationToken,
        key: &str,
        value: Value,
    ) -> Result<(), EngineError> {
        self.check_open()?;
        let full_key = self.namespaced(key);
        let mut entries = self.entries.write().await;
        match entries.get_mut(&full_key) {
            Some(existing) => {
                existing.value = value;
                existing.updated_at = chrono::Utc::now();
            }
            None => {
                entries.insert(full_key.clone(), MemoryEntry::new(full_key, value, HashMap::new()));
            }
        }
        Ok(())
    }

    async fn load(&self, _cancellation: &CancellationToken, key: &str) -> Result<Value, EngineError> {
        self.check_open()?;
        let full_key = self.namespaced(key);
        let mut entries = self.entries.write().await;
        match entries.get(&full_key) {
            Some(entry) if entry.is_expired(self.ttl) => {
                entries.remove(&full_key);
                Err(EngineError::Expired(key.to_string()))
            }
            Some(entry) => Ok(entry.value.clone()),
            None => Err(EngineError::NotFound(key.to_string())),
        }
    }

    async fn delete(&self, _cancellation: &CancellationToken, key: &str) -> Result<(), EngineError> {
        self.check_open()?;
        let full_key = self.namespaced(key);
        self.entries.write().await.remove(&full_key);
        Ok(())
    }

    async fn list(
        &self,
        _cancellation: &CancellationToken,
        key_prefix: &str,
    ) -> Result<Vec<String>, EngineError> {
        self.check_open()?;
        let full_prefix = self.namespaced(key_prefix);
        let entries = self.entries.read().await;
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|k| k.starts_with(&full_prefix))
            .map(|k| self.strip_namespace(k).to_string())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn clear(&self, _cancellation: &CancellationToken) -> Result<(), EngineError> {
        self.check_open()?;
        match &self.namespace {
            Some(ns) => {
                let prefix = format!("{ns}:");
                self.entries.write().await.retain(|k, _| !k.starts_with(&prefix));
                self.vectors.write().await.retain(|k, _| !k.starts_with(&prefix));
            }
            None => {
                self.entries.write().await.clear();
                self.vectors.write().await.clear();
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.closed.store(true, Ordering::SeqCst);
        debug!("in-memory store closed");
        Ok(())
    }
}

#[async_trait::async_trait]
impl VectorStore for InMemoryStore {
    async fn store_vector(
        &self,
        _cancellation: &CancellationToken,
        id: &str,
        vector: Vec<f32>,
        metadata: HashMap<String, Value>,
    ) -> Result<(), EngineError> {
        self.check_open()?;
        if vector.len() != self.vector_dimensions {
            return Err(EngineError::InvalidDimension { expected: self.vector_dimensions, got: vector.len() });
        }
        let full_key = self.namespaced(id);
        self.vectors.write().await.insert(
            full_key.clone(),
            VectorRecord { key: full_key, vector, metadata },
        );
        Ok(())
    }

    async fn find_similar(
        &self,
        _cancellation: &CancellationToken,
        query_vector: &[f32],
        limit: usize,
    ) -> Result<Vec<VectorMatch>, EngineError> {
        self.check_open()?;
        let vectors = self.vectors.read().await;
        let mut scored: Vec<VectorMatch> = vectors
            .values()
            .map(|record| VectorMatch {
                key: self.strip_namespace(&record.key).to_string(),
                score: cosine_similarity(query_vector, &record.vector),
                metadata: record.metadata.clone(),
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.key.cmp(&b.key))
        });
        scored.truncate(limit);
        Ok(scored)
    }

    async fn get_vector(
        &self,
        _cancellation: &CancellationToken,
        id: &str,
    ) -> Result<VectorRecord, EngineError> {
        self.check_open()?;
        let full_key = self.namespaced(id);
        self.vectors
            .read()
            .await
            .get(&full_key)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    async fn delete_vector(&self, _cancellation: &CancellationToken, id: &str) -> Result<(), EngineError> {
        self.check_open()?;
        let full_key = self.namespaced(id);
        self.vectors.write().await.remove(&full_key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StoreConfig {
        StoreConfig {
            collection_name: "test".to_string(),
            vector_dimensions: Some(2),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let store = InMemoryStore::new(&config());
        let ct = CancellationToken::new();
        store.save(&ct, "a", serde_json::json!({"x": 1})).await.unwrap();
        let loaded = store.load(&ct, "a").await.unwrap();
        assert_eq!(loaded, serde_json::json!({"x": 1}));
    }

    #[tokio::test]
    async fn load_missing_key_is_not_found() {
        let store = InMemoryStore::new(&config());
        let ct = CancellationToken::new();
        let err = store.load(&ct, "missing").await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn namespace_isolates_clear() {
        let mut cfg = config();
        cfg.namespace = Some("ns-a".to_string());
        let store = InMemoryStore::new(&cfg);
        let ct = CancellationToken::new();
        store.save(&ct, "k", serde_json::json!(1)).await.unwrap();
        store.clear(&ct).await.unwrap();
        assert!(matches!(store.load(&ct, "k").await, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn closed_store_rejects_operations() {
        let store = InMemoryStore::new(&config());
        let ct = CancellationToken::new();
        store.close().await.unwrap();
        assert!(matches!(store.save(&ct, "k", serde_json::json!(1)).await, Err(EngineError::Closed)));
    }

    #[tokio::test]
    async fn find_similar_ranks_by_cosine_score() {
        let store = InMemoryStore::new(&config());
        let ct = CancellationToken::new();
        store.store_vector(&ct, "close", vec![1.0, 0.0], HashMap::new()).await.unwrap();
        store.store_vector(&ct, "far", vec![0.0, 1.0], HashMap::new()).await.unwrap();
        let matches = store.find_similar(&ct, &[1.0, 0.0], 2).await.unwrap();
        assert_eq!(matches[0].key, "close");
    }

    #[tokio::test]
    async fn find_similar_breaks_score_ties_lexicographically() {
        let store = InMemoryStore::new(&config());
        let ct = CancellationToken::new();
        store.store_vector(&ct, "zebra", vec![1.0, 1.0], HashMap::new()).await.unwrap();
        store.store_vector(&ct, "apple", vec![1.0, 1.0], HashMap::new()).await.unwrap();
        store.store_vector(&ct, "mango", vec![1.0, 1.0], HashMap::new()).await.unwrap();
        let matches = store.find_similar(&ct, &[1.0, 1.0], 3).await.unwrap();
        let keys: Vec<&str> = matches.iter().map(|m| m.key.as_str()).collect();
        assert_eq!(keys, vec!["apple", "mango", "zebra"]);
    }
}
