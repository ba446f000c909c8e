use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use stack_types::{EngineError, VectorMatch, VectorRecord};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::types::{KeyedStore, StoreConfig, VectorStore};

/// Client for an external vector service reached over HTTP. Collections are
/// created lazily on first use rather than eagerly at construction, since
/// the service may not exist yet when the store is wired up. The service's
/// native similarity metric is a distance (0 = identical); this client
/// converts it to `1 - distance` so callers see the same cosine-style score
/// range as the other backends. No implicit retries: a failed request
/// surfaces as `StateUnavailable` and it is up to the caller to retry.
/// Dimension checking happens client-side against the configured
/// `vector_dimensions`, the same as the other backends, rather than relying
/// on the remote service to reject a malformed vector.
pub struct HttpVectorStore {
    client: reqwest::Client,
    base_url: String,
    collection: String,
    namespace: Option<String>,
    vector_dimensions: usize,
    collection_ready: OnceCell<()>,
    closed: AtomicBool,
}

#[derive(Serialize)]
struct UpsertRequest<'a> {
    id: &'a str,
    value: Option<&'a Value>,
    vector: Option<&'a [f32]>,
    metadata: &'a HashMap<String, Value>,
}

#[derive(Deserialize)]
struct FetchResponse {
    value: Option<Value>,
    vector: Option<Vec<f32>>,
    #[serde(default)]
    metadata: HashMap<String, Value>,
}

#[derive(Serialize)]
struct QueryRequest<'a> {
    vector: &'a [f32],
    limit: usize,
}

#[derive(Deserialize)]
struct QueryResponseItem {
    id: String,
    distance: f32,
    #[serde(default)]
    metadata: HashMap<String, Value>,
}

#[derive(Deserialize)]
struct ListResponse {
    keys: Vec<String>,
}

impl HttpVectorStore {
    pub fn new(config: &StoreConfig) -> Result<Self, EngineError> {
        let base_url = config
            .connection_string
            .clone()
            .ok_or_else(|| EngineError::InvalidSpec("http backend requires connection_string".to_string()))?;
        Ok(Self {
            client: reqwest::Client::new(),
            base_url,
            collection: config.collection_name.clone(),
            namespace: config.namespace.clone(),
            vector_dimensions: config.vector_dimensions(),
            collection_ready: OnceCell::new(),
            closed: AtomicBool::new(false),
        })
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

    fn collection_url(&self, suffix: &str) -> String {
        format!("{}/collections/{}{}", self.base_url.trim_end_matches('/'), self.collection, suffix)
    }

    async fn ensure_collection(&self) -> Result<(), EngineError> {
        self.collection_ready
            .get_or_try_init(|| async {
                let resp = self
                    .client
                    .put(format!("{}/collections/{}", self.base_url.trim_end_matches('/'), self.collection))
                    .send()
                    .await
                    .map_err(|e| EngineError::StateUnavailable(e.to_string()))?;
                if !resp.status().is_success() && resp.status().as_u16() != 409 {
                    return Err(EngineError::StateUnavailable(format!(
                        "failed to create collection: {}",
                        resp.status()
                    )));
                }
                debug!(collection = %self.collection, "ensured vector collection exists");
                Ok(())
            })
            .await
            .map(|_| ())
    }
}

#[async_trait::async_trait]
impl KeyedStore for HttpVectorStore {
    async fn save(&self, _cancellation: &CancellationToken, key: &str, value: Value) -> Result<(), EngineError> {
        self.check_open()?;
        self.ensure_collection().await?;
        let full_key = self.namespaced(key);
        let body = UpsertRequest { id: &full_key, value: Some(&value), vector: None, metadata: &HashMap::new() };
        let resp = self
            .client
            .put(self.collection_url(&format!("/items/{full_key}")))
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::StateUnavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(EngineError::StateUnavailable(format!("save failed: {}", resp.status())));
        }
        Ok(())
    }

    async fn load(&self, _cancellation: &CancellationToken, key: &str) -> Result<Value, EngineError> {
        self.check_open()?;
        let full_key = self.namespaced(key);
        let resp = self
            .client
            .get(self.collection_url(&format!("/items/{full_key}")))
            .send()
            .await
            .map_err(|e| EngineError::StateUnavailable(e.to_string()))?;
        if resp.status().as_u16() == 404 {
            return Err(EngineError::NotFound(key.to_string()));
        }
        if !resp.status().is_success() {
            return Err(EngineError::StateUnavailable(format!("load failed: {}", resp.status())));
        }
        let parsed: FetchResponse = resp.json().await.map_err(|e| EngineError::StateUnavailable(e.to_string()))?;
        parsed.value.ok_or_else(|| EngineError::NotFound(key.to_string()))
    }

    async fn delete(&self, _cancellation: &CancellationToken, key: &str) -> Result<(), EngineError> {
        self.check_open()?;
        let full_key = self.namespaced(key);
        let resp = self
            .client
            .delete(self.collection_url(&format!("/items/{full_key}")))
            .send()
            .await
            .map_err(|e| EngineError::StateUnavailable(e.to_string()))?;
        if !resp.status().is_success() && resp.status().as_u16() != 404 {
            return Err(EngineError::StateUnavailable(format!("delete failed: {}", resp.status())));
        }
        Ok(())
    }

    async fn list(&self, _cancellation: &CancellationToken, key_prefix: &str) -> Result<Vec<String>, EngineError> {
        self.check_open()?;
        let full_prefix = self.namespaced(key_prefix);
        let resp = self
            .client
            .get(self.collection_url("/items"))
            .query(&[("prefix", full_prefix.as_str())])
            .send()
            .await
            .map_err(|e| EngineError::StateUnavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(EngineError::StateUnavailable(format!("list failed: {}", resp.status())));
        }
        let parsed: ListResponse = resp.json().await.map_err(|e| EngineError::StateUnavailable(e.to_string()))?;
        Ok(parsed.keys.iter().map(|k| self.strip_namespace(k).to_string()).collect())
    }

    async fn clear(&self, _cancellation: &CancellationToken) -> Result<(), EngineError> {
        self.check_open()?;
        let resp = self
            .client
            .post(self.collection_url("/clear"))
            .json(&serde_json::json!({ "namespace": self.namespace }))
            .send()
            .await
            .map_err(|e| EngineError::StateUnavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(EngineError::StateUnavailable(format!("clear failed: {}", resp.status())));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait::async_trait]
impl VectorStore for HttpVectorStore {
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
        self.ensure_collection().await?;
        let full_key = self.namespaced(id);
        let body = UpsertRequest { id: &full_key, value: None, vector: Some(&vector), metadata: &metadata };
        let resp = self
            .client
            .put(self.collection_url(&format!("/items/{full_key}")))
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::StateUnavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(EngineError::StateUnavailable(format!("store_vector failed: {}", resp.status())));
        }
        Ok(())
    }

    async fn find_similar(
        &self,
        _cancellation: &CancellationToken,
        query_vector: &[f32],
        limit: usize,
    ) -> Result<Vec<VectorMatch>, EngineError> {
        self.check_open()?;
        self.ensure_collection().await?;
        let body = QueryRequest { vector: query_vector, limit };
        let resp = self
            .client
            .post(self.collection_url("/query"))
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::StateUnavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(EngineError::StateUnavailable(format!("find_similar failed: {}", resp.status())));
        }
        let items: Vec<QueryResponseItem> = resp.json().await.map_err(|e| EngineError::StateUnavailable(e.to_string()))?;
        Ok(items
            .into_iter()
            .map(|item| VectorMatch {
                key: self.strip_namespace(&item.id).to_string(),
                score: 1.0 - item.distance,
                metadata: item.metadata,
            })
            .collect())
    }

    async fn get_vector(&self, _cancellation: &CancellationToken, id: &str) -> Result<VectorRecord, EngineError> {
        self.check_open()?;
        let full_key = self.namespaced(id);
        let resp = self
            .client
            .get(self.collection_url(&format!("/items/{full_key}")))
            .send()
            .await
            .map_err(|e| EngineError::StateUnavailable(e.to_string()))?;
        if resp.status().as_u16() == 404 {
            return Err(EngineError::NotFound(id.to_string()));
        }
        if !resp.status().is_success() {
            return Err(EngineError::StateUnavailable(format!("get_vector failed: {}", resp.status())));
        }
        let parsed: FetchResponse = resp.json().await.map_err(|e| EngineError::StateUnavailable(e.to_string()))?;
        let vector = parsed.vector.ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        Ok(VectorRecord { key: id.to_string(), vector, metadata: parsed.metadata })
    }

    async fn delete_vector(&self, cancellation: &CancellationToken, id: &str) -> Result<(), EngineError> {
        self.delete(cancellation, id).await
    }
}
