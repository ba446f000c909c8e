use std::collections::HashMap;
use std::sync::Arc;

use stack_types::EngineError;
use tokio::sync::Mutex;
use tracing::info;

use crate::memory::InMemoryStore;
use crate::types::{BackendKind, KeyedStore, StoreConfig, VectorStore};

#[cfg(feature = "sqlite")]
use crate::sql::SqliteStore;

#[cfg(feature = "http")]
use crate::vector_http::HttpVectorStore;

type HandleKey = (BackendKind, String, Option<String>);

/// Constructs and caches keyed/vector store handles. A handle is reused
/// whenever `(backend, collection, namespace)` repeats, matching a single
/// connection pool or in-process map per collection rather than one per
/// call.
#[derive(Default)]
pub struct MemoryStoreFactory {
    keyed: Mutex<HashMap<HandleKey, Arc<dyn KeyedStore>>>,
    vector: Mutex<HashMap<HandleKey, Arc<dyn VectorStore>>>,
}

impl MemoryStoreFactory {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(backend: &BackendKind, config: &StoreConfig) -> HandleKey {
        (backend.clone(), config.collection_name.clone(), config.namespace.clone())
    }

    pub async fn create_memory_store(
        &self,
        backend: BackendKind,
        config: StoreConfig,
    ) -> Result<Arc<dyn KeyedStore>, EngineError> {
        let key = Self::key(&backend, &config);
        let mut handles = self.keyed.lock().await;
        if let Some(existing) = handles.get(&key) {
            return Ok(existing.clone());
        }
        let store = self.build_keyed(&backend, &config).await?;
        info!(backend = %backend, collection = %config.collection_name, "opened keyed store");
        handles.insert(key, store.clone());
        Ok(store)
    }

    pub async fn create_vector_store(
        &self,
        backend: BackendKind,
        config: StoreConfig,
    ) -> Result<Arc<dyn VectorStore>, EngineError> {
        let key = Self::key(&backend, &config);
        let mut handles = self.vector.lock().await;
        if let Some(existing) = handles.get(&key) {
            return Ok(existing.clone());
        }
        let store = self.build_vector(&backend, &config).await?;
        info!(backend = %backend, collection = %config.collection_name, "opened vector store");
        handles.insert(key, store.clone());
        Ok(store)
    }

    async fn build_keyed(
        &self,
        backend: &BackendKind,
        config: &StoreConfig,
    ) -> Result<Arc<dyn KeyedStore>, EngineError> {
        match backend {
            BackendKind::InMemory => Ok(Arc::new(InMemoryStore::new(config))),
            #[cfg(feature = "sqlite")]
            BackendKind::Sqlite => Ok(Arc::new(SqliteStore::new(config)?)),
            #[cfg(not(feature = "sqlite"))]
            BackendKind::Sqlite => Err(EngineError::Unsupported("sqlite backend not compiled in".to_string())),
            #[cfg(feature = "http")]
            BackendKind::Http => Ok(Arc::new(HttpVectorStore::new(config)?)),
            #[cfg(not(feature = "http"))]
            BackendKind::Http => Err(EngineError::Unsupported("http backend not compiled in".to_string())),
            BackendKind::Plugin(name) => {
                Err(EngineError::Unsupported(format!("plugin backend '{name}' has no registered factory")))
            }
        }
    }

    async fn build_vector(
        &self,
        backend: &BackendKind,
        config: &StoreConfig,
    ) -> Result<Arc<dyn VectorStore>, EngineError> {
        match backend {
            BackendKind::InMemory => Ok(Arc::new(InMemoryStore::new(config))),
            #[cfg(feature = "sqlite")]
            BackendKind::Sqlite => Ok(Arc::new(SqliteStore::new(config)?)),
            #[cfg(not(feature = "sqlite"))]
            BackendKind::Sqlite => Err(EngineError::Unsupported("sqlite backend not compiled in".to_string())),
            #[cfg(feature = "http")]
            BackendKind::Http => Ok(Arc::new(HttpVectorStore::new(config)?)),
            #[cfg(not(feature = "http"))]
            BackendKind::Http => Err(EngineError::Unsupported("http backend not compiled in".to_string())),
            BackendKind::Plugin(name) => {
                Err(EngineError::Unsupported(format!("plugin backend '{name}' has no registered factory")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn repeated_create_returns_same_handle() {
        let factory = MemoryStoreFactory::new();
        let config = StoreConfig { collection_name: "c".to_string(), ..Default::default() };
        let a = factory.create_memory_store(BackendKind::InMemory, config.clone()).await.unwrap();
        let b = factory.create_memory_store(BackendKind::InMemory, config).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
