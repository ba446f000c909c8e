mod factory;
pub mod memory;
mod types;

#[cfg(feature = "sqlite")]
pub mod sql;

#[cfg(feature = "http")]
pub mod vector_http;

pub use factory::MemoryStoreFactory;
pub use types::{BackendKind, KeyedStore, StoreConfig, VectorMatch, VectorRecord, VectorStore};
