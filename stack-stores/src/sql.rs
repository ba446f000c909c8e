use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::sql_types::{BigInt, Double, Text};
use serde_json::Value;
use stack_types::{EngineError, VectorMatch, VectorRecord};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::types::{KeyedStore, StoreConfig, VectorStore};

type SqlitePool = Pool<ConnectionManager<SqliteConnection>>;

/// Durable relational backend on SQLite. Diesel's compile-time schema
/// macros assume a fixed, known-at-build-time table set; this backend needs
/// one table per collection chosen at runtime, so DDL/DML goes through
/// `sql_query` instead of the `table!`/`Queryable` machinery used elsewhere
/// in this workspace. Connections are pooled with r2d2 and every query runs
/// inside `spawn_blocking` since diesel's `SqliteConnection` is synchronous.
///
/// The vector table carries one `REAL` column per dimension (`dim_0`,
/// `dim_1`, ...) plus a `vector_json` column. Vectors are normalized to
/// unit length on insert; `find_similar` normalizes the query vector the
/// same way and asks SQLite to compute the dot product across the
/// per-dimension columns directly, which for unit vectors equals cosine
/// similarity. `vector_json` exists purely so `get_vector` can hand back
/// the exact stored floats without reading back `n` dynamically-named
/// columns through a statically-typed `QueryableByName` struct — it is
/// always kept in lockstep with the per-dimension columns, never a second
/// source of truth. A consequence of normalizing on insert: `get_vector`
/// returns the normalized vector, not the caller's original one, unlike
/// the in-memory and HTTP backends.
pub struct SqliteStore {
    pool: SqlitePool,
    table: String,
    vector_table: String,
    dim_columns: Vec<String>,
    namespace: Option<String>,
    ttl: Option<chrono::Duration>,
    vector_dimensions: usize,
    closed: AtomicBool,
}

#[derive(QueryableByName)]
struct EntryRow {
    #[diesel(sql_type = Text)]
    key: String,
    #[diesel(sql_type = Text)]
    value: String,
    #[diesel(sql_type = Text)]
    #[allow(dead_code)]
    metadata: String,
    #[diesel(sql_type = Text)]
    updated_at: String,
}

#[derive(QueryableByName)]
struct VectorJsonRow {
    #[diesel(sql_type = Text)]
    key: String,
    #[diesel(sql_type = Text)]
    vector_json: String,
    #[diesel(sql_type = Text)]
    metadata: String,
}

#[derive(QueryableByName)]
struct ScoredRow {
    #[diesel(sql_type = Text)]
    key: String,
    #[diesel(sql_type = Text)]
    metadata: String,
    #[diesel(sql_type = Double)]
    score: f64,
}

#[derive(QueryableByName)]
struct KeyRow {
    #[diesel(sql_type = Text)]
    key: String,
}

fn sanitize_identifier(name: &str) -> String {
    let cleaned: String = name.chars().filter(|c| c.is_alphanumeric() || *c == '_').collect();
    if cleaned.is_empty() {
        "default".to_string()
    } else {
        cleaned
    }
}

fn dim_column(index: usize) -> String {
    format!("dim_{index}")
}

/// Scales `vector` to unit length. A zero-magnitude vector is returned
/// unchanged (still zero) rather than dividing by zero, so its dot product
/// against anything is 0 — the same "zero magnitude => similarity 0, never
/// NaN" rule `cosine_similarity` applies for the in-memory backend.
fn normalize(vector: &[f32]) -> Vec<f32> {
    let magnitude: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if magnitude == 0.0 {
        vector.to_vec()
    } else {
        vector.iter().map(|x| x / magnitude).collect()
    }
}

/// Renders a float as a SQL numeric literal. Dynamic per-dimension values
/// can't go through diesel's statically-typed `.bind()` chain (the number
/// of binds varies with `vectorDimensions`), so they're interpolated as
/// literals instead; non-finite inputs fold to `0` so a stray `NaN`/`inf`
/// can never reach the generated SQL text.
fn sql_float_literal(value: f32) -> String {
    if value.is_finite() {
        format!("{}", value as f64)
    } else {
        "0".to_string()
    }
}

impl SqliteStore {
    pub fn new(config: &StoreConfig) -> Result<Self, EngineError> {
        let database_url = config
            .connection_string
            .clone()
            .unwrap_or_else(|| "stack_engine.sqlite".to_string());
        let manager = ConnectionManager::<SqliteConnection>::new(database_url);
        let pool = Pool::builder()
            .build(manager)
            .map_err(|e| EngineError::StateUnavailable(e.to_string()))?;

        let table = format!("kv_{}", sanitize_identifier(&config.collection_name));
        let vector_table = format!("vec_{}", sanitize_identifier(&config.collection_name));
        let vector_dimensions = config.vector_dimensions();
        let dim_columns: Vec<String> = (0..vector_dimensions).map(dim_column).collect();

        let mut conn = pool.get().map_err(|e| EngineError::StateUnavailable(e.to_string()))?;
        diesel::sql_query(format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{{}}',
                updated_at TEXT NOT NULL
            )"
        ))
        .execute(&mut conn)
        .map_err(|e| EngineError::StateUnavailable(e.to_string()))?;

        // Spec-required indexes beyond the implicit primary-key index on
        // `key`: an explicit named index on `key` (documents the
        // requirement even though SQLite already enforces it via the
        // primary key) and one on `updated_at` for TTL sweeps.
        diesel::sql_query(format!("CREATE INDEX IF NOT EXISTS {table}_key_idx ON {table}(key)"))
            .execute(&mut conn)
            .map_err(|e| EngineError::StateUnavailable(e.to_string()))?;
        diesel::sql_query(format!("CREATE INDEX IF NOT EXISTS {table}_updated_at_idx ON {table}(updated_at)"))
            .execute(&mut conn)
            .map_err(|e| EngineError::StateUnavailable(e.to_string()))?;

        let dim_defs = dim_columns
            .iter()
            .map(|c| format!("{c} REAL NOT NULL DEFAULT 0"))
            .collect::<Vec<_>>()
            .join(",\n                ");
        let dim_defs_clause = if dim_defs.is_empty() { String::new() } else { format!("{dim_defs},\n                ") };
        diesel::sql_query(format!(
            "CREATE TABLE IF NOT EXISTS {vector_table} (
                key TEXT PRIMARY KEY,
                {dim_defs_clause}vector_json TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{{}}'
            )"
        ))
        .execute(&mut conn)
        .map_err(|e| EngineError::StateUnavailable(e.to_string()))?;

        Ok(Self {
            pool,
            table,
            vector_table,
            dim_columns,
            namespace: config.namespace.clone(),
            ttl: config.ttl(),
            vector_dimensions,
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

    fn connection(&self) -> Result<diesel::r2d2::PooledConnection<ConnectionManager<SqliteConnection>>, EngineError> {
        self.pool.get().map_err(|e| EngineError::StateUnavailable(e.to_string()))
    }
}

#[async_trait::async_trait]
impl KeyedStore for SqliteStore {
    async fn save(&self, _cancellation: &CancellationToken, key: &str, value: Value) -> Result<(), EngineError> {
        self.check_open()?;
        let full_key = self.namespaced(key);
        let table = self.table.clone();
        let value_json = serde_json::to_string(&value).map_err(|e| EngineError::StateUnavailable(e.to_string()))?;
        let now = chrono::Utc::now().to_rfc3339();
        let mut conn = self.connection()?;
        tokio::task::spawn_blocking(move || {
            diesel::sql_query(format!(
                "INSERT INTO {table} (key, value, metadata, updated_at) VALUES (?, ?, '{{}}', ?)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at"
            ))
            .bind::<Text, _>(full_key)
            .bind::<Text, _>(value_json)
            .bind::<Text, _>(now)
            .execute(&mut conn)
        })
        .await
        .map_err(|e| EngineError::StateUnavailable(e.to_string()))?
        .map_err(|e| EngineError::StateUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn load(&self, _cancellation: &CancellationToken, key: &str) -> Result<Value, EngineError> {
        self.check_open()?;
        let full_key = self.namespaced(key);
        let table = self.table.clone();
        let mut conn = self.connection()?;
        let rows: Vec<EntryRow> = tokio::task::spawn_blocking(move || {
            diesel::sql_query(format!("SELECT key, value, metadata, updated_at FROM {table} WHERE key = ?"))
                .bind::<Text, _>(full_key)
                .load(&mut conn)
        })
        .await
        .map_err(|e| EngineError::StateUnavailable(e.to_string()))?
        .map_err(|e| EngineError::StateUnavailable(e.to_string()))?;

        let row = rows.into_iter().next().ok_or_else(|| EngineError::NotFound(key.to_string()))?;
        if let Some(ttl) = self.ttl {
            let updated_at = chrono::DateTime::parse_from_rfc3339(&row.updated_at)
                .map(|dt| dt.with_timezone(&chrono::Utc))
                .map_err(|e| EngineError::StateUnavailable(e.to_string()))?;
            if chrono::Utc::now() - updated_at > ttl {
                self.delete(_cancellation, key).await?;
                return Err(EngineError::Expired(key.to_string()));
            }
        }
        serde_json::from_str(&row.value).map_err(|e| EngineError::StateUnavailable(e.to_string()))
    }

    async fn delete(&self, _cancellation: &CancellationToken, key: &str) -> Result<(), EngineError> {
        self.check_open()?;
        let full_key = self.namespaced(key);
        let table = self.table.clone();
        let mut conn = self.connection()?;
        tokio::task::spawn_blocking(move || {
            diesel::sql_query(format!("DELETE FROM {table} WHERE key = ?"))
                .bind::<Text, _>(full_key)
                .execute(&mut conn)
        })
        .await
        .map_err(|e| EngineError::StateUnavailable(e.to_string()))?
        .map_err(|e| EngineError::StateUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn list(&self, _cancellation: &CancellationToken, key_prefix: &str) -> Result<Vec<String>, EngineError> {
        self.check_open()?;
        let full_prefix = self.namespaced(key_prefix);
        let table = self.table.clone();
        let mut conn = self.connection()?;
        let like_pattern = format!("{full_prefix}%");
        let rows: Vec<KeyRow> = tokio::task::spawn_blocking(move || {
            diesel::sql_query(format!("SELECT key FROM {table} WHERE key LIKE ? ORDER BY key"))
                .bind::<Text, _>(like_pattern)
                .load(&mut conn)
        })
        .await
        .map_err(|e| EngineError::StateUnavailable(e.to_string()))?
        .map_err(|e| EngineError::StateUnavailable(e.to_string()))?;
        Ok(rows.into_iter().map(|r| self.strip_namespace(&r.key).to_string()).collect())
    }

    async fn clear(&self, _cancellation: &CancellationToken) -> Result<(), EngineError> {
        self.check_open()?;
        let table = self.table.clone();
        let vector_table = self.vector_table.clone();
        let namespace = self.namespace.clone();
        let mut conn = self.connection()?;
        tokio::task::spawn_blocking(move || -> QueryResult<()> {
            match namespace {
                Some(ns) => {
                    let like_pattern = format!("{ns}:%");
                    diesel::sql_query(format!("DELETE FROM {table} WHERE key LIKE ?"))
                        .bind::<Text, _>(like_pattern.clone())
                        .execute(&mut conn)?;
                    diesel::sql_query(format!("DELETE FROM {vector_table} WHERE key LIKE ?"))
                        .bind::<Text, _>(like_pattern)
                        .execute(&mut conn)?;
                }
                None => {
                    diesel::sql_query(format!("DELETE FROM {table}")).execute(&mut conn)?;
                    diesel::sql_query(format!("DELETE FROM {vector_table}")).execute(&mut conn)?;
                }
            }
            Ok(())
        })
        .await
        .map_err(|e| EngineError::StateUnavailable(e.to_string()))?
        .map_err(|e| EngineError::StateUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.closed.store(true, Ordering::SeqCst);
        debug!(table = %self.table, "sqlite store closed");
        Ok(())
    }
}

#[async_trait::async_trait]
impl VectorStore for SqliteStore {
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
        let normalized = normalize(&vector);
        let full_key = self.namespaced(id);
        let vector_table = self.vector_table.clone();
        let vector_json =
            serde_json::to_string(&normalized).map_err(|e| EngineError::StateUnavailable(e.to_string()))?;
        let metadata_json = serde_json::to_string(&metadata).map_err(|e| EngineError::StateUnavailable(e.to_string()))?;

        let dim_cols = self.dim_columns.join(", ");
        let dim_values = normalized.iter().map(|v| sql_float_literal(*v)).collect::<Vec<_>>().join(", ");
        let dim_set = self
            .dim_columns
            .iter()
            .map(|c| format!("{c} = excluded.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let cols_clause = if dim_cols.is_empty() { String::new() } else { format!("{dim_cols}, ") };
        let values_clause = if dim_values.is_empty() { String::new() } else { format!("{dim_values}, ") };
        let set_clause = if dim_set.is_empty() { String::new() } else { format!("{dim_set}, ") };

        let mut conn = self.connection()?;
        tokio::task::spawn_blocking(move || {
            diesel::sql_query(format!(
                "INSERT INTO {vector_table} (key, {cols_clause}vector_json, metadata) VALUES (?, {values_clause}?, ?)
                 ON CONFLICT(key) DO UPDATE SET {set_clause}vector_json = excluded.vector_json, metadata = excluded.metadata"
            ))
            .bind::<Text, _>(full_key)
            .bind::<Text, _>(vector_json)
            .bind::<Text, _>(metadata_json)
            .execute(&mut conn)
        })
        .await
        .map_err(|e| EngineError::StateUnavailable(e.to_string()))?
        .map_err(|e| EngineError::StateUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn find_similar(
        &self,
        _cancellation: &CancellationToken,
        query_vector: &[f32],
        limit: usize,
    ) -> Result<Vec<VectorMatch>, EngineError> {
        self.check_open()?;
        let normalized_query = normalize(query_vector);
        let dot_expr = if self.dim_columns.is_empty() {
            "0".to_string()
        } else {
            self.dim_columns
                .iter()
                .zip(normalized_query.iter())
                .map(|(column, component)| format!("({column} * {})", sql_float_literal(*component)))
                .collect::<Vec<_>>()
                .join(" + ")
        };
        let vector_table = self.vector_table.clone();
        let mut conn = self.connection()?;
        let limit = limit as i64;
        let rows: Vec<ScoredRow> = tokio::task::spawn_blocking(move || {
            diesel::sql_query(format!(
                "SELECT key, metadata, ({dot_expr}) AS score FROM {vector_table} ORDER BY score DESC, key ASC LIMIT ?"
            ))
            .bind::<BigInt, _>(limit)
            .load(&mut conn)
        })
        .await
        .map_err(|e| EngineError::StateUnavailable(e.to_string()))?
        .map_err(|e| EngineError::StateUnavailable(e.to_string()))?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let metadata: HashMap<String, Value> = serde_json::from_str(&row.metadata).ok()?;
                Some(VectorMatch {
                    key: self.strip_namespace(&row.key).to_string(),
                    score: row.score as f32,
                    metadata,
                })
            })
            .collect())
    }

    async fn get_vector(&self, _cancellation: &CancellationToken, id: &str) -> Result<VectorRecord, EngineError> {
        self.check_open()?;
        let full_key = self.namespaced(id);
        let vector_table = self.vector_table.clone();
        let mut conn = self.connection()?;
        let rows: Vec<VectorJsonRow> = tokio::task::spawn_blocking(move || {
            diesel::sql_query(format!("SELECT key, vector_json, metadata FROM {vector_table} WHERE key = ?"))
                .bind::<Text, _>(full_key)
                .load(&mut conn)
        })
        .await
        .map_err(|e| EngineError::StateUnavailable(e.to_string()))?
        .map_err(|e| EngineError::StateUnavailable(e.to_string()))?;

        let row = rows.into_iter().next().ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        Ok(VectorRecord {
            key: self.strip_namespace(&row.key).to_string(),
            vector: serde_json::from_str(&row.vector_json).map_err(|e| EngineError::StateUnavailable(e.to_string()))?,
            metadata: serde_json::from_str(&row.metadata).map_err(|e| EngineError::StateUnavailable(e.to_string()))?,
        })
    }

    async fn delete_vector(&self, _cancellation: &CancellationToken, id: &str) -> Result<(), EngineError> {
        self.check_open()?;
        let full_key = self.namespaced(id);
        let vector_table = self.vector_table.clone();
        let mut conn = self.connection()?;
        tokio::task::spawn_blocking(move || {
            diesel::sql_query(format!("DELETE FROM {vector_table} WHERE key = ?"))
                .bind::<Text, _>(full_key)
                .execute(&mut conn)
        })
        .await
        .map_err(|e| EngineError::StateUnavailable(e.to_string()))?
        .map_err(|e| EngineError::StateUnavailable(e.to_string()))?;
        Ok(())
    }
}
