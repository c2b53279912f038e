//! Storage drivers.
//!
//! A driver stores rows as JSON payloads keyed by table and id. Model tables
//! are named after their model; the outbox lives in
//! [`PENDING_MUTATION_TABLE`](harbor_engine::PENDING_MUTATION_TABLE).

mod memory;
mod sqlite;

pub use memory::MemoryDriver;
pub use sqlite::SqliteDriver;

use async_trait::async_trait;
use harbor_engine::{Model, ModelSchema, QueryOptions, SchemaRegistry};

use crate::error::Result;

/// One write inside an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverWrite {
    Upsert {
        table: String,
        id: String,
        row: serde_json::Value,
    },
    Delete {
        table: String,
        id: String,
    },
}

impl DriverWrite {
    pub fn upsert_model(model: &Model) -> Self {
        DriverWrite::Upsert {
            table: model.model_name().to_string(),
            id: model.id().to_string(),
            row: model.to_json(),
        }
    }

    pub fn delete_model(model: &Model) -> Self {
        DriverWrite::Delete {
            table: model.model_name().to_string(),
            id: model.id().to_string(),
        }
    }
}

/// Backend contract used by the local storage adapter.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Create a table per model plus the system tables.
    async fn open(&self, registry: &SchemaRegistry) -> Result<()>;

    async fn upsert(&self, table: &str, id: &str, row: &serde_json::Value) -> Result<()>;

    async fn get(&self, table: &str, id: &str) -> Result<Option<serde_json::Value>>;

    /// Records of `schema` matching `options`, sorted and paginated.
    async fn select(&self, schema: &ModelSchema, options: &QueryOptions) -> Result<Vec<Model>>;

    /// Every row of a table.
    async fn scan(&self, table: &str) -> Result<Vec<serde_json::Value>>;

    /// Returns whether a row was removed.
    async fn delete(&self, table: &str, id: &str) -> Result<bool>;

    /// Apply every write or none of them.
    async fn apply_batch(&self, writes: Vec<DriverWrite>) -> Result<()>;

    /// Remove every row of every table.
    async fn clear(&self) -> Result<()>;

    /// Release storage. A later [`open`](Self::open) makes the driver
    /// usable again.
    async fn close(&self) -> Result<()>;
}

/// Decode a stored row. Fields the schema no longer declares are dropped
/// with a warning instead of failing the read.
pub(crate) fn decode_row(schema: &ModelSchema, row: &serde_json::Value) -> Result<Model> {
    let (model, skipped) = Model::from_stored_json(schema, row)?;
    if !skipped.is_empty() {
        tracing::warn!(
            model = %schema.name,
            id = %model.id(),
            fields = ?skipped,
            "Ignoring stored fields missing from the schema"
        );
    }
    Ok(model)
}
