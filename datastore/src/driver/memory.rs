//! In-memory storage driver.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use harbor_engine::snapshot::TableRows;
use harbor_engine::{
    Model, ModelSchema, QueryOptions, SchemaRegistry, SchemaVersion, StoreSnapshot,
    PENDING_MUTATION_TABLE,
};
use tokio::sync::RwLock;

use super::{decode_row, DriverWrite, StorageDriver};
use crate::error::{DataStoreError, Result};

#[derive(Debug, Default)]
struct Tables {
    schema_version: Option<SchemaVersion>,
    rows: BTreeMap<String, TableRows>,
}

/// Rows kept in ordered maps behind a single lock.
///
/// Contents can be exported to and restored from a [`StoreSnapshot`], which
/// is how tests simulate a process restart.
#[derive(Debug, Default)]
pub struct MemoryDriver {
    tables: RwLock<Tables>,
    failing_writes: AtomicU32,
    closed: AtomicBool,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from previously exported contents. They are checked against
    /// the registry on [`open`](StorageDriver::open).
    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        Self {
            tables: RwLock::new(Tables {
                schema_version: Some(snapshot.schema_version),
                rows: snapshot.tables,
            }),
            ..Self::default()
        }
    }

    /// Copy of every row.
    pub async fn snapshot(&self) -> StoreSnapshot {
        let tables = self.tables.read().await;
        let mut snapshot = StoreSnapshot::new(tables.schema_version.unwrap_or_default());
        for (table, rows) in &tables.rows {
            for (id, row) in rows {
                snapshot.insert_row(table.clone(), id.clone(), row.clone());
            }
        }
        snapshot
    }

    /// Make the next `count` writes (including `clear`) fail with a storage
    /// error.
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DataStoreError::StorageIo("memory driver is closed".into()));
        }
        Ok(())
    }

    fn before_write(&self) -> Result<()> {
        self.ensure_open()?;
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(DataStoreError::StorageIo("injected write failure".into()));
        }
        Ok(())
    }
}

fn decode_all(schema: &ModelSchema, rows: Option<&TableRows>) -> Result<Vec<Model>> {
    rows.into_iter()
        .flat_map(|rows| rows.values())
        .map(|row| decode_row(schema, row))
        .collect()
}

#[async_trait]
impl StorageDriver for MemoryDriver {
    async fn open(&self, registry: &SchemaRegistry) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.schema_version.is_some() {
            let restored = StoreSnapshot {
                schema_version: tables.schema_version.unwrap_or_default(),
                tables: tables.rows.clone(),
                ..StoreSnapshot::default()
            };
            restored.validate(registry)?;
        }
        tables.schema_version = Some(registry.version);
        for schema in registry.schemas() {
            tables.rows.entry(schema.name.clone()).or_default();
        }
        tables.rows.entry(PENDING_MUTATION_TABLE.to_string()).or_default();
        self.closed.store(false, Ordering::SeqCst);
        tracing::debug!(tables = tables.rows.len(), "Memory driver opened");
        Ok(())
    }

    async fn upsert(&self, table: &str, id: &str, row: &serde_json::Value) -> Result<()> {
        self.before_write()?;
        let mut tables = self.tables.write().await;
        tables
            .rows
            .entry(table.to_string())
            .or_default()
            .insert(id.to_string(), row.clone());
        Ok(())
    }

    async fn get(&self, table: &str, id: &str) -> Result<Option<serde_json::Value>> {
        self.ensure_open()?;
        let tables = self.tables.read().await;
        Ok(tables.rows.get(table).and_then(|rows| rows.get(id)).cloned())
    }

    async fn select(&self, schema: &ModelSchema, options: &QueryOptions) -> Result<Vec<Model>> {
        self.ensure_open()?;
        let models = {
            let tables = self.tables.read().await;
            decode_all(schema, tables.rows.get(&schema.name))?
        };
        Ok(options.apply(schema, models)?)
    }

    async fn scan(&self, table: &str) -> Result<Vec<serde_json::Value>> {
        self.ensure_open()?;
        let tables = self.tables.read().await;
        Ok(tables
            .rows
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete(&self, table: &str, id: &str) -> Result<bool> {
        self.before_write()?;
        let mut tables = self.tables.write().await;
        Ok(tables
            .rows
            .get_mut(table)
            .is_some_and(|rows| rows.remove(id).is_some()))
    }

    async fn apply_batch(&self, writes: Vec<DriverWrite>) -> Result<()> {
        self.before_write()?;
        let mut tables = self.tables.write().await;
        for write in writes {
            match write {
                DriverWrite::Upsert { table, id, row } => {
                    tables.rows.entry(table).or_default().insert(id, row);
                }
                DriverWrite::Delete { table, id } => {
                    if let Some(rows) = tables.rows.get_mut(&table) {
                        rows.remove(&id);
                    }
                }
            }
        }
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.before_write()?;
        let mut tables = self.tables.write().await;
        for rows in tables.rows.values_mut() {
            rows.clear();
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
