//! Snapshot types for persisting and restoring storage contents.
//!
//! A snapshot holds every row of every table, keyed by table then row id.
//! `BTreeMap` keeps serialization deterministic.

use crate::pending::{PendingMutation, PENDING_MUTATION_TABLE};
use crate::schema::SYSTEM_MODEL_PREFIX;
use crate::{error::Result, Error, Model, SchemaRegistry, SchemaVersion};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Rows of one table by id.
pub type TableRows = BTreeMap<String, serde_json::Value>;

/// A point-in-time copy of all stored rows.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// Schema version the rows were written under
    pub schema_version: SchemaVersion,
    pub tables: BTreeMap<String, TableRows>,
}

impl StoreSnapshot {
    /// Create a new empty snapshot.
    pub fn new(schema_version: SchemaVersion) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            schema_version,
            tables: BTreeMap::new(),
        }
    }

    pub fn insert_row(&mut self, table: impl Into<String>, id: impl Into<String>, row: serde_json::Value) {
        self.tables
            .entry(table.into())
            .or_default()
            .insert(id.into(), row);
    }

    pub fn row(&self, table: &str, id: &str) -> Option<&serde_json::Value> {
        self.tables.get(table)?.get(id)
    }

    /// Rows across all tables.
    pub fn row_count(&self) -> usize {
        self.tables.values().map(|t| t.len()).sum()
    }

    /// Rows in the outbox table.
    pub fn pending_count(&self) -> usize {
        self.tables.get(PENDING_MUTATION_TABLE).map_or(0, |t| t.len())
    }

    /// Check that every table is known and every row decodes. Row fields
    /// the schema does not declare are tolerated.
    pub fn validate(&self, registry: &SchemaRegistry) -> Result<()> {
        if self.schema_version != registry.version {
            return Err(Error::InvalidSnapshot(format!(
                "snapshot written under schema version {}, registry is at {}",
                self.schema_version, registry.version
            )));
        }
        for (table, rows) in &self.tables {
            if table == PENDING_MUTATION_TABLE {
                for row in rows.values() {
                    PendingMutation::from_row(row)?;
                }
                continue;
            }
            if table.starts_with(SYSTEM_MODEL_PREFIX) {
                return Err(Error::InvalidSnapshot(format!("unknown system table {}", table)));
            }
            let schema = registry.get(table)?;
            for (id, row) in rows {
                let (model, _) = Model::from_stored_json(schema, row)?;
                if model.id() != id {
                    return Err(Error::InvalidSnapshot(format!(
                        "row {} of {} carries id {}",
                        id,
                        table,
                        model.id()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Serialize to pretty JSON with deterministic ordering.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        Ok(snapshot)
    }

    pub fn metadata(&self) -> SnapshotMetadata {
        SnapshotMetadata {
            format_version: self.format_version,
            schema_version: self.schema_version,
            table_count: self.tables.len(),
            row_count: self.row_count(),
            pending_count: self.pending_count(),
        }
    }
}

/// Summary of a snapshot without the rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub format_version: u32,
    pub schema_version: SchemaVersion,
    pub table_count: usize,
    pub row_count: usize,
    pub pending_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDef, FieldType, ModelSchema};
    use crate::{ChangeType, Initiator, QueryPredicate, StorageItemChange};
    use serde_json::json;

    const ALICE: &str = "a0000000-0000-4000-8000-000000000001";
    const BOB: &str = "b0000000-0000-4000-8000-000000000002";

    fn registry() -> SchemaRegistry {
        SchemaRegistry::from_schemas(
            1,
            vec![ModelSchema::new(
                "User",
                vec![
                    FieldDef::required("name", FieldType::String),
                    FieldDef::optional("age", FieldType::Int),
                ],
            )],
        )
        .unwrap()
    }

    #[test]
    fn empty_snapshot() {
        let snapshot = StoreSnapshot::new(1);
        assert_eq!(snapshot.format_version, SNAPSHOT_FORMAT_VERSION);
        assert_eq!(snapshot.row_count(), 0);
        assert!(snapshot.validate(&registry()).is_ok());
    }

    #[test]
    fn deterministic_serialization() {
        let mut first = StoreSnapshot::new(1);
        first.insert_row("User", ALICE, json!({"id": ALICE, "name": "Alice"}));
        first.insert_row("User", BOB, json!({"id": BOB, "name": "Bob"}));

        let mut second = StoreSnapshot::new(1);
        second.insert_row("User", BOB, json!({"id": BOB, "name": "Bob"}));
        second.insert_row("User", ALICE, json!({"id": ALICE, "name": "Alice"}));

        assert_eq!(first.to_json().unwrap(), second.to_json().unwrap());
        assert_eq!(StoreSnapshot::from_json(&first.to_json().unwrap()).unwrap(), first);
    }

    #[test]
    fn validate_rows_and_pending() {
        let mut snapshot = StoreSnapshot::new(1);
        snapshot.insert_row("User", ALICE, json!({"id": ALICE, "name": "Alice", "age": 30}));

        let item = Model::builder("User").id(ALICE).set("name", "Alice").build().unwrap();
        let pending = PendingMutation::new(
            1,
            StorageItemChange::new(ChangeType::Create, item, Initiator::Local, QueryPredicate::all()),
        );
        snapshot.insert_row(PENDING_MUTATION_TABLE, pending.id.clone(), pending.to_row().unwrap());

        assert!(snapshot.validate(&registry()).is_ok());
        let meta = snapshot.metadata();
        assert_eq!(meta.row_count, 2);
        assert_eq!(meta.pending_count, 1);
        assert_eq!(meta.table_count, 2);
    }

    #[test]
    fn invalid_payload_rejected() {
        let mut snapshot = StoreSnapshot::new(1);
        snapshot.insert_row("User", ALICE, json!({"id": ALICE, "name": 123}));
        assert!(matches!(
            snapshot.validate(&registry()),
            Err(Error::TypeMismatch { .. })
        ));
    }

    #[test]
    fn unknown_table_rejected() {
        let mut snapshot = StoreSnapshot::new(1);
        snapshot.insert_row("Post", ALICE, json!({"id": ALICE}));
        assert!(matches!(
            snapshot.validate(&registry()),
            Err(Error::ModelNotFound(_))
        ));
    }

    #[test]
    fn mismatched_row_id_rejected() {
        let mut snapshot = StoreSnapshot::new(1);
        snapshot.insert_row("User", BOB, json!({"id": ALICE, "name": "Alice"}));
        assert!(matches!(
            snapshot.validate(&registry()),
            Err(Error::InvalidSnapshot(_))
        ));
    }

    #[test]
    fn schema_version_mismatch() {
        let snapshot = StoreSnapshot::new(9);
        assert!(matches!(
            snapshot.validate(&registry()),
            Err(Error::InvalidSnapshot(_))
        ));
    }

    #[test]
    fn reject_future_format_version() {
        let json = r#"{"formatVersion": 999, "schemaVersion": 1, "tables": {}}"#;
        assert!(matches!(
            StoreSnapshot::from_json(json),
            Err(Error::InvalidSnapshot(_))
        ));
    }
}
