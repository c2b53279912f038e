//! Change records emitted by storage and consumed by observers.

use crate::{Model, QueryPredicate};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Initiator {
    /// Requested by the application on this device
    Local,
    /// Received from the remote system
    Remote,
}

/// Kind of mutation a change describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeType::Create => write!(f, "CREATE"),
            ChangeType::Update => write!(f, "UPDATE"),
            ChangeType::Delete => write!(f, "DELETE"),
        }
    }
}

/// A mutation of one record, together with its precondition.
///
/// For `Delete`, `item` is the last known copy of the record; the record is
/// gone from storage once the change has been applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageItemChange {
    pub change_id: String,
    pub change_type: ChangeType,
    pub item: Model,
    pub initiator: Initiator,
    /// Must hold against the stored record for the change to apply.
    pub predicate: QueryPredicate,
}

impl StorageItemChange {
    pub fn new(
        change_type: ChangeType,
        item: Model,
        initiator: Initiator,
        predicate: QueryPredicate,
    ) -> Self {
        Self {
            change_id: uuid::Uuid::new_v4().to_string(),
            change_type,
            item,
            initiator,
            predicate,
        }
    }

    /// Name of the model the item belongs to.
    pub fn model_name(&self) -> &str {
        self.item.model_name()
    }

    /// Observer-facing view of this change with a fresh correlation id.
    pub fn to_item_change(&self) -> DataStoreItemChange {
        DataStoreItemChange {
            uuid: uuid::Uuid::new_v4().to_string(),
            change_type: self.change_type,
            item: self.item.clone(),
            model_name: self.model_name().to_string(),
            initiator: self.initiator,
        }
    }
}

impl fmt::Display for StorageItemChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} ({:?}, if {})",
            self.change_type,
            self.model_name(),
            self.item.id(),
            self.initiator,
            self.predicate
        )
    }
}

/// Read-only change event handed to query observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataStoreItemChange {
    pub uuid: String,
    #[serde(rename = "type")]
    pub change_type: ChangeType,
    pub item: Model,
    pub model_name: String,
    pub initiator: Initiator,
}

/// A materialised result set of an observed query.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySnapshot {
    pub items: Vec<Model>,
    /// Whether the model has completed a sync with the remote system.
    pub is_synced: bool,
    /// Changes folded in since the previous snapshot.
    pub item_changes: Vec<DataStoreItemChange>,
}

/// One write of a batch applied as a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "item", rename_all = "camelCase")]
pub enum SyncOperation {
    Save(Model),
    Delete(Model),
}

impl SyncOperation {
    pub fn model(&self) -> &Model {
        match self {
            SyncOperation::Save(m) | SyncOperation::Delete(m) => m,
        }
    }
}
