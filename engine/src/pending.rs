//! Pending mutations: outbox entries as they are persisted.

use crate::temporal::Timestamp;
use crate::{error::Result, Error, ModelId, ModelName, StorageItemChange};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reserved table holding outbox entries.
pub const PENDING_MUTATION_TABLE: &str = "__PendingMutation";

/// Identifies the record a mutation targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordKey {
    pub model_name: ModelName,
    pub id: ModelId,
}

impl RecordKey {
    pub fn new(model_name: impl Into<ModelName>, id: impl Into<ModelId>) -> Self {
        Self {
            model_name: model_name.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.model_name, self.id)
    }
}

/// Processing state of an outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationState {
    /// Persisted, not yet written to local storage
    Queued,
    /// Written locally, awaiting remote reconciliation
    AppliedLocally,
    /// Handed to the remote reconciler
    InFlight,
}

/// A local mutation waiting in the outbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMutation {
    /// Time-ordered UUID
    pub id: String,
    /// Position in enqueue order
    pub sequence: u64,
    pub change: StorageItemChange,
    pub state: MutationState,
    /// Failed reconciliation attempts so far
    pub attempts: u32,
    pub created_at: Timestamp,
}

impl PendingMutation {
    pub fn new(sequence: u64, change: StorageItemChange) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            sequence,
            change,
            state: MutationState::Queued,
            attempts: 0,
            created_at: Timestamp::now(),
        }
    }

    pub fn record_key(&self) -> RecordKey {
        RecordKey::new(self.change.model_name(), self.change.item.id())
    }

    pub fn with_state(mut self, state: MutationState) -> Self {
        self.state = state;
        self
    }

    /// Encode for storage in [`PENDING_MUTATION_TABLE`].
    pub fn to_row(&self) -> Result<serde_json::Value> {
        serde_json::to_value(self).map_err(|e| Error::InvalidRecord(e.to_string()))
    }

    pub fn from_row(row: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(row.clone()).map_err(|e| {
            Error::InvalidRecord(format!("unreadable pending mutation: {}", e))
        })
    }
}
