//! Applies records arriving from the remote system.

use std::sync::Arc;

use harbor_engine::{Initiator, QueryPredicate, RecordKey, StorageItemChange, SyncOperation};

use crate::adapter::LocalStorageAdapter;
use crate::error::{DataStoreError, Result};
use crate::hub::{DataStoreEvent, Hub};
use crate::outbox::Outbox;

/// Merges remote writes into local storage.
///
/// A record with a pending local mutation keeps its local copy: the remote
/// version is skipped until the outbox has reconciled.
#[derive(Debug, Clone)]
pub struct Merger {
    adapter: Arc<LocalStorageAdapter>,
    outbox: Arc<Outbox>,
    hub: Hub,
}

impl Merger {
    pub fn new(adapter: Arc<LocalStorageAdapter>, outbox: Arc<Outbox>, hub: Hub) -> Self {
        Self {
            adapter,
            outbox,
            hub,
        }
    }

    /// Apply one remote write. Returns `None` when it was skipped.
    pub async fn merge(&self, operation: SyncOperation) -> Result<Option<StorageItemChange>> {
        let model = operation.model();
        let registry = self.adapter.registry().await?;
        if !registry.contains(model.model_name()) {
            self.not_applicable(model.model_name(), "model is not registered");
            return Ok(None);
        }

        let key = RecordKey::new(model.model_name(), model.id());
        let _guard = self.outbox.lock_record(&key).await;
        if self.outbox.has_pending_mutation(&key.model_name, &key.id).await {
            tracing::debug!(record = %key, "Remote copy skipped, local mutation pending");
            return Ok(None);
        }

        let all = QueryPredicate::all();
        let result = match &operation {
            SyncOperation::Save(model) => self.adapter.save(model, Initiator::Remote, &all).await,
            SyncOperation::Delete(model) => self.adapter.delete(model, Initiator::Remote, &all).await,
        };
        match result {
            Ok(change) => {
                self.hub.emit(DataStoreEvent::SubscriptionDataProcessed {
                    model: change.model_name().to_string(),
                    element: change.item.clone(),
                });
                Ok(Some(change))
            }
            Err(DataStoreError::InvalidModel(reason)) => {
                self.not_applicable(&key.model_name, &reason);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Apply remote writes atomically, skipping records with pending
    /// local mutations.
    pub async fn merge_batch(&self, operations: Vec<SyncOperation>) -> Result<Vec<StorageItemChange>> {
        let keys: Vec<RecordKey> = operations
            .iter()
            .map(|op| RecordKey::new(op.model().model_name(), op.model().id()))
            .collect();
        let _guards = self.outbox.lock_records(keys.clone()).await;

        let mut accepted = Vec::with_capacity(operations.len());
        for (operation, key) in operations.into_iter().zip(keys) {
            if self.outbox.has_pending_mutation(&key.model_name, &key.id).await {
                tracing::debug!(record = %key, "Remote copy skipped, local mutation pending");
                continue;
            }
            accepted.push(operation);
        }

        let changes = self
            .adapter
            .batch_sync_operations(accepted, Initiator::Remote)
            .await?;
        for change in &changes {
            self.hub.emit(DataStoreEvent::SubscriptionDataProcessed {
                model: change.model_name().to_string(),
                element: change.item.clone(),
            });
        }
        Ok(changes)
    }

    fn not_applicable(&self, model: &str, reason: &str) {
        tracing::warn!(model = %model, reason = %reason, "Remote data not applicable");
        self.hub.emit(DataStoreEvent::NonApplicableDataReceived {
            model: model.to_string(),
            reason: reason.to_string(),
        });
    }
}
