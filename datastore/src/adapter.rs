//! Local storage adapter.
//!
//! Owns the storage driver and the schema registry, enforces preconditions,
//! cascades deletes along hasMany relations and publishes every applied
//! change to `observe()` subscribers after the driver write returned.

use std::collections::HashSet;
use std::sync::Arc;

use harbor_engine::{
    field, ChangeType, Initiator, Model, ModelSchema, QueryOptions, QueryPredicate, RecordKey,
    SchemaRegistry, StorageItemChange, SyncOperation,
};
use tokio::sync::RwLock;

use crate::broker::{ChangeBroker, ChangeStream};
use crate::config::DataStoreConfig;
use crate::driver::{decode_row, DriverWrite, StorageDriver};
use crate::error::{DataStoreError, Result};
use crate::locks::RecordLocks;
use crate::observe_query::{ObserveQuerySettings, QuerySubscription};
use crate::sync_status::SyncStatus;

/// Lifecycle of the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Uninitialized,
    Ready,
    Terminated,
}

#[derive(Debug)]
enum Lifecycle {
    Uninitialized,
    Ready {
        registry: Arc<SchemaRegistry>,
        observe: ObserveQuerySettings,
    },
    Terminated,
}

/// Persistence engine behind the data store.
pub struct LocalStorageAdapter {
    driver: Arc<dyn StorageDriver>,
    lifecycle: RwLock<Lifecycle>,
    broker: Arc<ChangeBroker>,
    locks: RecordLocks,
    sync_status: Arc<SyncStatus>,
}

impl std::fmt::Debug for LocalStorageAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStorageAdapter")
            .field("lifecycle", &self.lifecycle)
            .field("subscribers", &self.broker.subscriber_count())
            .finish_non_exhaustive()
    }
}

impl LocalStorageAdapter {
    pub fn new(driver: Arc<dyn StorageDriver>) -> Self {
        Self::with_sync_status(driver, Arc::new(SyncStatus::new()))
    }

    pub fn with_sync_status(driver: Arc<dyn StorageDriver>, sync_status: Arc<SyncStatus>) -> Self {
        Self {
            driver,
            lifecycle: RwLock::new(Lifecycle::Uninitialized),
            broker: ChangeBroker::new_shared(),
            locks: RecordLocks::new(),
            sync_status,
        }
    }

    pub fn driver(&self) -> &Arc<dyn StorageDriver> {
        &self.driver
    }

    pub fn sync_status(&self) -> &Arc<SyncStatus> {
        &self.sync_status
    }

    pub async fn state(&self) -> AdapterState {
        match &*self.lifecycle.read().await {
            Lifecycle::Uninitialized => AdapterState::Uninitialized,
            Lifecycle::Ready { .. } => AdapterState::Ready,
            Lifecycle::Terminated => AdapterState::Terminated,
        }
    }

    /// Validate the registry and open storage for it.
    ///
    /// Allowed before first use and after `terminate` or `clear`.
    pub async fn initialize(
        &self,
        registry: SchemaRegistry,
        config: &DataStoreConfig,
    ) -> Result<Vec<ModelSchema>> {
        let mut lifecycle = self.lifecycle.write().await;
        if matches!(*lifecycle, Lifecycle::Ready { .. }) {
            return Err(DataStoreError::IllegalState(
                "storage adapter is already initialized".into(),
            ));
        }
        registry.validate()?;
        config.validate()?;
        self.driver.open(&registry).await?;

        let schemas: Vec<ModelSchema> = registry.schemas().cloned().collect();
        tracing::info!(
            models = schemas.len(),
            schema_version = registry.version,
            "Storage adapter initialized"
        );
        *lifecycle = Lifecycle::Ready {
            registry: Arc::new(registry),
            observe: ObserveQuerySettings::from(config),
        };
        Ok(schemas)
    }

    /// Registry of the running adapter.
    pub async fn registry(&self) -> Result<Arc<SchemaRegistry>> {
        match &*self.lifecycle.read().await {
            Lifecycle::Ready { registry, .. } => Ok(Arc::clone(registry)),
            Lifecycle::Uninitialized => Err(DataStoreError::IllegalState(
                "storage adapter is not initialized".into(),
            )),
            Lifecycle::Terminated => Err(DataStoreError::AdapterTerminated),
        }
    }

    /// Check a mutation without touching storage.
    pub async fn validate_mutation(&self, model: &Model, predicate: &QueryPredicate) -> Result<()> {
        let registry = self.registry().await?;
        let schema = registry.get(model.model_name())?;
        model.validate(schema)?;
        predicate.validate(schema)?;
        Ok(())
    }

    /// Check a predicate against a model's schema without touching storage.
    pub async fn validate_predicate(&self, model_name: &str, predicate: &QueryPredicate) -> Result<()> {
        let registry = self.registry().await?;
        predicate.validate(registry.get(model_name)?)?;
        Ok(())
    }

    /// Stored copy of a record.
    pub async fn get(&self, model_name: &str, id: &str) -> Result<Option<Model>> {
        let registry = self.registry().await?;
        let schema = registry.get(model_name)?;
        self.read_record(schema, id).await
    }

    async fn read_record(&self, schema: &ModelSchema, id: &str) -> Result<Option<Model>> {
        match self.driver.get(&schema.name, id).await? {
            Some(row) => Ok(Some(decode_row(schema, &row)?)),
            None => Ok(None),
        }
    }

    /// Insert or update a record if `predicate` holds against the stored copy.
    ///
    /// A record that does not exist yet can only be saved unconditionally.
    pub async fn save(
        &self,
        model: &Model,
        initiator: Initiator,
        predicate: &QueryPredicate,
    ) -> Result<StorageItemChange> {
        let registry = self.registry().await?;
        let schema = registry.get(model.model_name())?;
        model.validate(schema)?;
        predicate.validate(schema)?;

        let key = RecordKey::new(model.model_name(), model.id());
        let _guard = self.locks.acquire(&key).await;

        let change_type = match self.read_record(schema, model.id()).await? {
            Some(existing) => {
                if !predicate.evaluate(schema, &existing)? {
                    return Err(condition_failed(model, predicate));
                }
                ChangeType::Update
            }
            None if predicate.is_match_all() => ChangeType::Create,
            None => return Err(condition_failed(model, predicate)),
        };

        self.driver
            .upsert(model.model_name(), model.id(), &model.to_json())
            .await?;

        let change = StorageItemChange::new(change_type, model.clone(), initiator, predicate.clone());
        tracing::debug!(model = %model.model_name(), id = %model.id(), change = %change_type, "Record saved");
        self.broker.publish(&change);
        Ok(change)
    }

    /// Delete one record if `predicate` holds against the stored copy.
    ///
    /// Records linked through hasMany relations are deleted first, each
    /// publishing its own change. Deleting a missing record succeeds and
    /// publishes nothing.
    pub async fn delete(
        &self,
        model: &Model,
        initiator: Initiator,
        predicate: &QueryPredicate,
    ) -> Result<StorageItemChange> {
        let registry = self.registry().await?;
        let schema = registry.get(model.model_name())?;
        predicate.validate(schema)?;

        let key = RecordKey::new(model.model_name(), model.id());
        let _guard = self.locks.acquire(&key).await;

        match self.read_record(schema, model.id()).await? {
            Some(existing) => {
                if !predicate.evaluate(schema, &existing)? {
                    return Err(condition_failed(model, predicate));
                }
                self.delete_with_children(&registry, existing, initiator, predicate)
                    .await
            }
            None => {
                tracing::debug!(model = %model.model_name(), id = %model.id(), "Delete of missing record");
                Ok(StorageItemChange::new(
                    ChangeType::Delete,
                    model.clone(),
                    initiator,
                    predicate.clone(),
                ))
            }
        }
    }

    /// Delete every record of `model_name` matching `predicate`.
    ///
    /// Each match is deleted on its own; a failure leaves earlier deletions
    /// in place.
    pub async fn delete_where(
        &self,
        model_name: &str,
        predicate: &QueryPredicate,
        initiator: Initiator,
    ) -> Result<Vec<StorageItemChange>> {
        let registry = self.registry().await?;
        let schema = registry.get(model_name)?;
        let candidates = self
            .driver
            .select(schema, &QueryOptions::matches(predicate.clone()))
            .await?;

        let mut changes = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let key = RecordKey::new(model_name, candidate.id());
            let _guard = self.locks.acquire(&key).await;

            // Re-read: the record may have changed since the selection.
            let Some(current) = self.read_record(schema, candidate.id()).await? else {
                continue;
            };
            if !predicate.evaluate(schema, &current)? {
                continue;
            }
            changes.push(
                self.delete_with_children(&registry, current, initiator, predicate)
                    .await?,
            );
        }
        tracing::debug!(model = %model_name, deleted = changes.len(), "Bulk delete finished");
        Ok(changes)
    }

    async fn delete_with_children(
        &self,
        registry: &SchemaRegistry,
        record: Model,
        initiator: Initiator,
        predicate: &QueryPredicate,
    ) -> Result<StorageItemChange> {
        for child in self.descendants(registry, &record).await?.into_iter().rev() {
            if self.driver.delete(child.model_name(), child.id()).await? {
                let change = StorageItemChange::new(
                    ChangeType::Delete,
                    child,
                    initiator,
                    QueryPredicate::all(),
                );
                tracing::debug!(model = %change.model_name(), id = %change.item.id(), "Cascaded delete");
                self.broker.publish(&change);
            }
        }

        self.driver.delete(record.model_name(), record.id()).await?;
        let change = StorageItemChange::new(ChangeType::Delete, record, initiator, predicate.clone());
        tracing::debug!(model = %change.model_name(), id = %change.item.id(), "Record deleted");
        self.broker.publish(&change);
        Ok(change)
    }

    /// Records reachable through hasMany relations, parents before children.
    async fn descendants(&self, registry: &SchemaRegistry, root: &Model) -> Result<Vec<Model>> {
        let mut seen = HashSet::new();
        seen.insert(RecordKey::new(root.model_name(), root.id()));
        let mut stack = vec![root.clone()];
        let mut found = Vec::new();

        while let Some(parent) = stack.pop() {
            for (child_schema, foreign_key) in registry.children_of(parent.model_name()) {
                let options = QueryOptions::matches(field(foreign_key).eq(parent.id()));
                for child in self.driver.select(child_schema, &options).await? {
                    if seen.insert(RecordKey::new(child.model_name(), child.id())) {
                        found.push(child.clone());
                        stack.push(child);
                    }
                }
            }
        }
        Ok(found)
    }

    /// Records of `model_name` matching `options`. No match is not an error.
    pub async fn query(&self, model_name: &str, options: &QueryOptions) -> Result<Vec<Model>> {
        let registry = self.registry().await?;
        let schema = registry.get(model_name)?;
        options.validate(schema)?;
        self.driver.select(schema, options).await
    }

    /// Stream of every change applied from now on.
    pub async fn observe(&self) -> Result<ChangeStream> {
        self.registry().await?;
        Ok(self.broker.subscribe())
    }

    /// Snapshots of a query, refreshed as matching records change.
    pub async fn observe_query(
        self: &Arc<Self>,
        model_name: &str,
        options: QueryOptions,
    ) -> Result<QuerySubscription> {
        let settings = match &*self.lifecycle.read().await {
            Lifecycle::Ready { registry, observe } => {
                options.validate(registry.get(model_name)?)?;
                *observe
            }
            Lifecycle::Uninitialized => {
                return Err(DataStoreError::IllegalState(
                    "storage adapter is not initialized".into(),
                ))
            }
            Lifecycle::Terminated => return Err(DataStoreError::AdapterTerminated),
        };
        let changes = self.broker.subscribe();
        Ok(QuerySubscription::spawn(
            Arc::clone(self),
            changes,
            model_name.to_string(),
            options,
            settings,
        ))
    }

    /// Apply remote writes as one unit: all of them land or none do.
    ///
    /// Deletes of records that are not stored are skipped.
    pub async fn batch_sync_operations(
        &self,
        operations: Vec<SyncOperation>,
        initiator: Initiator,
    ) -> Result<Vec<StorageItemChange>> {
        let registry = self.registry().await?;
        for op in &operations {
            let schema = registry.get(op.model().model_name())?;
            if let SyncOperation::Save(model) = op {
                model.validate(schema)?;
            }
        }

        let keys = operations
            .iter()
            .map(|op| RecordKey::new(op.model().model_name(), op.model().id()));
        let _guards = self.locks.acquire_all(keys).await;

        let mut writes = Vec::with_capacity(operations.len());
        let mut changes = Vec::with_capacity(operations.len());
        let mut present: HashSet<RecordKey> = HashSet::new();
        let mut absent: HashSet<RecordKey> = HashSet::new();

        for op in operations {
            let model = op.model();
            let key = RecordKey::new(model.model_name(), model.id());
            let exists = if present.contains(&key) {
                true
            } else if absent.contains(&key) {
                false
            } else {
                let schema = registry.get(model.model_name())?;
                self.read_record(schema, model.id()).await?.is_some()
            };

            match op {
                SyncOperation::Save(model) => {
                    let change_type = if exists { ChangeType::Update } else { ChangeType::Create };
                    writes.push(DriverWrite::upsert_model(&model));
                    absent.remove(&key);
                    present.insert(key);
                    changes.push(StorageItemChange::new(
                        change_type,
                        model,
                        initiator,
                        QueryPredicate::all(),
                    ));
                }
                SyncOperation::Delete(model) => {
                    present.remove(&key);
                    absent.insert(key);
                    if exists {
                        writes.push(DriverWrite::delete_model(&model));
                        changes.push(StorageItemChange::new(
                            ChangeType::Delete,
                            model,
                            initiator,
                            QueryPredicate::all(),
                        ));
                    }
                }
            }
        }

        self.driver.apply_batch(writes).await?;
        for change in &changes {
            self.broker.publish(change);
        }
        tracing::debug!(changes = changes.len(), "Sync batch applied");
        Ok(changes)
    }

    /// Erase every row and return to the uninitialized state.
    pub async fn clear(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.write().await;
        if matches!(*lifecycle, Lifecycle::Terminated) {
            return Err(DataStoreError::AdapterTerminated);
        }
        self.driver.clear().await?;
        self.broker.close_all();
        self.sync_status.reset();
        *lifecycle = Lifecycle::Uninitialized;
        tracing::info!("Storage adapter cleared");
        Ok(())
    }

    /// Release storage. Only `initialize` is accepted afterwards.
    pub async fn terminate(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.write().await;
        if matches!(*lifecycle, Lifecycle::Terminated) {
            return Ok(());
        }
        self.broker.close_all();
        self.driver.close().await?;
        *lifecycle = Lifecycle::Terminated;
        tracing::info!("Storage adapter terminated");
        Ok(())
    }
}

fn condition_failed(model: &Model, predicate: &QueryPredicate) -> DataStoreError {
    DataStoreError::PredicateConditionFailed {
        model: model.model_name().to_string(),
        id: model.id().to_string(),
        predicate: predicate.to_string(),
    }
}
