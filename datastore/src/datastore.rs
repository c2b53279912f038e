//! The `DataStore` category facade.
//!
//! Routes calls to the storage adapter and the outbox once `configure` has
//! run, executes mutations and queries on the worker pool, and publishes
//! lifecycle events on the hub.

use std::sync::Arc;
use std::time::Duration;

use harbor_engine::{
    Model, ModelSchema, QueryOptions, QueryPredicate, SchemaRegistry, StorageItemChange,
    SyncOperation, TypedModel,
};
use tokio::sync::RwLock;

use crate::adapter::LocalStorageAdapter;
use crate::broker::ChangeStream;
use crate::config::DataStoreConfig;
use crate::driver::{MemoryDriver, SqliteDriver, StorageDriver};
use crate::error::{DataStoreError, Result};
use crate::hub::{DataStoreEvent, Hub, ModelSyncedEvent};
use crate::merger::Merger;
use crate::observe_query::QuerySubscription;
use crate::outbox::{FailedMutation, Outbox};
use crate::pool::WorkerPool;
use crate::remote::{LocalOnly, RemoteReconciler};

#[derive(Debug, Clone)]
struct Running {
    registry: SchemaRegistry,
    adapter: Arc<LocalStorageAdapter>,
    outbox: Arc<Outbox>,
    merger: Merger,
    pool: WorkerPool,
}

/// Entry point for applications.
pub struct DataStore {
    config: DataStoreConfig,
    hub: Hub,
    driver: Option<Arc<dyn StorageDriver>>,
    remote: Arc<dyn RemoteReconciler>,
    running: RwLock<Option<Running>>,
}

impl std::fmt::Debug for DataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStore")
            .field("config", &self.config)
            .field("running", &self.running)
            .finish_non_exhaustive()
    }
}

impl DataStore {
    pub fn new(config: DataStoreConfig) -> Self {
        Self {
            config,
            hub: Hub::default(),
            driver: None,
            remote: Arc::new(LocalOnly),
            running: RwLock::new(None),
        }
    }

    /// Use this driver instead of one derived from the configuration.
    pub fn with_driver(mut self, driver: Arc<dyn StorageDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteReconciler>) -> Self {
        self.remote = remote;
        self
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn config(&self) -> &DataStoreConfig {
        &self.config
    }

    /// Open storage for `registry`, restore the outbox and start processing.
    pub async fn configure(&self, registry: SchemaRegistry) -> Result<Vec<ModelSchema>> {
        let mut running = self.running.write().await;
        if running.is_some() {
            return Err(DataStoreError::IllegalState("DataStore is already configured".into()));
        }

        let driver: Arc<dyn StorageDriver> = match (&self.driver, &self.config.database_url) {
            (Some(driver), _) => Arc::clone(driver),
            (None, Some(url)) => Arc::new(SqliteDriver::connect(url).await?),
            (None, None) => Arc::new(MemoryDriver::new()),
        };

        let (started, schemas) = self.start(registry, driver).await?;
        *running = Some(started);
        tracing::info!(models = schemas.len(), "DataStore ready");
        self.hub.emit(DataStoreEvent::Ready);
        Ok(schemas)
    }

    async fn start(
        &self,
        registry: SchemaRegistry,
        driver: Arc<dyn StorageDriver>,
    ) -> Result<(Running, Vec<ModelSchema>)> {
        let adapter = Arc::new(LocalStorageAdapter::new(driver));
        let schemas = adapter.initialize(registry.clone(), &self.config).await?;

        let outbox = Arc::new(Outbox::new(
            Arc::clone(&adapter),
            Arc::clone(&self.remote),
            self.hub.clone(),
            self.config.clone(),
        ));
        outbox.load().await?;
        outbox.start();

        let merger = Merger::new(Arc::clone(&adapter), Arc::clone(&outbox), self.hub.clone());
        let pool = WorkerPool::new(self.config.worker_pool_size, self.config.operation_timeout);
        Ok((
            Running {
                registry,
                adapter,
                outbox,
                merger,
                pool,
            },
            schemas,
        ))
    }

    async fn running(&self) -> Result<Running> {
        self.running
            .read()
            .await
            .clone()
            .ok_or(DataStoreError::NotConfigured)
    }

    pub async fn save(&self, model: Model) -> Result<StorageItemChange> {
        self.save_with_condition(model, QueryPredicate::all()).await
    }

    /// Save if `predicate` holds against the stored copy.
    pub async fn save_with_condition(
        &self,
        model: Model,
        predicate: QueryPredicate,
    ) -> Result<StorageItemChange> {
        let running = self.running().await?;
        let outbox = running.outbox;
        running
            .pool
            .run(async move { outbox.save(model, predicate).await })
            .await
    }

    pub async fn save_typed<T: TypedModel>(&self, record: &T) -> Result<StorageItemChange> {
        let running = self.running().await?;
        let model = record.to_model(running.registry.get(T::MODEL_NAME)?)?;
        self.save(model).await
    }

    pub async fn delete(&self, model: Model) -> Result<StorageItemChange> {
        self.delete_with_condition(model, QueryPredicate::all()).await
    }

    /// Delete if `predicate` holds against the stored copy.
    pub async fn delete_with_condition(
        &self,
        model: Model,
        predicate: QueryPredicate,
    ) -> Result<StorageItemChange> {
        let running = self.running().await?;
        let outbox = running.outbox;
        running
            .pool
            .run(async move { outbox.delete(model, predicate).await })
            .await
    }

    /// Delete every record of `model_name` matching `predicate`.
    ///
    /// Each match goes through the outbox on its own, with `predicate` as its
    /// precondition; records that stopped matching meanwhile are left alone.
    pub async fn delete_where(
        &self,
        model_name: &str,
        predicate: QueryPredicate,
    ) -> Result<Vec<StorageItemChange>> {
        let matches = self
            .query(model_name, QueryOptions::matches(predicate.clone()))
            .await?;
        let mut changes = Vec::with_capacity(matches.len());
        for model in matches {
            match self.delete_with_condition(model, predicate.clone()).await {
                Ok(change) => changes.push(change),
                Err(DataStoreError::PredicateConditionFailed { id, .. }) => {
                    tracing::debug!(model = %model_name, id = %id, "Record no longer matches");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(changes)
    }

    pub async fn query(&self, model_name: &str, options: QueryOptions) -> Result<Vec<Model>> {
        let running = self.running().await?;
        let adapter = running.adapter;
        let model_name = model_name.to_string();
        running
            .pool
            .run(async move { adapter.query(&model_name, &options).await })
            .await
    }

    pub async fn query_typed<T: TypedModel>(&self, options: QueryOptions) -> Result<Vec<T>> {
        self.query(T::MODEL_NAME, options)
            .await?
            .iter()
            .map(|model| T::from_model(model).map_err(DataStoreError::from))
            .collect()
    }

    pub async fn get(&self, model_name: &str, id: &str) -> Result<Option<Model>> {
        let running = self.running().await?;
        let adapter = running.adapter;
        let (model_name, id) = (model_name.to_string(), id.to_string());
        running
            .pool
            .run(async move { adapter.get(&model_name, &id).await })
            .await
    }

    /// Every change applied from now on, local or remote.
    pub async fn observe(&self) -> Result<ChangeStream> {
        let running = self.running().await?;
        let adapter = running.adapter;
        running.pool.run(async move { adapter.observe().await }).await
    }

    pub async fn observe_query(
        &self,
        model_name: &str,
        options: QueryOptions,
    ) -> Result<QuerySubscription> {
        let running = self.running().await?;
        let adapter = running.adapter;
        let model_name = model_name.to_string();
        running
            .pool
            .run(async move { adapter.observe_query(&model_name, options).await })
            .await
    }

    /// Apply a write received from the remote system.
    pub async fn merge_remote(
        &self,
        operation: SyncOperation,
    ) -> Result<Option<StorageItemChange>> {
        let running = self.running().await?;
        let merger = running.merger;
        running
            .pool
            .run(async move { merger.merge(operation).await })
            .await
    }

    pub async fn merge_remote_batch(
        &self,
        operations: Vec<SyncOperation>,
    ) -> Result<Vec<StorageItemChange>> {
        let running = self.running().await?;
        let merger = running.merger;
        running
            .pool
            .run(async move { merger.merge_batch(operations).await })
            .await
    }

    pub async fn has_pending_mutation(&self, model_name: &str, id: &str) -> Result<bool> {
        Ok(self
            .running()
            .await?
            .outbox
            .has_pending_mutation(model_name, id)
            .await)
    }

    /// Wait until the outbox has drained.
    pub async fn wait_for_outbox(&self, timeout: Duration) -> Result<()> {
        self.running().await?.outbox.wait_idle(timeout).await
    }

    /// Mutations that failed permanently since the last call.
    pub async fn take_failed_mutations(&self) -> Result<Vec<FailedMutation>> {
        Ok(self.running().await?.outbox.take_failures().await)
    }

    pub fn publish_network_status(&self, active: bool) {
        self.hub.emit(DataStoreEvent::NetworkStatus { active });
    }

    pub fn sync_queries_started(&self, models: Vec<String>) {
        self.hub.emit(DataStoreEvent::SyncQueriesStarted { models });
    }

    pub fn sync_queries_ready(&self) {
        self.hub.emit(DataStoreEvent::SyncQueriesReady);
    }

    pub fn subscriptions_established(&self) {
        self.hub.emit(DataStoreEvent::SubscriptionsEstablished);
    }

    /// Record that a model finished syncing and publish `modelSynced`.
    pub async fn mark_model_synced(&self, event: ModelSyncedEvent) -> Result<()> {
        let running = self.running().await?;
        running.registry.get(&event.model)?;
        running.adapter.sync_status().mark_synced(&event.model);
        tracing::info!(
            model = %event.model,
            added = event.added,
            updated = event.updated,
            deleted = event.deleted,
            "Model synced"
        );
        self.hub.emit(DataStoreEvent::ModelSynced(event));
        Ok(())
    }

    /// Erase all data, including pending mutations, and start over with
    /// the same models.
    ///
    /// When storage cannot be cleared nothing is lost: the outbox reloads
    /// its queue from storage and resumes.
    pub async fn clear(&self) -> Result<()> {
        let mut running = self.running.write().await;
        let current = running.take().ok_or(DataStoreError::NotConfigured)?;
        current.outbox.stop();
        if let Err(err) = current.adapter.clear().await {
            tracing::warn!(error = %err, "Clear failed, resuming outbox");
            current.outbox.reset().await;
            if let Err(load_err) = current.outbox.load().await {
                tracing::error!(error = %load_err, "Reloading the outbox failed");
            }
            current.outbox.start();
            *running = Some(current);
            return Err(err);
        }
        current.outbox.reset().await;

        let driver = Arc::clone(current.adapter.driver());
        match self.start(current.registry.clone(), driver).await {
            Ok((restarted, _)) => {
                *running = Some(restarted);
                tracing::info!("DataStore cleared");
                Ok(())
            }
            Err(err) => {
                tracing::error!(error = %err, "Restart after clear failed");
                if let Err(close_err) = current.adapter.terminate().await {
                    tracing::warn!(error = %close_err, "Releasing storage failed");
                }
                Err(err)
            }
        }
    }

    /// Stop the outbox and release storage. `configure` may be called again.
    pub async fn terminate(&self) -> Result<()> {
        let Some(current) = self.running.write().await.take() else {
            return Ok(());
        };
        current.outbox.stop();
        current.adapter.terminate().await?;
        tracing::info!("DataStore terminated");
        Ok(())
    }
}
