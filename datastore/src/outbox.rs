//! Mutation outbox.
//!
//! Every local save or delete is persisted as a [`PendingMutation`] before it
//! touches the model tables, then applied locally, then handed to the
//! [`RemoteReconciler`] by a background processor. Mutations of one record
//! run strictly in enqueue order and at most one of them is in flight at a
//! time; mutations of different records proceed independently.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use harbor_engine::{
    ChangeType, Initiator, Model, MutationState, PendingMutation, QueryPredicate, RecordKey,
    StorageItemChange, PENDING_MUTATION_TABLE,
};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::{JoinHandle, JoinSet};

use crate::adapter::LocalStorageAdapter;
use crate::config::DataStoreConfig;
use crate::driver::StorageDriver;
use crate::error::{DataStoreError, Result};
use crate::hub::{DataStoreEvent, Hub, OutboxMutationEvent};
use crate::locks::{RecordGuard, RecordLocks};
use crate::remote::{ReconcileOutcome, RemoteReconciler};

/// A mutation that was removed from the outbox without being applied.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedMutation {
    pub mutation: PendingMutation,
    pub error: DataStoreError,
}

/// Durable queue of local mutations.
pub struct Outbox {
    driver: Arc<dyn StorageDriver>,
    adapter: Arc<LocalStorageAdapter>,
    remote: Arc<dyn RemoteReconciler>,
    hub: Hub,
    config: DataStoreConfig,
    locks: RecordLocks,
    sequence: AtomicU64,
    entries: Mutex<BTreeMap<u64, PendingMutation>>,
    size: watch::Sender<usize>,
    failures: Mutex<Vec<FailedMutation>>,
    wake: Notify,
    processor: StdMutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Outbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbox")
            .field("pending", &*self.size.borrow())
            .field("sequence", &self.sequence.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Outbox {
    pub fn new(
        adapter: Arc<LocalStorageAdapter>,
        remote: Arc<dyn RemoteReconciler>,
        hub: Hub,
        config: DataStoreConfig,
    ) -> Self {
        let (size, _) = watch::channel(0);
        Self {
            driver: Arc::clone(adapter.driver()),
            adapter,
            remote,
            hub,
            config,
            locks: RecordLocks::new(),
            sequence: AtomicU64::new(0),
            entries: Mutex::new(BTreeMap::new()),
            size,
            failures: Mutex::new(Vec::new()),
            wake: Notify::new(),
            processor: StdMutex::new(None),
        }
    }

    /// Restore persisted mutations after a restart.
    ///
    /// Entries that were persisted but never applied locally are applied
    /// now. Publishes the resulting outbox status.
    pub async fn load(&self) -> Result<usize> {
        let rows = self.driver.scan(PENDING_MUTATION_TABLE).await?;
        let mut loaded = rows
            .iter()
            .map(PendingMutation::from_row)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        loaded.sort_by_key(|m| m.sequence);

        let next = loaded.last().map_or(0, |m| m.sequence + 1);
        self.sequence.fetch_max(next, Ordering::SeqCst);

        {
            let mut entries = self.entries.lock().await;
            for mutation in &loaded {
                let mut mutation = mutation.clone();
                if mutation.state == MutationState::InFlight {
                    mutation.state = MutationState::AppliedLocally;
                }
                entries.insert(mutation.sequence, mutation);
            }
            self.size.send_replace(entries.len());
            self.hub.emit(DataStoreEvent::OutboxStatus {
                is_empty: entries.is_empty(),
            });
        }

        let count = loaded.len();
        for mutation in loaded
            .into_iter()
            .filter(|m| m.state == MutationState::Queued)
        {
            let key = mutation.record_key();
            let _guard = self.locks.acquire(&key).await;
            if self.already_applied(&mutation.change).await? {
                self.mark_applied(mutation.clone(), mutation.change.clone()).await;
            } else {
                // The caller of the original mutation is gone; failures are
                // reported through the hub.
                let _ = self.apply(mutation).await;
            }
        }

        tracing::info!(pending = count, "Outbox loaded");
        self.wake.notify_one();
        Ok(count)
    }

    /// Queue a local save and apply it.
    pub async fn save(&self, model: Model, predicate: QueryPredicate) -> Result<StorageItemChange> {
        self.adapter.validate_mutation(&model, &predicate).await?;
        let exists = self
            .adapter
            .get(model.model_name(), model.id())
            .await?
            .is_some();
        let change_type = if exists { ChangeType::Update } else { ChangeType::Create };
        self.submit(StorageItemChange::new(change_type, model, Initiator::Local, predicate))
            .await
    }

    /// Queue a local delete and apply it.
    pub async fn delete(&self, model: Model, predicate: QueryPredicate) -> Result<StorageItemChange> {
        self.adapter
            .validate_predicate(model.model_name(), &predicate)
            .await?;
        self.submit(StorageItemChange::new(
            ChangeType::Delete,
            model,
            Initiator::Local,
            predicate,
        ))
        .await
    }

    async fn submit(&self, change: StorageItemChange) -> Result<StorageItemChange> {
        let key = RecordKey::new(change.model_name(), change.item.id());
        let _guard = self.locks.acquire(&key).await;

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let mutation = PendingMutation::new(sequence, change);
        self.persist(&mutation).await?;
        self.track(mutation.clone()).await;
        self.hub
            .emit(DataStoreEvent::OutboxMutationEnqueued(OutboxMutationEvent::from(&mutation)));
        tracing::debug!(record = %key, sequence, "Mutation enqueued");

        self.apply(mutation).await
    }

    /// Apply a queued mutation to local storage. The caller holds the
    /// record lock.
    async fn apply(&self, mutation: PendingMutation) -> Result<StorageItemChange> {
        let result = self
            .retrying("local apply", || self.apply_local(&mutation.change))
            .await;
        match result {
            Ok(applied) => {
                self.mark_applied(mutation, applied.clone()).await;
                Ok(applied)
            }
            Err(err) => {
                self.fail(mutation, err.clone()).await;
                Err(err)
            }
        }
    }

    async fn apply_local(&self, change: &StorageItemChange) -> Result<StorageItemChange> {
        match change.change_type {
            ChangeType::Delete => {
                self.adapter
                    .delete(&change.item, Initiator::Local, &change.predicate)
                    .await
            }
            ChangeType::Create | ChangeType::Update => {
                self.adapter
                    .save(&change.item, Initiator::Local, &change.predicate)
                    .await
            }
        }
    }

    /// Whether storage already reflects a change that was never marked
    /// applied, as after a crash between the write and the bookkeeping.
    async fn already_applied(&self, change: &StorageItemChange) -> Result<bool> {
        let stored = self
            .adapter
            .get(change.model_name(), change.item.id())
            .await?;
        Ok(match change.change_type {
            ChangeType::Delete => stored.is_none(),
            ChangeType::Create | ChangeType::Update => stored.as_ref() == Some(&change.item),
        })
    }

    async fn mark_applied(&self, mutation: PendingMutation, applied: StorageItemChange) {
        let mutation = PendingMutation {
            change: applied,
            state: MutationState::AppliedLocally,
            ..mutation
        };
        if let Err(err) = self.persist(&mutation).await {
            // Storage already holds the write; a restart re-detects it.
            tracing::warn!(id = %mutation.id, error = %err, "Could not record applied mutation");
        }
        self.entries
            .lock()
            .await
            .insert(mutation.sequence, mutation);
        self.wake.notify_one();
    }

    async fn persist(&self, mutation: &PendingMutation) -> Result<()> {
        let row = mutation.to_row()?;
        self.retrying("persist mutation", || {
            self.driver.upsert(PENDING_MUTATION_TABLE, &mutation.id, &row)
        })
        .await
    }

    async fn unpersist(&self, mutation: &PendingMutation) {
        let removed = self
            .retrying("remove mutation", || {
                self.driver.delete(PENDING_MUTATION_TABLE, &mutation.id)
            })
            .await;
        if let Err(err) = removed {
            tracing::error!(id = %mutation.id, error = %err, "Could not remove mutation from storage");
        }
    }

    async fn track(&self, mutation: PendingMutation) {
        let mut entries = self.entries.lock().await;
        entries.insert(mutation.sequence, mutation);
        self.set_size(entries.len());
    }

    async fn untrack(&self, mutation: &PendingMutation) {
        let mut entries = self.entries.lock().await;
        entries.remove(&mutation.sequence);
        self.set_size(entries.len());
    }

    /// Publish `outboxStatus` when the outbox turns empty or non-empty.
    fn set_size(&self, size: usize) {
        let previous = self.size.send_replace(size);
        if (previous == 0) != (size == 0) {
            self.hub
                .emit(DataStoreEvent::OutboxStatus { is_empty: size == 0 });
        }
    }

    async fn complete(&self, mutation: PendingMutation) {
        self.unpersist(&mutation).await;
        self.untrack(&mutation).await;
        tracing::debug!(record = %mutation.record_key(), "Mutation reconciled");
        self.hub.emit(DataStoreEvent::OutboxMutationProcessed(
            OutboxMutationEvent::from(&mutation),
        ));
    }

    async fn fail(&self, mutation: PendingMutation, error: DataStoreError) {
        tracing::error!(
            record = %mutation.record_key(),
            attempts = mutation.attempts,
            error = %error,
            "Mutation failed permanently"
        );
        self.unpersist(&mutation).await;
        self.untrack(&mutation).await;
        self.hub.emit(DataStoreEvent::OutboxMutationFailed {
            mutation: OutboxMutationEvent::from(&mutation),
            error: error.to_string(),
        });
        self.failures
            .lock()
            .await
            .push(FailedMutation { mutation, error });
    }

    /// Run `op` until it succeeds, fails terminally, or runs out of attempts.
    async fn retrying<T, F, Fut>(&self, what: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.config.outbox_max_attempts => {
                    let delay = self.config.retry_delay(attempt);
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "{} failed, retrying",
                        what
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Start reconciling applied mutations in the background.
    pub fn start(self: &Arc<Self>) {
        let Ok(mut slot) = self.processor.lock() else {
            return;
        };
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        *slot = Some(tokio::spawn(Arc::clone(self).run()));
        tracing::info!("Outbox processor started");
    }

    /// Stop the processor. In-flight reconciliations are abandoned and
    /// retried after the next `load`.
    pub fn stop(&self) {
        if let Ok(mut slot) = self.processor.lock() {
            if let Some(task) = slot.take() {
                task.abort();
                tracing::info!("Outbox processor stopped");
            }
        }
    }

    async fn run(self: Arc<Self>) {
        let mut tasks = JoinSet::new();
        loop {
            for mutation in self.claim_ready().await {
                tasks.spawn(Arc::clone(&self).reconcile(mutation));
            }
            tokio::select! {
                _ = self.wake.notified() => {}
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }
    }

    /// Oldest entry of each record, if it is ready for the remote.
    async fn claim_ready(&self) -> Vec<PendingMutation> {
        let mut entries = self.entries.lock().await;
        let mut seen = HashSet::new();
        let mut ready = Vec::new();
        for mutation in entries.values_mut() {
            if !seen.insert(mutation.record_key()) {
                continue;
            }
            if mutation.state == MutationState::AppliedLocally {
                mutation.state = MutationState::InFlight;
                ready.push(mutation.clone());
            }
        }
        ready
    }

    async fn reconcile(self: Arc<Self>, mut mutation: PendingMutation) {
        loop {
            match self.remote.reconcile(&mutation.change).await {
                Ok(ReconcileOutcome::Accepted) => {
                    self.complete(mutation).await;
                    break;
                }
                Ok(ReconcileOutcome::Conflict { reason }) => {
                    tracing::warn!(record = %mutation.record_key(), reason = %reason, "Remote conflict");
                    let error = DataStoreError::ConflictUnresolved {
                        model: mutation.change.model_name().to_string(),
                        id: mutation.change.item.id().to_string(),
                        reason,
                    };
                    self.fail(mutation, error).await;
                    break;
                }
                Err(err) => {
                    mutation.attempts += 1;
                    if !err.is_retryable() || mutation.attempts >= self.config.outbox_max_attempts {
                        self.fail(mutation, err).await;
                        break;
                    }
                    let delay = self.config.retry_delay(mutation.attempts);
                    tracing::warn!(
                        record = %mutation.record_key(),
                        attempt = mutation.attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Reconciliation failed, retrying"
                    );
                    if let Some(entry) = self.entries.lock().await.get_mut(&mutation.sequence) {
                        entry.attempts = mutation.attempts;
                    }
                    tokio::time::sleep(delay).await;
                }
            }
        }
        self.wake.notify_one();
    }

    /// Whether a mutation of this record is waiting or in flight.
    pub async fn has_pending_mutation(&self, model_name: &str, id: &str) -> bool {
        let key = RecordKey::new(model_name, id);
        self.entries
            .lock()
            .await
            .values()
            .any(|m| m.record_key() == key)
    }

    /// Pending mutations in enqueue order.
    pub async fn pending(&self) -> Vec<PendingMutation> {
        self.entries.lock().await.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        *self.size.borrow()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until every mutation has been reconciled or failed.
    pub async fn wait_idle(&self, timeout: Duration) -> Result<()> {
        let mut size = self.size.subscribe();
        tokio::time::timeout(timeout, size.wait_for(|n| *n == 0))
            .await
            .map_err(|_| DataStoreError::Timeout(timeout))?
            .map_err(|_| DataStoreError::Internal("outbox closed".into()))?;
        Ok(())
    }

    /// Mutations dropped since the last call.
    pub async fn take_failures(&self) -> Vec<FailedMutation> {
        std::mem::take(&mut *self.failures.lock().await)
    }

    /// Serialize against local mutations of one record.
    pub async fn lock_record(&self, key: &RecordKey) -> RecordGuard<'_> {
        self.locks.acquire(key).await
    }

    pub async fn lock_records(&self, keys: impl IntoIterator<Item = RecordKey>) -> Vec<RecordGuard<'_>> {
        self.locks.acquire_all(keys).await
    }

    /// Forget every entry without reconciling. Rows are left to the
    /// caller, which clears storage as a whole.
    pub async fn reset(&self) {
        self.stop();
        let mut entries = self.entries.lock().await;
        entries.clear();
        self.sequence.store(0, Ordering::SeqCst);
        self.set_size(0);
    }
}
