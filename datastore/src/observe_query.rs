//! Live query snapshots.
//!
//! A subscription emits the current result set first, then a fresh snapshot
//! whenever qualifying changes arrive. Until the model is synced, changes
//! are collected until either `max_records` of them are pending or
//! `max_time` has passed since the first one.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use harbor_engine::{DataStoreItemChange, QueryOptions, QuerySnapshot, StorageItemChange};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::adapter::LocalStorageAdapter;
use crate::broker::ChangeStream;
use crate::config::DataStoreConfig;
use crate::error::Result;

/// Batching limits for observed queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserveQuerySettings {
    pub max_records: usize,
    pub max_time: Duration,
}

impl From<&DataStoreConfig> for ObserveQuerySettings {
    fn from(config: &DataStoreConfig) -> Self {
        Self {
            max_records: config.observe_query_max_records as usize,
            max_time: config.observe_query_max_time,
        }
    }
}

/// Handle to a running observed query.
///
/// Dropping the handle cancels the query.
#[derive(Debug)]
pub struct QuerySubscription {
    receiver: mpsc::Receiver<Result<QuerySnapshot>>,
    task: JoinHandle<()>,
}

impl QuerySubscription {
    pub(crate) fn spawn(
        adapter: Arc<LocalStorageAdapter>,
        changes: ChangeStream,
        model_name: String,
        options: QueryOptions,
        settings: ObserveQuerySettings,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(16);
        let worker = QueryWorker {
            adapter,
            model_name,
            options,
            settings,
            sender,
            current_ids: HashSet::new(),
            pending: Vec::new(),
        };
        let task = tokio::spawn(worker.run(changes));
        Self { receiver, task }
    }

    /// Next snapshot, or `None` once the query has stopped.
    pub async fn recv(&mut self) -> Option<Result<QuerySnapshot>> {
        self.receiver.recv().await
    }

    /// Stop emitting snapshots.
    pub fn cancel(&mut self) {
        self.task.abort();
        self.receiver.close();
    }
}

impl Stream for QuerySubscription {
    type Item = Result<QuerySnapshot>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for QuerySubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct QueryWorker {
    adapter: Arc<LocalStorageAdapter>,
    model_name: String,
    options: QueryOptions,
    settings: ObserveQuerySettings,
    sender: mpsc::Sender<Result<QuerySnapshot>>,
    current_ids: HashSet<String>,
    pending: Vec<DataStoreItemChange>,
}

impl QueryWorker {
    async fn run(mut self, mut changes: ChangeStream) {
        let mut synced = self.adapter.sync_status().subscribe();
        let mut synced_open = true;
        let mut deadline: Option<Instant> = None;

        if !self.emit().await {
            return;
        }

        loop {
            tokio::select! {
                change = changes.recv() => {
                    let Some(change) = change else { break };
                    if !self.qualifies(&change).await {
                        continue;
                    }
                    self.pending.push(change.to_item_change());
                    if self.is_synced() || self.pending.len() >= self.settings.max_records {
                        deadline = None;
                        if !self.emit().await {
                            break;
                        }
                    } else if deadline.is_none() {
                        deadline = Some(Instant::now() + self.settings.max_time);
                    }
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    deadline = None;
                    if !self.emit().await {
                        break;
                    }
                }
                model = synced.recv(), if synced_open => match model {
                    Ok(model) if model == self.model_name => {
                        deadline = None;
                        if !self.emit().await {
                            break;
                        }
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => synced_open = false,
                },
                _ = self.sender.closed() => break,
            }
        }
        tracing::debug!(model = %self.model_name, "Observed query stopped");
    }

    fn is_synced(&self) -> bool {
        self.adapter.sync_status().is_synced(&self.model_name)
    }

    /// Changes to records that match the query or were part of the last
    /// snapshot.
    async fn qualifies(&self, change: &StorageItemChange) -> bool {
        if change.model_name() != self.model_name {
            return false;
        }
        if self.current_ids.contains(change.item.id()) {
            return true;
        }
        let Ok(registry) = self.adapter.registry().await else {
            return false;
        };
        let Ok(schema) = registry.get(&self.model_name) else {
            return false;
        };
        matches!(self.options.predicate.evaluate(schema, &change.item), Ok(true))
    }

    /// Query and send a snapshot. Returns `false` once the query should stop.
    async fn emit(&mut self) -> bool {
        let result = match self.adapter.query(&self.model_name, &self.options).await {
            Ok(items) => {
                self.current_ids = items.iter().map(|m| m.id().to_string()).collect();
                Ok(QuerySnapshot {
                    items,
                    is_synced: self.is_synced(),
                    item_changes: std::mem::take(&mut self.pending),
                })
            }
            Err(err) => {
                tracing::warn!(model = %self.model_name, error = %err, "Observed query failed");
                Err(err)
            }
        };
        let failed = result.is_err();
        self.sender.send(result).await.is_ok() && !failed
    }
}
