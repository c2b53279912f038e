//! Hub channel for data store lifecycle and status events.

use chrono::{DateTime, Utc};
use harbor_engine::{ChangeType, Model, PendingMutation};
use serde::Serialize;
use tokio::sync::broadcast;

/// Channel every data store event is published on.
pub const DATASTORE_CHANNEL: &str = "datastore";

/// A mutation as reported by the outbox events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxMutationEvent {
    pub model_name: String,
    pub change_type: ChangeType,
    pub element: Model,
}

impl From<&PendingMutation> for OutboxMutationEvent {
    fn from(mutation: &PendingMutation) -> Self {
        Self {
            model_name: mutation.change.model_name().to_string(),
            change_type: mutation.change.change_type,
            element: mutation.change.item.clone(),
        }
    }
}

/// Counts reported once a model finishes syncing.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSyncedEvent {
    pub model: String,
    pub is_full_sync: bool,
    pub is_delta_sync: bool,
    pub added: u64,
    pub updated: u64,
    pub deleted: u64,
}

/// Payloads published on [`DATASTORE_CHANNEL`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum DataStoreEvent {
    #[serde(rename_all = "camelCase")]
    OutboxStatus { is_empty: bool },
    OutboxMutationEnqueued(OutboxMutationEvent),
    OutboxMutationProcessed(OutboxMutationEvent),
    OutboxMutationFailed {
        mutation: OutboxMutationEvent,
        error: String,
    },
    SyncQueriesStarted { models: Vec<String> },
    SyncQueriesReady,
    ModelSynced(ModelSyncedEvent),
    NetworkStatus { active: bool },
    NonApplicableDataReceived { model: String, reason: String },
    Ready,
    SubscriptionsEstablished,
    SubscriptionDataProcessed { model: String, element: Model },
}

impl DataStoreEvent {
    /// Event name as seen by hub listeners.
    pub fn name(&self) -> &'static str {
        match self {
            DataStoreEvent::OutboxStatus { .. } => "outboxStatus",
            DataStoreEvent::OutboxMutationEnqueued(_) => "outboxMutationEnqueued",
            DataStoreEvent::OutboxMutationProcessed(_) => "outboxMutationProcessed",
            DataStoreEvent::OutboxMutationFailed { .. } => "outboxMutationFailed",
            DataStoreEvent::SyncQueriesStarted { .. } => "syncQueriesStarted",
            DataStoreEvent::SyncQueriesReady => "syncQueriesReady",
            DataStoreEvent::ModelSynced(_) => "modelSynced",
            DataStoreEvent::NetworkStatus { .. } => "networkStatus",
            DataStoreEvent::NonApplicableDataReceived { .. } => "nonApplicableDataReceived",
            DataStoreEvent::Ready => "ready",
            DataStoreEvent::SubscriptionsEstablished => "subscriptionsEstablished",
            DataStoreEvent::SubscriptionDataProcessed { .. } => "subscriptionDataProcessed",
        }
    }
}

/// An event as delivered to hub subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct HubEvent {
    pub channel: String,
    pub name: &'static str,
    pub payload: DataStoreEvent,
    pub published_at: DateTime<Utc>,
}

/// Broadcast hub. Subscribers see events published after they subscribed.
#[derive(Debug, Clone)]
pub struct Hub {
    sender: broadcast::Sender<HubEvent>,
}

impl Hub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, channel: &str, payload: DataStoreEvent) {
        let event = HubEvent {
            channel: channel.to_string(),
            name: payload.name(),
            payload,
            published_at: Utc::now(),
        };
        tracing::debug!(channel = %channel, event = event.name, "Hub event published");
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    /// Publish on [`DATASTORE_CHANNEL`].
    pub fn emit(&self, payload: DataStoreEvent) {
        self.publish(DATASTORE_CHANNEL, payload);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.sender.subscribe()
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(1024)
    }
}
