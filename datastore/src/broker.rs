//! Fan-out of applied storage changes to `observe()` subscribers.
//!
//! Tracks live subscriptions and pushes every applied change to each of
//! them, in the order the adapter applied them.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures::Stream;
use harbor_engine::StorageItemChange;
use tokio::sync::mpsc;

/// Sender half of a subscription.
pub type ChangeSender = mpsc::UnboundedSender<StorageItemChange>;

/// Registry of `observe()` subscribers.
#[derive(Debug, Default)]
pub struct ChangeBroker {
    subscribers: DashMap<String, ChangeSender>,
}

impl ChangeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Open a new subscription.
    pub fn subscribe(self: &Arc<Self>) -> ChangeStream {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = uuid::Uuid::new_v4().to_string();
        self.subscribers.insert(id.clone(), sender);
        tracing::debug!(subscription = %id, "Change subscription registered");
        ChangeStream {
            id,
            receiver,
            broker: Arc::clone(self),
        }
    }

    pub fn unsubscribe(&self, id: &str) {
        if self.subscribers.remove(id).is_some() {
            tracing::debug!(subscription = %id, "Change subscription removed");
        }
    }

    /// Deliver a change to every subscriber, dropping closed ones.
    ///
    /// Returns the number of subscribers that received it.
    pub fn publish(&self, change: &StorageItemChange) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();

        for entry in self.subscribers.iter() {
            if entry.value().send(change.clone()).is_ok() {
                delivered += 1;
            } else {
                closed.push(entry.key().clone());
            }
        }

        for id in closed {
            tracing::warn!(subscription = %id, "Dropping closed change subscription");
            self.subscribers.remove(&id);
        }

        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Close every subscription; their streams end after draining.
    pub fn close_all(&self) {
        self.subscribers.clear();
    }
}

/// Stream of applied changes returned by `observe()`.
///
/// Dropping the stream cancels the subscription.
#[derive(Debug)]
pub struct ChangeStream {
    id: String,
    receiver: mpsc::UnboundedReceiver<StorageItemChange>,
    broker: Arc<ChangeBroker>,
}

impl ChangeStream {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next change, or `None` once cancelled and drained.
    pub async fn recv(&mut self) -> Option<StorageItemChange> {
        self.receiver.recv().await
    }

    /// Stop receiving changes. Already delivered changes stay readable.
    pub fn cancel(&mut self) {
        self.broker.unsubscribe(&self.id);
        self.receiver.close();
    }
}

impl Stream for ChangeStream {
    type Item = StorageItemChange;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for ChangeStream {
    fn drop(&mut self) {
        self.broker.unsubscribe(&self.id);
    }
}
