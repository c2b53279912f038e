//! Per-model sync completion flags.

use dashmap::DashSet;
use tokio::sync::broadcast;

/// Tracks which models have completed a sync with the remote system.
///
/// Observed queries subscribe to learn when their model becomes synced.
#[derive(Debug)]
pub struct SyncStatus {
    synced: DashSet<String>,
    events: broadcast::Sender<String>,
}

impl SyncStatus {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            synced: DashSet::new(),
            events,
        }
    }

    pub fn is_synced(&self, model: &str) -> bool {
        self.synced.contains(model)
    }

    /// Returns `true` when the model was not synced before.
    pub fn mark_synced(&self, model: &str) -> bool {
        let newly = self.synced.insert(model.to_string());
        let _ = self.events.send(model.to_string());
        newly
    }

    pub fn reset(&self) {
        self.synced.clear();
    }

    /// Names of models as they get marked synced.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.events.subscribe()
    }
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self::new()
    }
}
