//! Remote reconciliation boundary.

use async_trait::async_trait;
use harbor_engine::StorageItemChange;

use crate::error::Result;

/// How the remote system answered a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Accepted,
    /// Rejected; the local record is left as-is.
    Conflict { reason: String },
}

/// Hands locally applied mutations to the remote system.
///
/// Errors for which [`is_retryable`](crate::DataStoreError::is_retryable)
/// holds are retried with backoff; any other error fails the mutation.
#[async_trait]
pub trait RemoteReconciler: Send + Sync {
    async fn reconcile(&self, change: &StorageItemChange) -> Result<ReconcileOutcome>;
}

/// Accepts every mutation. Used when no remote system is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalOnly;

#[async_trait]
impl RemoteReconciler for LocalOnly {
    async fn reconcile(&self, change: &StorageItemChange) -> Result<ReconcileOutcome> {
        tracing::trace!(model = %change.model_name(), id = %change.item.id(), "No remote configured");
        Ok(ReconcileOutcome::Accepted)
    }
}
