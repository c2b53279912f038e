//! Bounded worker pool for facade operations.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::error::{DataStoreError, Result};

/// Runs operations on spawned tasks, at most `size` at a time.
///
/// An operation that does not finish within the timeout yields
/// [`DataStoreError::Timeout`]; the task itself keeps running to completion.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl WorkerPool {
    pub fn new(size: usize, timeout: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size)),
            timeout,
        }
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub async fn run<F, T>(&self, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let task = tokio::spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|_| DataStoreError::Internal("worker pool closed".into()))?;
            operation.await
        });

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(DataStoreError::Internal(format!("worker task failed: {}", join))),
            Err(_) => {
                tracing::warn!(timeout_ms = self.timeout.as_millis() as u64, "Operation timed out");
                Err(DataStoreError::Timeout(self.timeout))
            }
        }
    }
}
