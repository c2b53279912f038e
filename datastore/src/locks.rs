//! Per-record mutual exclusion.

use std::sync::Arc;

use dashmap::DashMap;
use harbor_engine::RecordKey;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per record key, created on demand and dropped once no
/// task holds or waits for it.
///
/// Waiters are served in FIFO order.
#[derive(Debug, Default)]
pub struct RecordLocks {
    locks: DashMap<RecordKey, Arc<Mutex<()>>>,
}

impl RecordLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &RecordKey) -> RecordGuard<'_> {
        let lock = Arc::clone(self.locks.entry(key.clone()).or_default().value());
        let guard = lock.lock_owned().await;
        RecordGuard {
            guard: Some(guard),
            key: key.clone(),
            locks: &self.locks,
        }
    }

    /// Acquire several keys in sorted order.
    pub async fn acquire_all(&self, keys: impl IntoIterator<Item = RecordKey>) -> Vec<RecordGuard<'_>> {
        let mut keys: Vec<_> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();
        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            guards.push(self.acquire(key).await);
        }
        guards
    }

    /// Keys currently locked or awaited.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Held lock on one record.
#[derive(Debug)]
pub struct RecordGuard<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    key: RecordKey,
    locks: &'a DashMap<RecordKey, Arc<Mutex<()>>>,
}

impl Drop for RecordGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let locks = Arc::new(RecordLocks::new());
        let key = RecordKey::new("Todo", "1");
        let guard = locks.acquire(&key).await;

        let waiter = {
            let locks = Arc::clone(&locks);
            let key = key.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire(&key).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let locks = RecordLocks::new();
        let _a = locks.acquire(&RecordKey::new("Todo", "1")).await;
        let b = tokio::time::timeout(
            Duration::from_secs(1),
            locks.acquire(&RecordKey::new("Todo", "2")),
        )
        .await;
        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn acquire_all_dedups() {
        let locks = RecordLocks::new();
        let key = RecordKey::new("Todo", "1");
        let guards = locks.acquire_all(vec![key.clone(), key]).await;
        assert_eq!(guards.len(), 1);
    }
}
