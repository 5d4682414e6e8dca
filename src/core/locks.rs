//! Per-transfer mutual exclusion.
//!
//! Prepare, send and poll for one transfer never overlap; different transfers
//! proceed independently. Locks live only in memory, so they serialize work
//! inside one process. Cross-process safety rests on the state-guarded
//! updates in `db::transfers`.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub type TransferGuard = OwnedMutexGuard<()>;

#[derive(Clone, Default)]
pub struct TransferLocks {
    inner: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl TransferLocks {
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, transfer_id: &str) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().await;
        // Drop locks nobody holds or waits on
        map.retain(|_, lock| Arc::strong_count(lock) > 1);
        map.entry(transfer_id.to_string()).or_default().clone()
    }

    /// Waits until the transfer is free.
    pub async fn acquire(&self, transfer_id: &str) -> TransferGuard {
        self.slot(transfer_id).await.lock_owned().await
    }

    /// Returns `None` when another operation holds the transfer.
    pub async fn try_acquire(&self, transfer_id: &str) -> Option<TransferGuard> {
        self.slot(transfer_id).await.try_lock_owned().ok()
    }

    /// Number of transfers currently locked or awaited.
    pub async fn held_count(&self) -> usize {
        let map = self.inner.lock().await;
        map.values().filter(|lock| Arc::strong_count(lock) > 1).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_transfer_is_exclusive() {
        let locks = TransferLocks::new();

        let guard = locks.acquire("t-1").await;
        assert!(locks.try_acquire("t-1").await.is_none());
        assert!(locks.try_acquire("t-2").await.is_some());
        assert_eq!(locks.held_count().await, 1);

        drop(guard);
        assert!(locks.try_acquire("t-1").await.is_some());
    }

    #[tokio::test]
    async fn waiter_proceeds_after_release() {
        let locks = TransferLocks::new();
        let guard = locks.acquire("t-1").await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire("t-1").await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(locks.held_count().await, 0);
    }
}
