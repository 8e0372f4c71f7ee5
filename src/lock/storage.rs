use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::sync::oneshot;
use uuid::Uuid;

use super::{LockError, LockGuard, LockSettings, Locker, Release};
use crate::storage::{AtomicStorage, PrefixedStorage, StorageError};

pub const LOCK_PREFIX: &str = "/lock/";

#[derive(Clone, Debug, Serialize, Deserialize)]
struct LockRecord {
    token: String,
    expires_at_ms: u64,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Lock built from compare-and-swap on a reserved key namespace.
///
/// A lock record carries a random token and a lease deadline. Records past
/// their deadline belong to a holder that crashed and may be taken over.
pub struct StorageLocker {
    storage: Arc<dyn AtomicStorage>,
    settings: LockSettings,
}

impl StorageLocker {
    pub fn new(storage: Arc<dyn AtomicStorage>, settings: LockSettings) -> Self {
        Self {
            storage: Arc::new(PrefixedStorage::new(storage, LOCK_PREFIX)),
            settings,
        }
    }

    fn next_backoff(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.settings.max_backoff)
    }

    /// Writes a lock record from a task of its own.
    ///
    /// The backend may commit a swap even after the caller stopped waiting
    /// for it. If the caller is gone by then, the task deletes the record it
    /// wrote, so no lock outlives the call that asked for it.
    async fn detached_swap(
        &self,
        key: &str,
        expected: Option<Vec<u8>>,
        record: Vec<u8>,
    ) -> Result<bool, LockError> {
        let storage = self.storage.clone();
        let key = key.to_string();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let result = storage
                .compare_and_swap(&key, expected.as_deref(), &record)
                .await;
            if let Err(Ok(true)) = tx.send(result) {
                tracing::debug!(key = %key, "lock acquired after its caller left, releasing");
                if let Err(e) = storage.compare_and_delete(&key, &record).await {
                    tracing::warn!(
                        key = %key,
                        error = %e,
                        "failed to release orphaned lock, lease will expire"
                    );
                }
            }
        });

        match rx.await {
            Ok(result) => Ok(result?),
            Err(_) => Err(LockError::Storage(StorageError::Unavailable(
                "lock write task failed".to_string(),
            ))),
        }
    }
}

#[async_trait]
impl Locker for StorageLocker {
    fn attempt_budget(&self) -> u32 {
        self.settings.max_attempts
    }

    async fn lock(&self, key: &str) -> Result<LockGuard, LockError> {
        let token = Uuid::new_v4().to_string();
        let mut backoff = self.settings.initial_backoff;

        for attempt in 1..=self.settings.max_attempts {
            let now = now_ms();
            let lease_ms = u64::try_from(self.settings.lease.as_millis()).unwrap_or(u64::MAX);
            let record = LockRecord {
                token: token.clone(),
                expires_at_ms: now.saturating_add(lease_ms),
            };
            let bytes = serde_json::to_vec(&record).map_err(|e| {
                LockError::Storage(StorageError::Corrupt {
                    key: key.to_string(),
                    reason: e.to_string(),
                })
            })?;

            let acquired = match self.storage.get(key).await? {
                None => self.detached_swap(key, None, bytes.clone()).await?,
                Some(current) => match serde_json::from_slice::<LockRecord>(&current) {
                    Ok(held) if held.expires_at_ms > now => false,
                    Ok(held) => {
                        tracing::warn!(
                            key = %key,
                            stale_token = %held.token,
                            "taking over expired lock"
                        );
                        self.detached_swap(key, Some(current), bytes.clone()).await?
                    }
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "replacing unreadable lock record");
                        self.detached_swap(key, Some(current), bytes.clone()).await?
                    }
                },
            };

            if acquired {
                tracing::trace!(key = %key, attempt, "lock acquired");
                return Ok(LockGuard::new(
                    key,
                    Release::Stored {
                        storage: self.storage.clone(),
                        key: key.to_string(),
                        record: bytes,
                    },
                ));
            }

            if attempt < self.settings.max_attempts {
                let jitter_cap = u64::try_from(backoff.as_micros() / 2).unwrap_or(0).max(1);
                let jitter = Duration::from_micros(rand::thread_rng().gen_range(0..jitter_cap));
                tokio::time::sleep(backoff + jitter).await;
                backoff = self.next_backoff(backoff);
            }
        }

        tracing::debug!(
            key = %key,
            attempts = self.settings.max_attempts,
            "lock acquisition timed out"
        );
        Err(LockError::Timeout {
            key: key.to_string(),
            attempts: self.settings.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemStorage, SqliteStorage};

    fn settings(max_attempts: u32, lease: Duration) -> LockSettings {
        LockSettings {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            lease,
        }
    }

    #[tokio::test]
    async fn test_lock_record_lives_under_prefix() {
        let base: Arc<dyn AtomicStorage> = Arc::new(MemStorage::new());
        let locker = StorageLocker::new(base.clone(), settings(3, Duration::from_secs(5)));

        let guard = locker.lock("chan-1").await.unwrap();
        assert!(base.get("/lock/chan-1").await.unwrap().is_some());

        guard.unlock().await.unwrap();
        assert!(base.get("/lock/chan-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_contention_times_out() {
        let base: Arc<dyn AtomicStorage> = Arc::new(MemStorage::new());
        let a = StorageLocker::new(base.clone(), settings(3, Duration::from_secs(5)));
        let b = StorageLocker::new(base, settings(3, Duration::from_secs(5)));

        let _held = a.lock("chan").await.unwrap();
        let err = b.lock("chan").await.unwrap_err();
        assert!(matches!(err, LockError::Timeout { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let base: Arc<dyn AtomicStorage> = Arc::new(MemStorage::new());
        let crashed = StorageLocker::new(base.clone(), settings(3, Duration::from_millis(1)));
        let survivor = StorageLocker::new(base.clone(), settings(5, Duration::from_secs(5)));

        // Simulate a holder that never released.
        std::mem::forget(crashed.lock("chan").await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;

        let guard = survivor.lock("chan").await.unwrap();
        guard.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_release_does_not_clear_new_holder() {
        let base: Arc<dyn AtomicStorage> = Arc::new(MemStorage::new());
        let slow = StorageLocker::new(base.clone(), settings(3, Duration::from_millis(1)));
        let fast = StorageLocker::new(base.clone(), settings(5, Duration::from_secs(5)));

        let stale = slow.lock("chan").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let current = fast.lock("chan").await.unwrap();

        // The token no longer matches, so this must leave the new record alone.
        stale.unlock().await.unwrap();
        assert!(base.get("/lock/chan").await.unwrap().is_some());

        current.unlock().await.unwrap();
        assert!(base.get("/lock/chan").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_lock_record_is_replaced() {
        let base: Arc<dyn AtomicStorage> = Arc::new(MemStorage::new());
        base.put("/lock/chan", b"garbage").await.unwrap();
        let locker = StorageLocker::new(base, settings(2, Duration::from_secs(5)));

        assert!(locker.lock("chan").await.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_guard_releases_in_background() {
        let base: Arc<dyn AtomicStorage> = Arc::new(MemStorage::new());
        let locker = StorageLocker::new(base.clone(), settings(3, Duration::from_secs(5)));

        drop(locker.lock("chan").await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(base.get("/lock/chan").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancelled_acquisition_leaves_no_record() {
        let base: Arc<dyn AtomicStorage> = Arc::new(SqliteStorage::open_in_memory().unwrap());
        let locker = StorageLocker::new(base.clone(), settings(3, Duration::from_secs(30)));

        for i in 0..200u64 {
            let attempt =
                tokio::time::timeout(Duration::from_micros(i * 5), locker.lock("chan")).await;
            if let Ok(Ok(guard)) = attempt {
                guard.unlock().await.unwrap();
            }
        }

        // Give detached writes and background releases time to settle.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(base.get("/lock/chan").await.unwrap().is_none());
    }
}
