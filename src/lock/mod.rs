//! Per-key mutual exclusion.
//!
//! [`StorageLocker`] coordinates every process sharing one [`AtomicStorage`];
//! [`LocalLocker`] is enough for a single replica.

use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;

use crate::storage::{AtomicStorage, StorageError};

pub mod local;
pub mod storage;

pub use local::LocalLocker;
pub use storage::StorageLocker;

#[derive(Error, Debug)]
pub enum LockError {
    #[error("lock on {key} not acquired after {attempts} attempts")]
    Timeout { key: String, attempts: u32 },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Retry budget for lock acquisition.
#[derive(Clone, Debug)]
pub struct LockSettings {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// How long a stored lock stays valid if its holder never releases it.
    pub lease: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            max_attempts: 50,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(100),
            lease: Duration::from_secs(30),
        }
    }
}

impl LockSettings {
    /// Upper bound on the total time spent backing off for one lock, jitter
    /// included.
    pub fn wait_bound(&self) -> Duration {
        (self.max_backoff + self.max_backoff / 2).saturating_mul(self.max_attempts.max(1))
    }
}

#[async_trait]
pub trait Locker: Send + Sync {
    /// Attempts a single [`Locker::lock`] call makes before giving up.
    fn attempt_budget(&self) -> u32;

    async fn lock(&self, key: &str) -> Result<LockGuard, LockError>;
}

pub(crate) enum Release {
    Local(OwnedMutexGuard<()>),
    Stored {
        storage: Arc<dyn AtomicStorage>,
        key: String,
        record: Vec<u8>,
    },
}

/// Exclusive ownership of one key.
///
/// Call [`LockGuard::unlock`] to release. A guard dropped while still held
/// (for instance because the call owning it was cancelled) releases itself in
/// the background.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    key: String,
    release: Option<Release>,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("held", &self.release.is_some())
            .finish()
    }
}

impl LockGuard {
    pub(crate) fn new(key: impl Into<String>, release: Release) -> Self {
        Self {
            key: key.into(),
            release: Some(release),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn unlock(mut self) -> Result<(), StorageError> {
        match self.release.take() {
            Some(release) => release_now(&self.key, release).await,
            None => Ok(()),
        }
    }
}

async fn release_now(key: &str, release: Release) -> Result<(), StorageError> {
    match release {
        Release::Local(guard) => {
            drop(guard);
            Ok(())
        }
        Release::Stored {
            storage,
            key: stored_key,
            record,
        } => {
            if !storage.compare_and_delete(&stored_key, &record).await? {
                // The lease expired and someone else took the lock over.
                tracing::warn!(key = %key, "lock was no longer held at release");
            }
            Ok(())
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(release) = self.release.take() else {
            return;
        };
        if matches!(release, Release::Local(_)) {
            return;
        }
        let key = std::mem::take(&mut self.key);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::debug!(key = %key, "releasing abandoned lock");
                handle.spawn(async move {
                    if let Err(e) = release_now(&key, release).await {
                        tracing::warn!(key = %key, error = %e, "failed to release abandoned lock");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    key = %key,
                    "no runtime to release lock, leaving it to lease expiry"
                );
            }
        }
    }
}
