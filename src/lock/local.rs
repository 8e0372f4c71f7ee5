use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{LockError, LockGuard, LockSettings, Locker, Release};

/// Native mutex per key. Only valid when a single process owns the storage.
#[derive(Default)]
pub struct LocalLocker {
    mutexes: DashMap<String, Arc<Mutex<()>>>,
    settings: LockSettings,
}

impl LocalLocker {
    pub fn new(settings: LockSettings) -> Self {
        Self {
            mutexes: DashMap::new(),
            settings,
        }
    }
}

#[async_trait]
impl Locker for LocalLocker {
    fn attempt_budget(&self) -> u32 {
        self.settings.max_attempts
    }

    async fn lock(&self, key: &str) -> Result<LockGuard, LockError> {
        let mutex = self
            .mutexes
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        match tokio::time::timeout(self.settings.wait_bound(), mutex.lock_owned()).await {
            Ok(guard) => Ok(LockGuard::new(key, Release::Local(guard))),
            Err(_) => Err(LockError::Timeout {
                key: key.to_string(),
                attempts: self.settings.max_attempts,
            }),
        }
    }
}
