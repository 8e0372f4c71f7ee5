//! Atomic key/value storage.
//!
//! Compare-and-swap is the only mutation path used for shared state. Every
//! backend must be linearizable per key so the layers above stay
//! backend-agnostic.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::{marker::PhantomData, sync::Arc};
use thiserror::Error;

pub mod memory;
pub mod sqlite;

pub use memory::MemStorage;
pub use sqlite::SqliteStorage;

#[derive(Error, Debug)]
pub enum StorageError {
    /// Backend could not be reached or is busy. Retryable.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    /// Stored value could not be decoded. Not retryable.
    #[error("corrupted value at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

#[async_trait]
pub trait AtomicStorage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Unconditional overwrite. Only used to initialize state.
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Writes `new` only if the current value equals `expected`, where `None`
    /// means the key must be absent. Returns whether the swap happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: &[u8],
    ) -> Result<bool, StorageError>;

    /// Removes the key only if its current value equals `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool, StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// Places every key of the inner storage under a fixed prefix.
#[derive(Clone)]
pub struct PrefixedStorage {
    inner: Arc<dyn AtomicStorage>,
    prefix: String,
}

impl PrefixedStorage {
    pub fn new(inner: Arc<dyn AtomicStorage>, prefix: impl Into<String>) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl AtomicStorage for PrefixedStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.inner.get(&self.key(key)).await
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.inner.put(&self.key(key), value).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: &[u8],
    ) -> Result<bool, StorageError> {
        self.inner.compare_and_swap(&self.key(key), expected, new).await
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool, StorageError> {
        self.inner.compare_and_delete(&self.key(key), expected).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.delete(&self.key(key)).await
    }
}

/// A decoded value together with the exact bytes it was decoded from.
#[derive(Clone, Debug)]
pub struct Versioned<T> {
    pub value: T,
    pub raw: Vec<u8>,
}

/// JSON-encoded view over an [`AtomicStorage`].
pub struct TypedStorage<T> {
    inner: Arc<dyn AtomicStorage>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for TypedStorage<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Serialize + DeserializeOwned> TypedStorage<T> {
    pub fn new(inner: Arc<dyn AtomicStorage>) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Versioned<T>>, StorageError> {
        let Some(raw) = self.inner.get(key).await? else {
            return Ok(None);
        };
        let value = serde_json::from_slice(&raw).map_err(|e| StorageError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Some(Versioned { value, raw }))
    }

    pub async fn put(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let bytes = encode(key, value)?;
        self.inner.put(key, &bytes).await
    }

    /// Swaps in `new` if the stored bytes are still `expected.raw`.
    pub async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&Versioned<T>>,
        new: &T,
    ) -> Result<bool, StorageError> {
        let bytes = encode(key, new)?;
        self.inner
            .compare_and_swap(key, expected.map(|v| v.raw.as_slice()), &bytes)
            .await
    }
}

fn encode<T: Serialize>(key: &str, value: &T) -> Result<Vec<u8>, StorageError> {
    serde_json::to_vec(value).map_err(|e| StorageError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Counter {
        value: u64,
    }

    #[tokio::test]
    async fn test_prefixed_storage_isolates_namespace() {
        let base: Arc<dyn AtomicStorage> = Arc::new(MemStorage::new());
        let locks = PrefixedStorage::new(base.clone(), "/lock/");

        locks.put("a", b"held").await.unwrap();
        assert_eq!(base.get("/lock/a").await.unwrap(), Some(b"held".to_vec()));
        assert_eq!(base.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_typed_storage_cas_uses_read_bytes() {
        let base: Arc<dyn AtomicStorage> = Arc::new(MemStorage::new());
        let typed = TypedStorage::<Counter>::new(base);

        assert!(typed
            .compare_and_swap("c", None, &Counter { value: 1 })
            .await
            .unwrap());
        let first = typed.get("c").await.unwrap().unwrap();
        assert!(typed
            .compare_and_swap("c", Some(&first), &Counter { value: 2 })
            .await
            .unwrap());
        // The first snapshot is stale now.
        assert!(!typed
            .compare_and_swap("c", Some(&first), &Counter { value: 3 })
            .await
            .unwrap());
        assert_eq!(typed.get("c").await.unwrap().unwrap().value.value, 2);
    }

    #[tokio::test]
    async fn test_typed_storage_reports_corruption() {
        let base: Arc<dyn AtomicStorage> = Arc::new(MemStorage::new());
        base.put("c", b"not json").await.unwrap();
        let typed = TypedStorage::<Counter>::new(base);

        let err = typed.get("c").await.unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { key, .. } if key == "c"));
    }
}
