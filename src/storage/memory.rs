use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};

use super::{AtomicStorage, StorageError};

/// In-process storage for a single replica. Fast but lost on restart.
#[derive(Default)]
pub struct MemStorage {
    entries: DashMap<String, Vec<u8>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl AtomicStorage for MemStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: &[u8],
    ) -> Result<bool, StorageError> {
        // The entry holds the shard lock, so compare and write are atomic.
        match (self.entries.entry(key.to_string()), expected) {
            (Entry::Vacant(v), None) => {
                v.insert(new.to_vec());
                Ok(true)
            }
            (Entry::Occupied(mut o), Some(expected)) if o.get().as_slice() == expected => {
                o.insert(new.to_vec());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool, StorageError> {
        Ok(self
            .entries
            .remove_if(key, |_, current| current.as_slice() == expected)
            .is_some())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.entries.remove(key);
        Ok(())
    }
}
