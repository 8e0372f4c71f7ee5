use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::{path::Path, sync::Arc, time::Duration};

use super::{AtomicStorage, StorageError};

const BUSY_TIMEOUT: Duration = Duration::from_secs(2);

/// Storage shared by every replica that opens the same database file.
///
/// Each CAS is a single conditional statement, so SQLite's write lock makes
/// it atomic across processes.
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(map_err)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory().map_err(map_err)?)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        conn.busy_timeout(BUSY_TIMEOUT).map_err(map_err)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL
            );",
        )
        .map_err(map_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Folds the write-ahead log back into the database file.
    pub async fn checkpoint(&self) -> Result<(), StorageError> {
        self.run(|conn| conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);"))
            .await
    }

    async fn run<F, R>(&self, op: F) -> Result<R, StorageError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            op(&conn).map_err(map_err)
        })
        .await
        .map_err(|e| StorageError::Unavailable(format!("storage task failed: {e}")))?
    }
}

fn map_err(e: rusqlite::Error) -> StorageError {
    if let rusqlite::Error::SqliteFailure(ref err, _) = e {
        if err.code == ErrorCode::DatabaseCorrupt || err.code == ErrorCode::NotADatabase {
            return StorageError::Corrupt {
                key: "*".to_string(),
                reason: e.to_string(),
            };
        }
    }
    StorageError::Unavailable(e.to_string())
}

#[async_trait]
impl AtomicStorage for SqliteStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let key = key.to_string();
        self.run(move |conn| {
            conn.query_row("SELECT value FROM kv WHERE key = ?1", [&key], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()
        })
        .await
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let key = key.to_string();
        let value = value.to_vec();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .map(|_| ())
        })
        .await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: &[u8],
    ) -> Result<bool, StorageError> {
        let key = key.to_string();
        let expected = expected.map(<[u8]>::to_vec);
        let new = new.to_vec();
        self.run(move |conn| {
            let changed = match expected {
                None => conn.execute(
                    "INSERT OR IGNORE INTO kv (key, value) VALUES (?1, ?2)",
                    params![key, new],
                )?,
                Some(expected) => conn.execute(
                    "UPDATE kv SET value = ?3 WHERE key = ?1 AND value = ?2",
                    params![key, expected, new],
                )?,
            };
            Ok(changed == 1)
        })
        .await
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool, StorageError> {
        let key = key.to_string();
        let expected = expected.to_vec();
        self.run(move |conn| {
            conn.execute(
                "DELETE FROM kv WHERE key = ?1 AND value = ?2",
                params![key, expected],
            )
            .map(|changed| changed == 1)
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let key = key.to_string();
        self.run(move |conn| conn.execute("DELETE FROM kv WHERE key = ?1", [&key]).map(|_| ()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sqlite_cas_semantics() {
        let storage = SqliteStorage::open_in_memory().unwrap();

        assert!(storage.compare_and_swap("k", None, b"v1").await.unwrap());
        assert!(!storage.compare_and_swap("k", None, b"v2").await.unwrap());
        assert!(!storage
            .compare_and_swap("k", Some(b"stale"), b"v2")
            .await
            .unwrap());
        assert!(storage
            .compare_and_swap("k", Some(b"v1"), b"v2")
            .await
            .unwrap());
        assert_eq!(storage.get("k").await.unwrap(), Some(b"v2".to_vec()));
    }

    #[tokio::test]
    async fn test_sqlite_delete_paths() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage.put("k", b"v").await.unwrap();

        assert!(!storage.compare_and_delete("k", b"x").await.unwrap());
        assert!(storage.compare_and_delete("k", b"v").await.unwrap());
        storage.put("k", b"v").await.unwrap();
        storage.delete("k").await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sqlite_shared_between_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("paygate.db");

        // Two handles on one file behave like two replicas.
        let a = SqliteStorage::open(&path).unwrap();
        let b = SqliteStorage::open(&path).unwrap();

        assert!(a.compare_and_swap("k", None, b"from-a").await.unwrap());
        assert!(!b.compare_and_swap("k", None, b"from-b").await.unwrap());
        assert_eq!(b.get("k").await.unwrap(), Some(b"from-a".to_vec()));
    }
}
