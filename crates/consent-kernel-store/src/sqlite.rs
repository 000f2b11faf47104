//! SQLite implementations of the Substrate and BlobStore traits.
//!
//! This is the primary storage backend for the Consent Kernel. It uses
//! rusqlite with bundled SQLite, wrapped in async via tokio::spawn_blocking.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::{BlobStore, Substrate, WriteBatch, WriteOp};

/// Shared, migrated SQLite connection.
#[derive(Clone)]
struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool.
    async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock()?;
            f(&mut conn)
        })
        .await?
    }
}

/// SQLite-based substrate.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
#[derive(Clone)]
pub struct SqliteSubstrate {
    db: Db,
}

impl SqliteSubstrate {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self { db: Db::open(path)? })
    }

    /// Open an in-memory SQLite database.
    pub fn open_memory() -> Result<Self> {
        Ok(Self {
            db: Db::open_memory()?,
        })
    }

    /// A blob store sharing this substrate's database file.
    pub fn blob_store(&self) -> SqliteBlobStore {
        SqliteBlobStore {
            db: self.db.clone(),
        }
    }
}

#[async_trait]
impl Substrate for SqliteSubstrate {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let key = key.as_bytes().to_vec();
        self.db
            .run(move |conn| {
                let value = conn
                    .query_row(
                        "SELECT value FROM state WHERE key = ?1",
                        params![key],
                        |row| row.get::<_, Vec<u8>>(0),
                    )
                    .optional()?;
                Ok(value)
            })
            .await
    }

    async fn range(&self, start: &str, end: &str) -> Result<Vec<(String, Vec<u8>)>> {
        if end <= start {
            return Ok(Vec::new());
        }
        let start = start.as_bytes().to_vec();
        let end = end.as_bytes().to_vec();
        self.db
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT key, value FROM state WHERE key >= ?1 AND key < ?2 ORDER BY key",
                )?;
                let rows = stmt.query_map(params![start, end], |row| {
                    Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
                })?;

                let mut out = Vec::new();
                for row in rows {
                    let (key, value) = row?;
                    let key = String::from_utf8(key)
                        .map_err(|e| StoreError::InvalidData(e.to_string()))?;
                    out.push((key, value));
                }
                Ok(out)
            })
            .await
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        let count = batch.len();
        self.db
            .run(move |conn| {
                let tx = conn.transaction()?;
                for (key, op) in batch {
                    match op {
                        WriteOp::Put(value) => {
                            tx.execute(
                                "INSERT INTO state (key, value) VALUES (?1, ?2)
                                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                                params![key.as_bytes(), value],
                            )?;
                        }
                        WriteOp::Delete => {
                            tx.execute("DELETE FROM state WHERE key = ?1", params![key.as_bytes()])?;
                        }
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        debug!(writes = count, "sqlite batch committed");
        Ok(())
    }
}

/// SQLite-based blob store.
///
/// A connection id is just a partition of the `blobs` table here; a
/// deployment backed by remote stores maps it to a client instead.
#[derive(Clone)]
pub struct SqliteBlobStore {
    db: Db,
}

impl SqliteBlobStore {
    /// Open a blob store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self { db: Db::open(path)? })
    }

    /// Open an in-memory blob store.
    pub fn open_memory() -> Result<Self> {
        Ok(Self {
            db: Db::open_memory()?,
        })
    }
}

#[async_trait]
impl BlobStore for SqliteBlobStore {
    async fn put_blob(&self, connection: &str, id: &str, bytes: Bytes) -> Result<()> {
        let connection = connection.to_string();
        let id = id.to_string();
        self.db
            .run(move |conn| {
                conn.execute(
                    "INSERT INTO blobs (connection, blob_id, bytes) VALUES (?1, ?2, ?3)
                     ON CONFLICT(connection, blob_id) DO UPDATE SET bytes = excluded.bytes",
                    params![connection, id, bytes.as_ref()],
                )?;
                Ok(())
            })
            .await
    }

    async fn get_blob(&self, connection: &str, id: &str) -> Result<Bytes> {
        let connection = connection.to_string();
        let id = id.to_string();
        self.db
            .run(move |conn| {
                let bytes: Option<Vec<u8>> = conn
                    .query_row(
                        "SELECT bytes FROM blobs WHERE connection = ?1 AND blob_id = ?2",
                        params![connection, id],
                        |row| row.get(0),
                    )
                    .optional()?;
                bytes
                    .map(Bytes::from)
                    .ok_or_else(|| StoreError::NotFound(format!("blob {connection}/{id}")))
            })
            .await
    }

    async fn delete_blob(&self, connection: &str, id: &str) -> Result<()> {
        let connection = connection.to_string();
        let id = id.to_string();
        self.db
            .run(move |conn| {
                conn.execute(
                    "DELETE FROM blobs WHERE connection = ?1 AND blob_id = ?2",
                    params![connection, id],
                )?;
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_sqlite_substrate_basic() {
        let substrate = SqliteSubstrate::open_memory().unwrap();

        let mut batch = WriteBatch::new();
        batch.put("edge:a:b", b"ab".to_vec());
        batch.put("edge:a:c", b"ac".to_vec());
        batch.put("edge:b:c", b"bc".to_vec());
        substrate.commit(batch).await.unwrap();

        assert_eq!(
            substrate.get("edge:a:b").await.unwrap(),
            Some(b"ab".to_vec())
        );
        let out = substrate.range("edge:a:", "edge:a;").await.unwrap();
        let keys: Vec<_> = out.into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["edge:a:b", "edge:a:c"]);
    }

    #[tokio::test]
    async fn test_sqlite_keys_with_nul_sort_bytewise() {
        let substrate = SqliteSubstrate::open_memory().unwrap();
        let mut batch = WriteBatch::new();
        batch.put("idx:n:p1\u{0}b", vec![2]);
        batch.put("idx:n:p1\u{0}a", vec![1]);
        batch.put("idx:n:p10\u{0}a", vec![3]);
        substrate.commit(batch).await.unwrap();

        let out = substrate
            .range("idx:n:p1\u{0}", "idx:n:p1\u{0}\u{10FFFF}")
            .await
            .unwrap();
        let values: Vec<_> = out.into_iter().map(|(_, v)| v[0]).collect();
        assert_eq!(values, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_sqlite_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.db");

        {
            let substrate = SqliteSubstrate::open(&path).unwrap();
            let mut batch = WriteBatch::new();
            batch.put("counter:x", 7u64.to_be_bytes().to_vec());
            substrate.commit(batch).await.unwrap();
        }

        let substrate = SqliteSubstrate::open(&path).unwrap();
        assert_eq!(
            substrate.get("counter:x").await.unwrap(),
            Some(7u64.to_be_bytes().to_vec())
        );
    }

    #[tokio::test]
    async fn test_sqlite_blob_store() {
        let substrate = SqliteSubstrate::open_memory().unwrap();
        let blobs = substrate.blob_store();

        blobs
            .put_blob("conn", "b1", Bytes::from_static(b"cipher"))
            .await
            .unwrap();
        assert_eq!(
            blobs.get_blob("conn", "b1").await.unwrap(),
            Bytes::from_static(b"cipher")
        );

        blobs.delete_blob("conn", "b1").await.unwrap();
        assert!(matches!(
            blobs.get_blob("conn", "b1").await,
            Err(StoreError::NotFound(_))
        ));
    }
}
