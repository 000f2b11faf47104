//! In-memory implementations of the Substrate and BlobStore traits.
//!
//! These are primarily for testing. They have the same semantics as the
//! SQLite backends but keep everything in memory with no persistence.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{Result, StoreError};
use crate::traits::{BlobStore, Substrate, WriteBatch, WriteOp};

/// In-memory substrate.
///
/// All data is lost when the substrate is dropped. Thread-safe via RwLock.
#[derive(Default)]
pub struct MemorySubstrate {
    state: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemorySubstrate {
    /// Create a new empty substrate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> Result<usize> {
        Ok(self.state.read()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.state.read()?.is_empty())
    }

    /// All keys with the given prefix (for assertions in tests).
    pub fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let state = self.state.read()?;
        Ok(state
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl Substrate for MemorySubstrate {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let state = self.state.read()?;
        Ok(state.get(key).cloned())
    }

    async fn range(&self, start: &str, end: &str) -> Result<Vec<(String, Vec<u8>)>> {
        if end <= start {
            return Ok(Vec::new());
        }
        let state = self.state.read()?;
        Ok(state
            .range::<str, _>((
                std::ops::Bound::Included(start),
                std::ops::Bound::Excluded(end),
            ))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        let mut state = self.state.write()?;
        for (key, op) in batch {
            match op {
                WriteOp::Put(value) => {
                    state.insert(key, value);
                }
                WriteOp::Delete => {
                    state.remove(&key);
                }
            }
        }
        Ok(())
    }
}

/// In-memory blob store.
///
/// Connections can be taken offline to exercise the
/// `offchain-unavailable` path.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<(String, String), Bytes>>,
    offline: RwLock<BTreeSet<String>>,
}

impl MemoryBlobStore {
    /// Create a new empty blob store with every connection online.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a connection offline or bring it back.
    pub fn set_online(&self, connection: &str, online: bool) -> Result<()> {
        let mut offline = self.offline.write()?;
        if online {
            offline.remove(connection);
        } else {
            offline.insert(connection.to_string());
        }
        Ok(())
    }

    /// Number of stored blobs.
    pub fn len(&self) -> Result<usize> {
        Ok(self.blobs.read()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.blobs.read()?.is_empty())
    }

    fn ensure_online(&self, connection: &str) -> Result<()> {
        if self.offline.read()?.contains(connection) {
            return Err(StoreError::BlobUnavailable(connection.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put_blob(&self, connection: &str, id: &str, bytes: Bytes) -> Result<()> {
        self.ensure_online(connection)?;
        let mut blobs = self.blobs.write()?;
        blobs.insert((connection.to_string(), id.to_string()), bytes);
        Ok(())
    }

    async fn get_blob(&self, connection: &str, id: &str) -> Result<Bytes> {
        self.ensure_online(connection)?;
        let blobs = self.blobs.read()?;
        blobs
            .get(&(connection.to_string(), id.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("blob {connection}/{id}")))
    }

    async fn delete_blob(&self, connection: &str, id: &str) -> Result<()> {
        self.ensure_online(connection)?;
        let mut blobs = self.blobs.write()?;
        blobs.remove(&(connection.to_string(), id.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_substrate_basic() {
        let substrate = MemorySubstrate::new();
        let mut batch = WriteBatch::new();
        batch.put("asset:consent:1", b"one".to_vec());
        batch.put("asset:consent:2", b"two".to_vec());
        batch.put("asset:log:1", b"log".to_vec());
        substrate.commit(batch).await.unwrap();

        assert_eq!(
            substrate.get("asset:consent:1").await.unwrap(),
            Some(b"one".to_vec())
        );
        let consents = substrate
            .range("asset:consent:", "asset:consent;")
            .await
            .unwrap();
        assert_eq!(consents.len(), 2);
        assert_eq!(consents[0].0, "asset:consent:1");
    }

    #[tokio::test]
    async fn test_memory_substrate_delete() {
        let substrate = MemorySubstrate::new();
        let mut batch = WriteBatch::new();
        batch.put("k", b"v".to_vec());
        substrate.commit(batch).await.unwrap();

        let mut batch = WriteBatch::new();
        batch.delete("k");
        substrate.commit(batch).await.unwrap();
        assert!(substrate.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_blob_store_offline() {
        let blobs = MemoryBlobStore::new();
        blobs
            .put_blob("conn1", "b1", Bytes::from_static(b"payload"))
            .await
            .unwrap();
        assert_eq!(
            blobs.get_blob("conn1", "b1").await.unwrap(),
            Bytes::from_static(b"payload")
        );

        blobs.set_online("conn1", false).unwrap();
        assert!(matches!(
            blobs.get_blob("conn1", "b1").await,
            Err(StoreError::BlobUnavailable(_))
        ));

        blobs.set_online("conn1", true).unwrap();
        assert!(matches!(
            blobs.get_blob("conn1", "missing").await,
            Err(StoreError::NotFound(_))
        ));
    }
}
