//! Substrate and blob store traits.
//!
//! These traits keep the engine storage-agnostic. Implementations include
//! SQLite (primary) and in-memory (for tests).

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// A single buffered write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put(Vec<u8>),
    Delete,
}

/// An ordered set of writes applied atomically by [`Substrate::commit`].
///
/// Later writes to the same key replace earlier ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: BTreeMap<String, WriteOp>,
}

impl WriteBatch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a put.
    pub fn put(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.ops.insert(key.into(), WriteOp::Put(value));
    }

    /// Record a delete.
    pub fn delete(&mut self, key: impl Into<String>) {
        self.ops.insert(key.into(), WriteOp::Delete);
    }

    /// Look up the pending write for a key.
    pub fn get(&self, key: &str) -> Option<&WriteOp> {
        self.ops.get(key)
    }

    /// Pending writes with `start <= key < end`, in key order.
    pub fn range<'a>(
        &'a self,
        start: &str,
        end: &str,
    ) -> impl Iterator<Item = (&'a String, &'a WriteOp)> + 'a {
        // BTreeMap::range panics on inverted bounds
        let end = if end < start { start } else { end };
        self.ops
            .range::<str, _>((
                std::ops::Bound::Included(start),
                std::ops::Bound::Excluded(end),
            ))
    }

    /// Iterate over all writes in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &WriteOp)> {
        self.ops.iter()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

impl IntoIterator for WriteBatch {
    type Item = (String, WriteOp);
    type IntoIter = std::collections::btree_map::IntoIter<String, WriteOp>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.into_iter()
    }
}

/// The substrate: the ledger's world state as seen by the engine.
///
/// Endorsement and ordering happen outside this trait. Implementations
/// must return range results sorted by key bytes, since every ordering
/// decision the engine makes is derived from that order.
#[async_trait]
pub trait Substrate: Send + Sync {
    /// Read a single key.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Read all keys with `start <= key < end`, sorted.
    async fn range(&self, start: &str, end: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Apply a batch of writes atomically.
    async fn commit(&self, batch: WriteBatch) -> Result<()>;
}

/// Off-chain storage for private payloads.
///
/// Blobs are addressed by a connection id (which backing store) and a
/// blob id (derived from the asset id, so every replica agrees).
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store a blob, replacing any previous value.
    async fn put_blob(&self, connection: &str, id: &str, bytes: Bytes) -> Result<()>;

    /// Fetch a blob.
    ///
    /// Returns `BlobUnavailable` when the connection cannot be reached and
    /// `NotFound` when it can but holds no such blob.
    async fn get_blob(&self, connection: &str, id: &str) -> Result<Bytes>;

    /// Delete a blob. Deleting a missing blob is not an error.
    async fn delete_blob(&self, connection: &str, id: &str) -> Result<()>;
}
