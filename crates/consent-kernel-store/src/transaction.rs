//! Cached-stub transaction over a substrate.
//!
//! Each invocation gets a private view of state: reads are memoised and
//! writes are buffered until [`Transaction::commit`]. Reads observe the
//! transaction's own pending writes. Dropping the transaction (or calling
//! [`Transaction::abort`]) discards every buffered write.

use std::collections::{BTreeMap, HashMap};

use consent_kernel_core::TxMeta;
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::traits::{Substrate, WriteBatch, WriteOp};

/// A single transaction against a [`Substrate`].
pub struct Transaction<'a> {
    substrate: &'a dyn Substrate,
    meta: TxMeta,
    /// Memoised substrate reads (`None` = known absent).
    cache: HashMap<String, Option<Vec<u8>>>,
    writes: WriteBatch,
}

impl<'a> Transaction<'a> {
    /// Open a transaction.
    pub fn begin(substrate: &'a dyn Substrate, meta: TxMeta) -> Self {
        Self {
            substrate,
            meta,
            cache: HashMap::new(),
            writes: WriteBatch::new(),
        }
    }

    /// Transaction id assigned by the substrate.
    pub fn tx_id(&self) -> &str {
        &self.meta.tx_id
    }

    /// Substrate timestamp for this transaction (Unix seconds).
    pub fn tx_timestamp(&self) -> i64 {
        self.meta.timestamp
    }

    pub fn meta(&self) -> &TxMeta {
        &self.meta
    }

    /// Read a key, observing pending writes first.
    pub async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.writes.get(key) {
            Some(WriteOp::Put(value)) => return Ok(Some(value.clone())),
            Some(WriteOp::Delete) => return Ok(None),
            None => {}
        }

        if let Some(cached) = self.cache.get(key) {
            return Ok(cached.clone());
        }

        let value = self.substrate.get(key).await?;
        self.cache.insert(key.to_string(), value.clone());
        Ok(value)
    }

    /// Whether a key currently holds a value.
    pub async fn exists(&mut self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Buffer a put.
    pub fn put(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.writes.put(key, value);
    }

    /// Buffer a delete.
    pub fn delete(&mut self, key: impl Into<String>) {
        self.writes.delete(key);
    }

    /// Read all keys with `start <= key < end`, merged with pending writes.
    ///
    /// Results are sorted by key.
    pub async fn range_query(&mut self, start: &str, end: &str) -> Result<Vec<(String, Vec<u8>)>> {
        if end <= start {
            return Ok(Vec::new());
        }

        let mut merged: BTreeMap<String, Vec<u8>> = self
            .substrate
            .range(start, end)
            .await?
            .into_iter()
            .collect();

        for (key, op) in self.writes.range(start, end) {
            match op {
                WriteOp::Put(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                WriteOp::Delete => {
                    merged.remove(key);
                }
            }
        }

        Ok(merged.into_iter().collect())
    }

    /// Read and increment a monotonic counter stored at `key`.
    ///
    /// Returns the new value; the first call yields 1.
    pub async fn increment_counter(&mut self, key: &str) -> Result<u64> {
        let current = match self.get(key).await? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StoreError::InvalidData(format!("counter {key} is corrupt")))?;
                u64::from_be_bytes(arr)
            }
            None => 0,
        };
        let next = current + 1;
        self.put(key, next.to_be_bytes().to_vec());
        Ok(next)
    }

    /// Number of buffered writes.
    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }

    /// Flush buffered writes to the substrate atomically.
    pub async fn commit(self) -> Result<usize> {
        let count = self.writes.len();
        if count > 0 {
            self.substrate.commit(self.writes).await?;
        }
        debug!(tx_id = %self.meta.tx_id, writes = count, "transaction committed");
        Ok(count)
    }

    /// Abort the transaction, discarding buffered writes.
    pub fn abort(self, reason: impl Into<String>) -> StoreError {
        let reason = reason.into();
        debug!(tx_id = %self.meta.tx_id, %reason, "transaction aborted");
        StoreError::Aborted(reason)
    }
}
