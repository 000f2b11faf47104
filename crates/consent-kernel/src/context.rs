//! Per-invocation context.
//!
//! A [`Ctx`] bundles the open transaction, the blob store, the
//! configuration and the immutable caller. Every engine operation is a
//! method on `Ctx`; the graph reads and writes its edges through the
//! same transaction, so one invocation commits or discards as a unit.

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};

use consent_kernel_core::KeyId;
use consent_kernel_perms::{
    EdgeSource, EdgeStore, Key, KeyGraph, KeyInfo, PermsError, WrappedKey,
};
use consent_kernel_store::{layout, BlobStore, StoreError, Transaction};

use crate::config::KernelConfig;
use crate::error::{KernelError, Result};
use crate::principal::{priv_key_id, sym_key_id, Principal};

/// A blob write deferred until the transaction commits.
pub(crate) struct PendingBlob {
    pub connection: String,
    pub handle: String,
    pub bytes: Bytes,
}

async fn discard_blobs(blobs: &dyn BlobStore, written: &[PendingBlob]) {
    for blob in written {
        if let Err(e) = blobs.delete_blob(&blob.connection, &blob.handle).await {
            warn!(connection = %blob.connection, handle = %blob.handle, error = %e, "orphaned blob left behind");
        }
    }
}

/// Everything one invocation may touch.
pub struct Ctx<'a> {
    pub(crate) tx: Transaction<'a>,
    pub(crate) blobs: &'a dyn BlobStore,
    pub(crate) config: &'a KernelConfig,
    caller: &'a Principal,
    graph: KeyGraph,
    pub(crate) logged: bool,
    pub(crate) pending_blobs: Vec<PendingBlob>,
}

impl<'a> Ctx<'a> {
    pub fn new(
        tx: Transaction<'a>,
        blobs: &'a dyn BlobStore,
        config: &'a KernelConfig,
        caller: &'a Principal,
    ) -> Self {
        Self {
            tx,
            blobs,
            config,
            caller,
            graph: KeyGraph::new(),
            logged: false,
            pending_blobs: Vec::new(),
        }
    }

    /// The real caller.
    pub fn caller(&self) -> &'a Principal {
        self.caller
    }

    /// Substrate time for this transaction.
    pub fn now(&self) -> i64 {
        self.tx.tx_timestamp()
    }

    pub fn tx_id(&self) -> &str {
        self.tx.tx_id()
    }

    pub fn config(&self) -> &'a KernelConfig {
        self.config
    }

    /// Flush deferred blobs, then commit the transaction.
    ///
    /// When a blob write or the commit fails, the blobs already written are
    /// deleted again so nothing off-chain outlives the discarded writes.
    pub async fn commit(self) -> Result<usize> {
        let Ctx {
            tx,
            blobs,
            pending_blobs,
            ..
        } = self;
        for (written, blob) in pending_blobs.iter().enumerate() {
            if let Err(e) = blobs
                .put_blob(&blob.connection, &blob.handle, blob.bytes.clone())
                .await
            {
                discard_blobs(blobs, &pending_blobs[..written]).await;
                return Err(match e {
                    StoreError::BlobUnavailable(c) => KernelError::OffchainUnavailable(c),
                    other => KernelError::Store(other),
                });
            }
        }
        match tx.commit().await {
            Ok(count) => Ok(count),
            Err(e) => {
                discard_blobs(blobs, &pending_blobs).await;
                Err(e.into())
            }
        }
    }

    /// Discard every buffered write.
    pub fn abort(self, reason: impl Into<String>) -> StoreError {
        self.tx.abort(reason)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Key graph
    // ─────────────────────────────────────────────────────────────────────────

    /// Derive `to` from `root`, or `None` when no path exists.
    pub(crate) async fn derive(&mut self, root: &Key, to: &KeyId) -> Result<Option<Key>> {
        let graph = self.graph;
        Ok(graph.derive(self, root, to).await?)
    }

    /// Derive `to` from the real caller's private key.
    pub(crate) async fn derive_from_caller(&mut self, to: &KeyId) -> Result<Option<Key>> {
        let caller = self.caller;
        self.derive(caller.key(), to).await
    }

    /// Derive `to` from `root`, failing with `no-access` if unreachable.
    pub(crate) async fn require_key(&mut self, root: &Key, to: &KeyId) -> Result<Key> {
        self.derive(root, to)
            .await?
            .ok_or_else(|| KernelError::NoAccess(format!("no key path from {} to {to}", root.id())))
    }

    pub(crate) async fn reachable(&mut self, root: &KeyId, to: &KeyId) -> Result<bool> {
        let graph = self.graph;
        Ok(graph.reachable(self, root, to).await?)
    }

    /// Store `dst` wrapped for `src`. Idempotent.
    pub(crate) async fn link(&mut self, src: EdgeSource<'_>, dst: &Key) -> Result<bool> {
        let graph = self.graph;
        Ok(graph.add_edge(self, src, dst).await?)
    }

    /// Link from a private key known only by id, sealing to its public key.
    pub(crate) async fn link_sealed(&mut self, src: &KeyId, dst: &Key) -> Result<bool> {
        let info = self.key_info(src).await?;
        self.link(EdgeSource::Info(&info), dst).await
    }

    pub(crate) async fn unlink(&mut self, src: &KeyId, dst: &KeyId) -> Result<bool> {
        let graph = self.graph;
        Ok(graph.remove_edge(self, src, dst).await?)
    }

    /// Public metadata for a key, `not-found` if never stored.
    pub(crate) async fn key_info(&mut self, id: &KeyId) -> Result<KeyInfo> {
        self.get_key_info(id)
            .await?
            .ok_or_else(|| KernelError::NotFound(format!("key {id}")))
    }

    /// Fail with `bad-state` if a key with this id already exists.
    pub(crate) async fn ensure_fresh_key(&mut self, key: &Key) -> Result<()> {
        if self.get_key_info(key.id()).await?.is_some() {
            return Err(KernelError::BadState(format!("key id {} already in use", key.id())));
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Effective caller
    // ─────────────────────────────────────────────────────────────────────────

    /// Act as `principal`: the caller itself, or a group whose private key
    /// the caller can derive (org admin, service admin).
    pub(crate) async fn effective_caller(&mut self, principal: &str) -> Result<Principal> {
        self.try_effective_caller(principal).await?.ok_or_else(|| {
            KernelError::NoAccess(format!(
                "{} cannot act as {principal}",
                self.caller.id()
            ))
        })
    }

    pub(crate) async fn try_effective_caller(&mut self, principal: &str) -> Result<Option<Principal>> {
        if self.caller.id() == principal {
            return Ok(Some(self.caller.clone()));
        }
        let target = priv_key_id(principal)?;
        match self.derive_from_caller(&target).await? {
            Some(key) => {
                debug!(caller = %self.caller.id(), effective = %principal, "caller substituted");
                Ok(Some(Principal::from_key(principal, key)?))
            }
            None => Ok(None),
        }
    }

    /// The symmetric key of `principal`, reached from its private key.
    pub(crate) async fn principal_sym(&mut self, principal: &Principal) -> Result<Key> {
        let id = sym_key_id(principal.id())?;
        self.derive(principal.key(), &id)
            .await?
            .ok_or_else(|| KernelError::Invariant(format!("{} has no symmetric key", principal.id())))
    }
}

fn storage(e: StoreError) -> PermsError {
    PermsError::Storage(e.to_string())
}

#[async_trait]
impl<'a> EdgeStore for Ctx<'a> {
    async fn get_edge(&mut self, src: &KeyId, dst: &KeyId) -> consent_kernel_perms::Result<Option<WrappedKey>> {
        match self.tx.get(&layout::edge_key(src, dst)).await.map_err(storage)? {
            Some(bytes) => Ok(Some(WrappedKey::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn put_edge(&mut self, src: &KeyId, dst: &KeyId, wrapped: &WrappedKey) -> consent_kernel_perms::Result<()> {
        self.tx.put(layout::edge_key(src, dst), wrapped.to_bytes()?);
        Ok(())
    }

    async fn delete_edge(&mut self, src: &KeyId, dst: &KeyId) -> consent_kernel_perms::Result<()> {
        self.tx.delete(layout::edge_key(src, dst));
        Ok(())
    }

    async fn out_edges(&mut self, src: &KeyId) -> consent_kernel_perms::Result<Vec<KeyId>> {
        let (start, end) = layout::prefix_range(&layout::edge_prefix(src));
        let rows = self.tx.range_query(&start, &end).await.map_err(storage)?;
        rows.into_iter()
            .map(|(key, _)| layout::parse_edge_key(&key).map(|(_, dst)| dst).map_err(storage))
            .collect()
    }

    async fn get_key_info(&mut self, id: &KeyId) -> consent_kernel_perms::Result<Option<KeyInfo>> {
        match self.tx.get(&layout::key_info_key(id)).await.map_err(storage)? {
            Some(bytes) => Ok(Some(KeyInfo::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn put_key_info(&mut self, info: &KeyInfo) -> consent_kernel_perms::Result<()> {
        self.tx.put(layout::key_info_key(&info.id), info.to_bytes()?);
        Ok(())
    }
}
