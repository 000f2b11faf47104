//! The Kernel: one transaction per invocation.
//!
//! The Kernel owns the substrate, the blob store and the configuration.
//! Each invocation opens a transaction stub, runs the call against a fresh
//! [`Ctx`], and commits on success. On error every buffered write is
//! discarded, edges and logs included.

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info_span, warn, Instrument};

use consent_kernel_core::TxMeta;
use consent_kernel_store::{
    BlobStore, MemoryBlobStore, MemorySubstrate, SqliteBlobStore, SqliteSubstrate, Substrate,
    Transaction,
};

use crate::call::Call;
use crate::config::KernelConfig;
use crate::context::Ctx;
use crate::error::Result;
use crate::principal::Principal;

/// The main Kernel struct.
pub struct Kernel<S: Substrate, B: BlobStore> {
    /// World state.
    substrate: Arc<S>,
    /// Off-chain private payloads.
    blobs: Arc<B>,
    config: KernelConfig,
}

impl Kernel<MemorySubstrate, MemoryBlobStore> {
    /// A kernel over in-memory storage.
    pub fn in_memory(config: KernelConfig) -> Result<Self> {
        Self::new(MemorySubstrate::new(), MemoryBlobStore::new(), config)
    }
}

impl Kernel<SqliteSubstrate, SqliteBlobStore> {
    /// A kernel over a SQLite file; blobs share the same database.
    pub fn open_sqlite(path: impl AsRef<Path>, config: KernelConfig) -> Result<Self> {
        let substrate = SqliteSubstrate::open(path)?;
        let blobs = substrate.blob_store();
        Self::new(substrate, blobs, config)
    }
}

impl<S: Substrate, B: BlobStore> Kernel<S, B> {
    pub fn new(substrate: S, blobs: B, config: KernelConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            substrate: Arc::new(substrate),
            blobs: Arc::new(blobs),
            config,
        })
    }

    pub fn substrate(&self) -> &S {
        &self.substrate
    }

    pub fn blob_store(&self) -> &B {
        &self.blobs
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Invocation
    // ─────────────────────────────────────────────────────────────────────────

    /// Run `call` as `caller` in the transaction described by `meta`.
    pub async fn execute(&self, caller: &Principal, meta: TxMeta, call: Call) -> Result<Value> {
        let span = info_span!(
            "invoke",
            function = call.name(),
            tx_id = %meta.tx_id,
            caller = %caller.id()
        );
        async move {
            let tx = Transaction::begin(self.substrate.as_ref(), meta);
            let mut ctx = Ctx::new(tx, self.blobs.as_ref(), &self.config, caller);
            match ctx.execute(call).await {
                Ok(value) => {
                    let writes = ctx.commit().await?;
                    debug!(writes, "committed");
                    Ok(value)
                }
                Err(e) => {
                    ctx.abort(e.to_string());
                    warn!(code = %e.code(), error = %e, "invocation aborted");
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Parse and run `function(args...)`, returning JSON text.
    pub async fn invoke(
        &self,
        caller: &Principal,
        meta: TxMeta,
        function: &str,
        args: &[String],
    ) -> Result<String> {
        let call = Call::parse(function, args).map_err(|e| {
            warn!(function, tx_id = %meta.tx_id, error = %e, "rejected invocation");
            e
        })?;
        let value = self.execute(caller, meta, call).await?;
        Ok(serde_json::to_string(&value)?)
    }
}
