//! Asset store facade.
//!
//! An asset has a public half (canonical JSON, plaintext) and an optional
//! private half encrypted under the asset's symmetric key. The private
//! half is kept inline, or in the blob store when the asset's connection
//! is configured as off-chain; then the ledger keeps only the connection,
//! a handle derived from the asset id and a hash of the ciphertext.

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use consent_kernel_core::{canonical_json, derive_id, ContentHash, KeyId, Namespace};
use consent_kernel_perms::{EdgeSource, EncryptedPayload, Key};
use consent_kernel_store::{layout, StoreError};

use crate::context::{Ctx, PendingBlob};
use crate::error::{KernelError, Result};

/// Where an asset's private half lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrivatePayload {
    Inline(EncryptedPayload),
    OffChain {
        connection: String,
        handle: String,
        /// Hex BLAKE3 of the encrypted payload bytes.
        hash: String,
    },
}

/// The stored form of an asset, persisted at `asset:{ns}:{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRecord {
    pub namespace: Namespace,
    pub id: String,
    /// Canonical JSON text.
    pub public: String,
    pub private: Option<PrivatePayload>,
    pub datatypes: Vec<String>,
    pub key_id: Option<KeyId>,
}

impl AssetRecord {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| KernelError::Invariant(format!("asset encoding: {e}")))?;
        Ok(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ciborium::from_reader(bytes).map_err(|e| KernelError::corrupt("asset record", e))
    }

    /// Decode the public half.
    pub fn public_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.public)
            .map_err(|e| KernelError::corrupt(format_args!("{}/{}", self.namespace, self.id), e))
    }

    pub fn public_value(&self) -> Result<Value> {
        self.public_as()
    }
}

/// An asset as returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetView {
    pub namespace: Namespace,
    pub id: String,
    pub public: Value,
    /// Present only when the caller holds the asset key.
    #[serde(default)]
    pub private: Option<Value>,
    pub datatypes: Vec<String>,
    pub key_id: Option<KeyId>,
    /// The private half lives off-chain and could not be fetched.
    #[serde(default)]
    pub offchain_unavailable: bool,
}

/// Arguments of [`Ctx::put_asset`].
pub struct AssetWrite<'k> {
    pub namespace: Namespace,
    pub id: String,
    pub public: Value,
    pub private: Option<Value>,
    pub datatypes: Vec<String>,
    pub key: Option<&'k Key>,
    /// Connection whose blob store holds the private half, if configured.
    pub connection: Option<String>,
}

impl<'k> AssetWrite<'k> {
    pub fn new(namespace: Namespace, id: impl Into<String>, public: &impl Serialize) -> Result<Self> {
        Ok(Self {
            namespace,
            id: id.into(),
            public: serde_json::to_value(public)?,
            private: None,
            datatypes: Vec::new(),
            key: None,
            connection: None,
        })
    }

    pub fn private(mut self, private: &impl Serialize, key: &'k Key) -> Result<Self> {
        self.private = Some(serde_json::to_value(private)?);
        self.key = Some(key);
        Ok(self)
    }

    pub fn datatypes(mut self, datatypes: Vec<String>) -> Self {
        self.datatypes = datatypes;
        self
    }

    pub fn connection(mut self, connection: Option<String>) -> Self {
        self.connection = connection;
        self
    }
}

/// Blob handle for an asset; every replica derives the same one.
pub fn blob_handle(ns: Namespace, id: &str) -> String {
    derive_id("blob-handle", &[ns.as_str(), id])
}

impl<'a> Ctx<'a> {
    /// Encrypt and store an asset, linking `parents` to its key.
    pub async fn put_asset(&mut self, write: AssetWrite<'_>, parents: &[EdgeSource<'_>]) -> Result<()> {
        let key_id = write.key.map(|k| k.id().clone());
        let private = match (&write.private, write.key) {
            (Some(value), Some(key)) => {
                let plaintext = canonical_json(value)?;
                let payload = EncryptedPayload::encrypt(plaintext.as_bytes(), key.as_sym()?)?;
                Some(self.place_private(write.namespace, &write.id, payload, write.connection.as_deref())?)
            }
            (Some(_), None) => {
                return Err(KernelError::Invariant(format!(
                    "private half of {}/{} without a key",
                    write.namespace, write.id
                )))
            }
            (None, _) => None,
        };

        let record = AssetRecord {
            namespace: write.namespace,
            id: write.id.clone(),
            public: canonical_json(&write.public)?,
            private,
            datatypes: write.datatypes,
            key_id,
        };
        self.tx
            .put(layout::asset_key(record.namespace, &record.id), record.to_bytes()?);

        if let Some(key) = write.key {
            for parent in parents {
                self.link(*parent, key).await?;
            }
        }

        debug!(namespace = %record.namespace, asset = %record.id, "asset stored");
        Ok(())
    }

    fn place_private(
        &mut self,
        ns: Namespace,
        id: &str,
        payload: EncryptedPayload,
        connection: Option<&str>,
    ) -> Result<PrivatePayload> {
        match connection {
            Some(connection) if self.config.is_offchain(connection) => {
                let bytes = payload
                    .to_bytes()
                    .map_err(|e| KernelError::Invariant(e.to_string()))?;
                let handle = blob_handle(ns, id);
                let hash = ContentHash::of(&bytes).to_string();
                self.pending_blobs.retain(|b| !(b.connection == connection && b.handle == handle));
                self.pending_blobs.push(PendingBlob {
                    connection: connection.to_string(),
                    handle: handle.clone(),
                    bytes: Bytes::from(bytes),
                });
                Ok(PrivatePayload::OffChain {
                    connection: connection.to_string(),
                    handle,
                    hash,
                })
            }
            _ => Ok(PrivatePayload::Inline(payload)),
        }
    }

    /// Read the stored record.
    pub async fn get_record(&mut self, ns: Namespace, id: &str) -> Result<Option<AssetRecord>> {
        match self.tx.get(&layout::asset_key(ns, id)).await? {
            Some(bytes) => Ok(Some(AssetRecord::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn require_record(&mut self, ns: Namespace, id: &str) -> Result<AssetRecord> {
        self.get_record(ns, id)
            .await?
            .ok_or_else(|| KernelError::NotFound(format!("{ns}/{id}")))
    }

    pub async fn asset_exists(&mut self, ns: Namespace, id: &str) -> Result<bool> {
        Ok(self.tx.exists(&layout::asset_key(ns, id)).await?)
    }

    pub fn delete_asset(&mut self, ns: Namespace, id: &str) {
        self.tx.delete(layout::asset_key(ns, id));
    }

    /// Public half plus, if `key` is supplied, the decrypted private half.
    pub async fn read_asset(&mut self, record: &AssetRecord, key: Option<&Key>) -> Result<AssetView> {
        let mut view = AssetView {
            namespace: record.namespace,
            id: record.id.clone(),
            public: record.public_value()?,
            private: None,
            datatypes: record.datatypes.clone(),
            key_id: record.key_id.clone(),
            offchain_unavailable: false,
        };

        let (Some(key), Some(private)) = (key, &record.private) else {
            return Ok(view);
        };
        if record.key_id.as_ref() != Some(key.id()) {
            return Err(KernelError::Invariant(format!(
                "{}/{} is not encrypted under {}",
                record.namespace,
                record.id,
                key.id()
            )));
        }

        let payload = match private {
            PrivatePayload::Inline(payload) => payload.clone(),
            PrivatePayload::OffChain {
                connection,
                handle,
                hash,
            } => match self.fetch_blob(connection, handle, hash).await {
                Ok(payload) => payload,
                Err(KernelError::OffchainUnavailable(conn)) => {
                    warn!(asset = %record.id, connection = %conn, "private half unavailable");
                    view.offchain_unavailable = true;
                    return Ok(view);
                }
                Err(e) => return Err(e),
            },
        };

        let plaintext = payload.decrypt(key.as_sym()?)?;
        view.private = Some(
            serde_json::from_slice(&plaintext)
                .map_err(|e| KernelError::corrupt(format_args!("{}/{} private", record.namespace, record.id), e))?,
        );
        Ok(view)
    }

    /// Decrypt the private half into a typed value.
    pub async fn read_private<T: DeserializeOwned>(&mut self, record: &AssetRecord, key: &Key) -> Result<Option<T>> {
        let view = self.read_asset(record, Some(key)).await?;
        match view.private {
            Some(value) => Ok(Some(serde_json::from_value(value).map_err(|e| {
                KernelError::corrupt(format_args!("{}/{} private", record.namespace, record.id), e)
            })?)),
            None if view.offchain_unavailable => Err(KernelError::OffchainUnavailable(format!(
                "{}/{}",
                record.namespace, record.id
            ))),
            None => Ok(None),
        }
    }

    async fn fetch_blob(&mut self, connection: &str, handle: &str, hash: &str) -> Result<EncryptedPayload> {
        let pending = self
            .pending_blobs
            .iter()
            .find(|b| b.connection == connection && b.handle == handle)
            .map(|b| b.bytes.clone());
        let bytes = match pending {
            Some(bytes) => bytes,
            None => self.blobs.get_blob(connection, handle).await.map_err(|e| match e {
                StoreError::BlobUnavailable(c) => KernelError::OffchainUnavailable(c),
                StoreError::NotFound(what) => KernelError::Invariant(format!("missing blob {what}")),
                other => KernelError::Store(other),
            })?,
        };
        let expected: ContentHash = hash
            .parse()
            .map_err(|e| KernelError::Invariant(format!("blob {connection}/{handle}: {e}")))?;
        if !expected.matches(&bytes) {
            return Err(KernelError::Invariant(format!(
                "blob {connection}/{handle} does not match its hash"
            )));
        }
        EncryptedPayload::from_bytes(&bytes).map_err(|e| KernelError::corrupt("blob", e))
    }

    /// The asset key, if the caller can derive it.
    pub async fn asset_key(&mut self, record: &AssetRecord) -> Result<Option<Key>> {
        match &record.key_id {
            Some(key_id) => self.derive_from_caller(key_id).await,
            None => Ok(None),
        }
    }

    /// Read an asset as the caller: private half iff a key path exists.
    pub async fn get_asset(&mut self, ns: Namespace, id: &str) -> Result<AssetView> {
        let record = self.require_record(ns, id).await?;
        let key = self.asset_key(&record).await?;
        self.read_asset(&record, key.as_ref()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use consent_kernel_core::TxMeta;
    use consent_kernel_perms::PrivateKey;
    use consent_kernel_store::{MemoryBlobStore, MemorySubstrate, Substrate, Transaction};
    use serde_json::json;

    use crate::config::KernelConfig;
    use crate::principal::Principal;

    fn caller() -> Principal {
        Principal::new("p1", PrivateKey::from_bytes([1; 32])).unwrap()
    }

    fn ctx<'a>(
        substrate: &'a dyn Substrate,
        blobs: &'a MemoryBlobStore,
        config: &'a KernelConfig,
        caller: &'a Principal,
    ) -> Ctx<'a> {
        Ctx::new(Transaction::begin(substrate, TxMeta::new("tx1", 100)), blobs, config, caller)
    }

    #[tokio::test]
    async fn test_put_and_read_inline() {
        let substrate = MemorySubstrate::new();
        let blobs = MemoryBlobStore::new();
        let config = KernelConfig::default();
        let caller = caller();
        let mut ctx = ctx(&substrate, &blobs, &config, &caller);

        let key = Key::generate_sym(KeyId::new("k1").unwrap());
        let write = AssetWrite::new(Namespace::OwnerData, "a1", &json!({"b": 1, "a": 2}))
            .unwrap()
            .private(&json!({"secret": true}), &key)
            .unwrap();
        ctx.put_asset(write, &[]).await.unwrap();

        let record = ctx.require_record(Namespace::OwnerData, "a1").await.unwrap();
        assert_eq!(record.public, r#"{"a":2,"b":1}"#);

        let public_only = ctx.read_asset(&record, None).await.unwrap();
        assert!(public_only.private.is_none());

        let full = ctx.read_asset(&record, Some(&key)).await.unwrap();
        assert_eq!(full.private, Some(json!({"secret": true})));
    }

    #[tokio::test]
    async fn test_read_with_wrong_key_is_invariant_violation() {
        let substrate = MemorySubstrate::new();
        let blobs = MemoryBlobStore::new();
        let config = KernelConfig::default();
        let caller = caller();
        let mut ctx = ctx(&substrate, &blobs, &config, &caller);

        let key = Key::generate_sym(KeyId::new("k1").unwrap());
        let other = Key::generate_sym(KeyId::new("k2").unwrap());
        let write = AssetWrite::new(Namespace::OwnerData, "a1", &json!({}))
            .unwrap()
            .private(&json!(1), &key)
            .unwrap();
        ctx.put_asset(write, &[]).await.unwrap();

        let record = ctx.require_record(Namespace::OwnerData, "a1").await.unwrap();
        let err = ctx.read_asset(&record, Some(&other)).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvariantViolation);
    }

    #[tokio::test]
    async fn test_offchain_payload_and_outage() {
        let substrate = MemorySubstrate::new();
        let blobs = MemoryBlobStore::new();
        let config = KernelConfig {
            offchain_connections: vec!["bucket".into()],
            ..KernelConfig::default()
        };
        let caller = caller();
        let key = Key::generate_sym(KeyId::new("k1").unwrap());

        let mut ctx = ctx(&substrate, &blobs, &config, &caller);
        let write = AssetWrite::new(Namespace::UserData, "a1", &json!({"owner": "p1"}))
            .unwrap()
            .private(&json!({"hr": 61}), &key)
            .unwrap()
            .connection(Some("bucket".into()));
        ctx.put_asset(write, &[]).await.unwrap();

        // Read-your-writes before commit.
        let record = ctx.require_record(Namespace::UserData, "a1").await.unwrap();
        assert!(matches!(record.private, Some(PrivatePayload::OffChain { .. })));
        let view = ctx.read_asset(&record, Some(&key)).await.unwrap();
        assert_eq!(view.private, Some(json!({"hr": 61})));
        ctx.commit().await.unwrap();
        assert_eq!(blobs.len().unwrap(), 1);

        blobs.set_online("bucket", false).unwrap();
        let mut ctx = Ctx::new(
            Transaction::begin(&substrate, TxMeta::new("tx2", 101)),
            &blobs,
            &config,
            &caller,
        );
        let record = ctx.require_record(Namespace::UserData, "a1").await.unwrap();
        let view = ctx.read_asset(&record, Some(&key)).await.unwrap();
        assert!(view.offchain_unavailable);
        assert!(view.private.is_none());
        assert_eq!(view.public, json!({"owner": "p1"}));
    }

    #[tokio::test]
    async fn test_aborted_transaction_writes_no_blob() {
        let substrate = MemorySubstrate::new();
        let blobs = MemoryBlobStore::new();
        let config = KernelConfig {
            offchain_connections: vec!["bucket".into()],
            ..KernelConfig::default()
        };
        let caller = caller();
        let key = Key::generate_sym(KeyId::new("k1").unwrap());

        let mut ctx = ctx(&substrate, &blobs, &config, &caller);
        let write = AssetWrite::new(Namespace::UserData, "a1", &json!({}))
            .unwrap()
            .private(&json!(1), &key)
            .unwrap()
            .connection(Some("bucket".into()));
        ctx.put_asset(write, &[]).await.unwrap();
        let _ = ctx.abort("test");

        assert!(blobs.is_empty().unwrap());
        assert!(substrate.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_parents_get_edges() {
        let substrate = MemorySubstrate::new();
        let blobs = MemoryBlobStore::new();
        let config = KernelConfig::default();
        let caller = caller();
        let mut ctx = ctx(&substrate, &blobs, &config, &caller);

        let key = Key::generate_sym(KeyId::new("k1").unwrap());
        let write = AssetWrite::new(Namespace::OwnerData, "a1", &json!({}))
            .unwrap()
            .private(&json!("x"), &key)
            .unwrap();
        let caller_key = caller.key().clone();
        ctx.put_asset(write, &[EdgeSource::Key(&caller_key)]).await.unwrap();

        let view = ctx.get_asset(Namespace::OwnerData, "a1").await.unwrap();
        assert_eq!(view.private, Some(json!("x")));
    }
}
