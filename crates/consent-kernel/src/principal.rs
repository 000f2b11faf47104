//! Principals and client-supplied key material.
//!
//! Every user, org and service owns a private key `{id}-priv` and a
//! symmetric key `{id}-sym`. A [`Principal`] is an identity together with
//! its unlocked private key; it never changes during a transaction.

use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use serde::{Deserialize, Serialize};
use std::fmt;

use consent_kernel_core::{derive_id, KeyId};
use consent_kernel_perms::{Key, KeyType, PrivateKey, X25519PublicKey};

use crate::error::{KernelError, Result};

/// Id of a principal's private key.
pub fn priv_key_id(principal: &str) -> Result<KeyId> {
    Ok(KeyId::new(format!("{principal}-priv"))?)
}

/// Id of a principal's symmetric key.
pub fn sym_key_id(principal: &str) -> Result<KeyId> {
    Ok(KeyId::new(format!("{principal}-sym"))?)
}

/// Id of the per-(owner, datatype) channel key.
pub fn datatype_key_id(owner: &str, datatype: &str) -> Result<KeyId> {
    let digest = derive_id("datatype-key", &[owner, datatype]);
    Ok(KeyId::new(format!("dt-{}", &digest[..32]))?)
}

/// An identity with its unlocked private key.
#[derive(Clone)]
pub struct Principal {
    id: String,
    key: Key,
}

impl Principal {
    pub fn new(id: impl Into<String>, secret: PrivateKey) -> Result<Self> {
        let id = id.into();
        validate_id(&id)?;
        let key = Key::private(priv_key_id(&id)?, secret);
        Ok(Self { id, key })
    }

    /// Wrap an already-derived private key.
    pub(crate) fn from_key(id: impl Into<String>, key: Key) -> Result<Self> {
        let id = id.into();
        if key.key_type() != KeyType::Private || key.id() != &priv_key_id(&id)? {
            return Err(KernelError::Invariant(format!(
                "{} is not the private key of {id}",
                key.id()
            )));
        }
        Ok(Self { id, key })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The private key node.
    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn public_key(&self) -> Result<X25519PublicKey> {
        self.key
            .public_key()
            .ok_or_else(|| KernelError::Invariant(format!("{} has no public key", self.id)))
    }

    pub fn sym_key_id(&self) -> Result<KeyId> {
        sym_key_id(&self.id)
    }
}

impl fmt::Debug for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Principal").field("id", &self.id).finish()
    }
}

/// Identifiers of principals and assets become part of key ids and
/// substrate keys.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(KernelError::BadInput("empty id".into()));
    }
    if id.chars().any(|c| c == ':' || c == '\u{0}' || c.is_whitespace() || c.is_control()) {
        return Err(KernelError::BadInput(format!("invalid id {id:?}")));
    }
    if id.ends_with(consent_kernel_core::LOG_KEY_SUFFIX) {
        return Err(KernelError::BadInput(format!("id {id:?} uses a reserved suffix")));
    }
    Ok(())
}

/// Raw 32 key bytes, base64 (URL-safe) on the wire.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretBytes(pub String);

impl SecretBytes {
    pub fn encode(bytes: &[u8]) -> Self {
        Self(URL_SAFE.encode(bytes))
    }

    pub fn decode(&self) -> Result<Vec<u8>> {
        URL_SAFE
            .decode(self.0.as_bytes())
            .map_err(|e| KernelError::BadInput(format!("bad base64 key: {e}")))
    }

    pub fn to_private(&self) -> Result<PrivateKey> {
        let bytes: [u8; 32] = self
            .decode()?
            .try_into()
            .map_err(|_| KernelError::BadInput("private key must be 32 bytes".into()))?;
        Ok(PrivateKey::from_bytes(bytes))
    }
}

impl fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretBytes(..)")
    }
}

/// A fresh symmetric key supplied by the client for a new asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySpec {
    pub id: String,
    pub bytes: SecretBytes,
}

impl KeySpec {
    pub fn new(id: impl Into<String>, key: &Key) -> Self {
        Self {
            id: id.into(),
            bytes: SecretBytes::encode(&key.to_bytes()),
        }
    }

    /// Build the symmetric key this spec describes.
    pub fn to_key(&self) -> Result<Key> {
        validate_id(&self.id)?;
        if self.id.ends_with("-priv") || self.id.ends_with("-sym") || self.id.starts_with("dt-") {
            return Err(KernelError::BadInput(format!(
                "key id {:?} is reserved for principal and datatype keys",
                self.id
            )));
        }
        let id = KeyId::new(self.id.clone())?;
        Ok(Key::from_bytes(id, KeyType::Sym, &self.bytes.decode()?)?)
    }
}

impl From<&Key> for KeySpec {
    fn from(key: &Key) -> Self {
        KeySpec::new(key.id().as_str(), key)
    }
}
