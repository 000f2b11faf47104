//! Keys, key metadata and wrapped edge material.

use serde::{Deserialize, Serialize};
use std::fmt;

use consent_kernel_core::KeyId;

use crate::crypto::{hkdf_derive, PrivateKey, SymKey, X25519PublicKey};
use crate::envelope::EncryptedPayload;
use crate::error::{PermsError, Result};
use crate::sealed::SealedBox;

/// HKDF info used to derive a key's log key.
pub const LOG_KEY_INFO: &[u8] = b"log";

/// The kind of key a node in the access graph holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyType {
    /// An X25519 private key.
    #[serde(rename = "priv")]
    Private,
    /// An X25519 public key. Never used as an edge target.
    #[serde(rename = "pub")]
    Public,
    /// A ChaCha20-Poly1305 symmetric key.
    #[serde(rename = "sym")]
    Sym,
}

impl KeyType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            KeyType::Private => "priv",
            KeyType::Public => "pub",
            KeyType::Sym => "sym",
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for KeyType {
    type Err = PermsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "priv" | "private" => Ok(KeyType::Private),
            "pub" | "public" => Ok(KeyType::Public),
            "sym" => Ok(KeyType::Sym),
            other => Err(PermsError::InvalidKey(format!("unknown key type {other}"))),
        }
    }
}

/// Secret material of a key.
#[derive(Clone)]
pub enum KeyMaterial {
    Private(PrivateKey),
    Sym(SymKey),
}

/// A key node with its secret material.
#[derive(Clone)]
pub struct Key {
    id: KeyId,
    material: KeyMaterial,
}

impl Key {
    /// A private key node.
    pub fn private(id: KeyId, secret: PrivateKey) -> Self {
        Self {
            id,
            material: KeyMaterial::Private(secret),
        }
    }

    /// A symmetric key node.
    pub fn sym(id: KeyId, key: SymKey) -> Self {
        Self {
            id,
            material: KeyMaterial::Sym(key),
        }
    }

    /// A fresh random private key.
    pub fn generate_private(id: KeyId) -> Self {
        Self::private(id, PrivateKey::generate())
    }

    /// A fresh random symmetric key.
    pub fn generate_sym(id: KeyId) -> Self {
        Self::sym(id, SymKey::generate())
    }

    /// Rebuild a key from its type and raw bytes.
    pub fn from_bytes(id: KeyId, key_type: KeyType, bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| {
            PermsError::InvalidKey(format!("{id}: expected 32 bytes, got {}", bytes.len()))
        })?;
        match key_type {
            KeyType::Private => Ok(Self::private(id, PrivateKey::from_bytes(bytes))),
            KeyType::Sym => Ok(Self::sym(id, SymKey::from_bytes(bytes))),
            KeyType::Public => Err(PermsError::InvalidKey(format!(
                "{id}: a public key carries no secret material"
            ))),
        }
    }

    pub fn id(&self) -> &KeyId {
        &self.id
    }

    pub fn key_type(&self) -> KeyType {
        match self.material {
            KeyMaterial::Private(_) => KeyType::Private,
            KeyMaterial::Sym(_) => KeyType::Sym,
        }
    }

    pub fn material(&self) -> &KeyMaterial {
        &self.material
    }

    /// Raw secret bytes.
    pub fn to_bytes(&self) -> [u8; 32] {
        match &self.material {
            KeyMaterial::Private(secret) => secret.to_bytes(),
            KeyMaterial::Sym(key) => *key.as_bytes(),
        }
    }

    /// The public half, for private keys.
    pub fn public_key(&self) -> Option<X25519PublicKey> {
        match &self.material {
            KeyMaterial::Private(secret) => Some(secret.public_key()),
            KeyMaterial::Sym(_) => None,
        }
    }

    /// The symmetric key, or an error for private keys.
    pub fn as_sym(&self) -> Result<&SymKey> {
        match &self.material {
            KeyMaterial::Sym(key) => Ok(key),
            KeyMaterial::Private(_) => Err(PermsError::InvalidKey(format!(
                "{} is not a symmetric key",
                self.id
            ))),
        }
    }

    /// Derive a symmetric child key with HKDF under `info`.
    pub fn derive_sym(&self, id: KeyId, info: &[u8]) -> Result<Key> {
        let bytes = hkdf_derive(&self.to_bytes(), info)?;
        Ok(Key::sym(id, SymKey::from_bytes(bytes)))
    }

    /// The log key derived from this key.
    pub fn log_key(&self) -> Result<Key> {
        self.derive_sym(self.id.log_of(), LOG_KEY_INFO)
    }

    /// Public metadata for this key.
    pub fn info(&self) -> KeyInfo {
        KeyInfo {
            id: self.id.clone(),
            key_type: self.key_type(),
            public: self.public_key(),
        }
    }

    /// Encrypt `plaintext` so that only this key can read it.
    ///
    /// Symmetric keys encrypt directly; private keys seal to their own
    /// public half.
    pub fn encrypt(&self, plaintext: &[u8], context: &[u8]) -> Result<Ciphertext> {
        self.info().encrypt_with(Some(self), plaintext, context)
    }

    /// Decrypt something produced by [`Key::encrypt`] or
    /// [`KeyInfo::encrypt`].
    pub fn decrypt(&self, ciphertext: &Ciphertext, context: &[u8]) -> Result<Vec<u8>> {
        match (ciphertext, &self.material) {
            (Ciphertext::Symmetric(payload), KeyMaterial::Sym(key)) => payload.decrypt(key),
            (Ciphertext::Sealed(sealed), KeyMaterial::Private(secret)) => sealed.open(secret, context),
            _ => Err(PermsError::DecryptionError(format!(
                "ciphertext does not match key type of {}",
                self.id
            ))),
        }
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("id", &self.id)
            .field("type", &self.key_type())
            .finish()
    }
}

/// Public metadata about a key node, persisted at `keyinfo:{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    pub id: KeyId,
    pub key_type: KeyType,
    /// The X25519 public key, present for private keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public: Option<X25519PublicKey>,
}

impl KeyInfo {
    /// Encrypt `plaintext` for this key without holding its material.
    ///
    /// Only possible for private keys, which are sealed to.
    pub fn encrypt(&self, plaintext: &[u8], context: &[u8]) -> Result<Ciphertext> {
        self.encrypt_with(None, plaintext, context)
    }

    fn encrypt_with(&self, key: Option<&Key>, plaintext: &[u8], context: &[u8]) -> Result<Ciphertext> {
        match (self.key_type, &self.public, key.map(Key::material)) {
            (KeyType::Sym, _, Some(KeyMaterial::Sym(sym))) => {
                Ok(Ciphertext::Symmetric(EncryptedPayload::encrypt(plaintext, sym)?))
            }
            (KeyType::Private, Some(public), _) => {
                Ok(Ciphertext::Sealed(SealedBox::seal(plaintext, public, context)?))
            }
            _ => Err(PermsError::InvalidKey(format!(
                "cannot encrypt for {} ({}) without its material",
                self.id, self.key_type
            ))),
        }
    }

    /// Serialize to CBOR bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| PermsError::SerializationError(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize from CBOR bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ciborium::from_reader(bytes).map_err(|e| PermsError::SerializationError(e.to_string()))
    }
}

/// Bytes encrypted so that only one key node can read them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ciphertext {
    /// Encrypted directly under a symmetric key.
    Symmetric(EncryptedPayload),
    /// Sealed to the public half of a private key.
    Sealed(SealedBox),
}

/// The wrapped form of an edge target, stored at `edge:{src}:{dst}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    /// Type of the destination key.
    pub key_type: KeyType,
    /// Destination key bytes, encrypted for the source key.
    pub ciphertext: Ciphertext,
}

impl WrappedKey {
    /// Serialize to CBOR bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| PermsError::SerializationError(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize from CBOR bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ciborium::from_reader(bytes).map_err(|e| PermsError::SerializationError(e.to_string()))
    }
}

/// Context bytes binding a wrapped key to its edge.
pub fn edge_context(src: &KeyId, dst: &KeyId) -> Vec<u8> {
    format!("edge:{src}:{dst}").into_bytes()
}

/// The source of a new edge.
///
/// An edge out of a symmetric key needs the key itself. An edge out of a
/// private key only needs its public metadata.
#[derive(Debug, Clone, Copy)]
pub enum EdgeSource<'a> {
    Key(&'a Key),
    Info(&'a KeyInfo),
}

impl<'a> EdgeSource<'a> {
    pub fn id(&self) -> &'a KeyId {
        match self {
            EdgeSource::Key(key) => key.id(),
            EdgeSource::Info(info) => &info.id,
        }
    }

    /// Wrap `dst` so that this source can unwrap it.
    pub fn wrap(&self, dst: &Key) -> Result<WrappedKey> {
        let context = edge_context(self.id(), dst.id());
        let secret = dst.to_bytes();
        let ciphertext = match self {
            EdgeSource::Key(key) => key.encrypt(&secret, &context)?,
            EdgeSource::Info(info) => info.encrypt(&secret, &context)?,
        };
        Ok(WrappedKey {
            key_type: dst.key_type(),
            ciphertext,
        })
    }
}

impl<'a> From<&'a Key> for EdgeSource<'a> {
    fn from(key: &'a Key) -> Self {
        EdgeSource::Key(key)
    }
}

impl<'a> From<&'a KeyInfo> for EdgeSource<'a> {
    fn from(info: &'a KeyInfo) -> Self {
        EdgeSource::Info(info)
    }
}

/// Unwrap the target of edge `src -> dst` using the source key.
pub fn unwrap_edge(src: &Key, dst: &KeyId, wrapped: &WrappedKey) -> Result<Key> {
    let context = edge_context(src.id(), dst);
    let bytes = src.decrypt(&wrapped.ciphertext, &context)?;
    Key::from_bytes(dst.clone(), wrapped.key_type, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> KeyId {
        KeyId::new(s).unwrap()
    }

    #[test]
    fn test_key_type_serde_names() {
        assert_eq!(serde_json::to_string(&KeyType::Private).unwrap(), "\"priv\"");
        assert_eq!("sym".parse::<KeyType>().unwrap(), KeyType::Sym);
        assert!("nope".parse::<KeyType>().is_err());
    }

    #[test]
    fn test_from_bytes_rejects_public_and_bad_length() {
        assert!(Key::from_bytes(id("k"), KeyType::Public, &[0; 32]).is_err());
        assert!(Key::from_bytes(id("k"), KeyType::Sym, &[0; 31]).is_err());
        let key = Key::from_bytes(id("k"), KeyType::Sym, &[5; 32]).unwrap();
        assert_eq!(key.to_bytes(), [5; 32]);
    }

    #[test]
    fn test_log_key_is_deterministic() {
        let key = Key::sym(id("svc-sym"), SymKey::from_bytes([1; 32]));
        let a = key.log_key().unwrap();
        let b = key.log_key().unwrap();
        assert_eq!(a.id().as_str(), "svc-sym.log");
        assert_eq!(a.to_bytes(), b.to_bytes());
        assert_ne!(a.to_bytes(), key.to_bytes());
    }

    #[test]
    fn test_wrap_sym_to_sym() {
        let src = Key::generate_sym(id("a"));
        let dst = Key::generate_sym(id("b"));
        let wrapped = EdgeSource::from(&src).wrap(&dst).unwrap();
        let out = unwrap_edge(&src, dst.id(), &wrapped).unwrap();
        assert_eq!(out.to_bytes(), dst.to_bytes());
        assert_eq!(out.key_type(), KeyType::Sym);
    }

    #[test]
    fn test_wrap_to_private_via_info() {
        let owner = Key::generate_private(id("p1-priv"));
        let info = owner.info();
        let dst = Key::generate_private(id("c1"));

        let wrapped = EdgeSource::from(&info).wrap(&dst).unwrap();
        let out = unwrap_edge(&owner, dst.id(), &wrapped).unwrap();
        assert_eq!(out.public_key(), dst.public_key());
    }

    #[test]
    fn test_sym_info_cannot_wrap() {
        let key = Key::generate_sym(id("s"));
        let info = key.info();
        let dst = Key::generate_sym(id("d"));
        assert!(EdgeSource::from(&info).wrap(&dst).is_err());
    }

    #[test]
    fn test_unwrap_under_other_edge_fails() {
        let src = Key::generate_sym(id("a"));
        let dst = Key::generate_sym(id("b"));
        let wrapped = EdgeSource::from(&src).wrap(&dst).unwrap();
        let owner = Key::generate_private(id("p"));
        assert!(unwrap_edge(&owner, dst.id(), &wrapped).is_err());
    }

    #[test]
    fn test_key_info_bytes_roundtrip() {
        let info = Key::generate_private(id("u1-priv")).info();
        let back = KeyInfo::from_bytes(&info.to_bytes().unwrap()).unwrap();
        assert_eq!(info, back);
    }
}
