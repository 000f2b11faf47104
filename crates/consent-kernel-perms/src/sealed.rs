//! Sealing to a public key via X25519 key agreement.
//!
//! An edge whose source is a private key is sealed to the matching public
//! key, so anyone can add an edge out of a principal's private key while
//! only the principal can walk it.

use serde::{Deserialize, Serialize};

use crate::crypto::{PrivateKey, X25519PublicKey};
use crate::envelope::EncryptedPayload;
use crate::error::{PermsError, Result};

/// A payload sealed to a recipient's X25519 public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBox {
    /// Ephemeral X25519 public key (sender's side of ECDH).
    pub ephemeral_public: X25519PublicKey,

    /// The plaintext, encrypted with the derived shared secret.
    pub payload: EncryptedPayload,
}

impl SealedBox {
    /// Seal `plaintext` for `recipient`.
    ///
    /// The ephemeral secret is derived from the recipient, the context and
    /// the plaintext, so sealing is reproducible across endorsers.
    ///
    /// # Arguments
    /// * `plaintext` - The bytes to seal (e.g., a wrapped key)
    /// * `recipient` - Recipient's X25519 public key
    /// * `context` - Domain-separation bytes, also needed to open
    pub fn seal(plaintext: &[u8], recipient: &X25519PublicKey, context: &[u8]) -> Result<Self> {
        let ephemeral = ephemeral_secret(plaintext, recipient, context);
        let ephemeral_public = ephemeral.public_key();

        let wrap_key = ephemeral.agree(recipient, &wrap_context(context, &ephemeral_public));

        let payload = EncryptedPayload::encrypt(plaintext, &wrap_key)?;

        Ok(Self {
            ephemeral_public,
            payload,
        })
    }

    /// Open the box using the recipient's secret key.
    pub fn open(&self, recipient: &PrivateKey, context: &[u8]) -> Result<Vec<u8>> {
        let wrap_key = recipient.agree(&self.ephemeral_public, &wrap_context(context, &self.ephemeral_public));
        self.payload.decrypt(&wrap_key)
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

fn ephemeral_secret(plaintext: &[u8], recipient: &X25519PublicKey, context: &[u8]) -> PrivateKey {
    let mut hasher = blake3::Hasher::new_derive_key("consent-kernel-v0-seal-ephemeral");
    hasher.update(recipient.as_bytes());
    hasher.update(&(context.len() as u64).to_be_bytes());
    hasher.update(context);
    hasher.update(plaintext);
    PrivateKey::from_bytes(*hasher.finalize().as_bytes())
}

fn wrap_context(context: &[u8], ephemeral_public: &X25519PublicKey) -> Vec<u8> {
    let mut out = Vec::with_capacity(context.len() + 32);
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(context);
    out
}
