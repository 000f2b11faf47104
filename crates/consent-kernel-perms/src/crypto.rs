//! Key types and the primitives behind them: X25519 agreement,
//! ChaCha20-Poly1305 and HKDF-SHA256.
//!
//! Endorsers must produce the same ciphertext for the same inputs, so
//! encryption never draws randomness. Nonces come from the key and the
//! plaintext; only fresh keys are random, and those are made client-side.

use std::fmt;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key as AeadKey, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{PermsError, Result};

const AGREEMENT_DOMAIN: &str = "consent-kernel-v0-seal";
const NONCE_DOMAIN: &[u8] = b"consent-kernel-v0-nonce";

fn random_bytes() -> [u8; 32] {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// A principal's public key; edges out of its private key are sealed to it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct X25519PublicKey([u8; 32]);

impl X25519PublicKey {
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for X25519PublicKey {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for X25519PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "X25519Pub({}..)", hex::encode(&self.0[..4]))
    }
}

/// A principal's private key. Only used for key agreement.
#[derive(Clone)]
pub struct PrivateKey(StaticSecret);

impl PrivateKey {
    pub fn generate() -> Self {
        Self::from_bytes(random_bytes())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub fn public_key(&self) -> X25519PublicKey {
        X25519PublicKey(*PublicKey::from(&self.0).as_bytes())
    }

    /// Agree with `peer` on a symmetric key bound to `context`.
    ///
    /// Both sides of the exchange get the same key for the same context.
    pub fn agree(&self, peer: &X25519PublicKey, context: &[u8]) -> SymKey {
        let shared = self.0.diffie_hellman(&PublicKey::from(peer.0));
        let mut hasher = blake3::Hasher::new_derive_key(AGREEMENT_DOMAIN);
        hasher.update(shared.as_bytes());
        hasher.update(context);
        SymKey(*hasher.finalize().as_bytes())
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey({:?})", self.public_key())
    }
}

/// A 256-bit ChaCha20-Poly1305 key.
#[derive(Clone, PartialEq, Eq)]
pub struct SymKey([u8; 32]);

impl SymKey {
    pub fn generate() -> Self {
        Self(random_bytes())
    }

    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The nonce for `plaintext` under this key.
    ///
    /// Two encryptions share a nonce only when they encrypt the same
    /// plaintext under the same key, and then they are identical.
    pub fn nonce_for(&self, plaintext: &[u8]) -> [u8; 12] {
        let mut hasher = blake3::Hasher::new_keyed(&self.0);
        hasher.update(NONCE_DOMAIN);
        hasher.update(plaintext);
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&hasher.finalize().as_bytes()[..12]);
        nonce
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(AeadKey::from_slice(&self.0))
    }

    pub fn encrypt(&self, nonce: &[u8; 12], plaintext: &[u8]) -> Result<Vec<u8>> {
        self.cipher()
            .encrypt(Nonce::from_slice(nonce), plaintext)
            .map_err(|e| PermsError::EncryptionError(e.to_string()))
    }

    pub fn decrypt(&self, nonce: &[u8; 12], ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.cipher()
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| PermsError::DecryptionError("authentication failed".into()))
    }
}

impl fmt::Debug for SymKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymKey(..)")
    }
}

/// HKDF-SHA256 expansion of `ikm` into 32 bytes under `info`.
pub fn hkdf_derive(ikm: &[u8], info: &[u8]) -> Result<[u8; 32]> {
    let mut okm = [0u8; 32];
    Hkdf::<Sha256>::new(None, ikm)
        .expand(info, &mut okm)
        .map_err(|e| PermsError::KeyDerivationError(e.to_string()))?;
    Ok(okm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agreement_is_symmetric_and_context_bound() {
        let alice = PrivateKey::generate();
        let bob = PrivateKey::generate();

        let ab = alice.agree(&bob.public_key(), b"edge:a:b");
        let ba = bob.agree(&alice.public_key(), b"edge:a:b");
        assert_eq!(ab, ba);
        assert_ne!(ab, alice.agree(&bob.public_key(), b"edge:a:c"));
    }

    #[test]
    fn test_private_key_bytes_roundtrip() {
        let secret = PrivateKey::generate();
        let restored = PrivateKey::from_bytes(secret.to_bytes());
        assert_eq!(secret.public_key(), restored.public_key());
    }

    #[test]
    fn test_wrong_key_fails_authentication() {
        let key = SymKey::generate();
        let nonce = key.nonce_for(b"secret");
        let ciphertext = key.encrypt(&nonce, b"secret").unwrap();

        assert_eq!(key.decrypt(&nonce, &ciphertext).unwrap(), b"secret");
        let err = SymKey::generate().decrypt(&nonce, &ciphertext).unwrap_err();
        assert!(matches!(err, PermsError::DecryptionError(_)));
    }

    #[test]
    fn test_nonce_depends_on_key_and_plaintext() {
        let key = SymKey::from_bytes([7; 32]);
        assert_eq!(key.nonce_for(b"a"), key.nonce_for(b"a"));
        assert_ne!(key.nonce_for(b"a"), key.nonce_for(b"b"));
        assert_ne!(key.nonce_for(b"a"), SymKey::from_bytes([8; 32]).nonce_for(b"a"));
    }

    #[test]
    fn test_hkdf_separates_info() {
        let a = hkdf_derive(&[1; 32], b"log").unwrap();
        let b = hkdf_derive(&[1; 32], b"datatype:d1").unwrap();
        assert_ne!(a, b);
        assert_eq!(a, hkdf_derive(&[1; 32], b"log").unwrap());
    }
}
