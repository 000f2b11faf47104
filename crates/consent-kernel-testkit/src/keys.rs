//! Deterministic key material.
//!
//! Every key is a BLAKE3 hash of a label, so a test can rebuild any
//! principal or client-supplied key from its name alone.

use consent_kernel::{KeySpec, Principal, SecretBytes};
use consent_kernel_core::ContentHash;
use consent_kernel_perms::PrivateKey;

fn seed(kind: &str, label: &str) -> [u8; 32] {
    ContentHash::of(format!("testkit:{kind}:{label}").as_bytes()).into_bytes()
}

/// Private key bytes of principal `id`.
pub fn private_bytes(id: &str) -> [u8; 32] {
    seed("priv", id)
}

/// The principal `id`, unlocked.
pub fn principal(id: &str) -> Principal {
    match Principal::new(id, PrivateKey::from_bytes(private_bytes(id))) {
        Ok(p) => p,
        Err(e) => panic!("invalid principal id {id:?}: {e}"),
    }
}

/// Base64 private key of `id`, as passed to registration calls.
pub fn private_secret(id: &str) -> SecretBytes {
    SecretBytes::encode(&private_bytes(id))
}

/// Base64 symmetric key of `id`.
pub fn sym_secret(id: &str) -> SecretBytes {
    SecretBytes::encode(&seed("sym", id))
}

/// A client-supplied asset key with id `id`.
pub fn key_spec(id: &str) -> KeySpec {
    KeySpec {
        id: id.to_string(),
        bytes: SecretBytes::encode(&seed("key", id)),
    }
}
