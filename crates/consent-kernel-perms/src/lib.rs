//! # Consent Kernel Permissions
//!
//! Keys, encryption and the access-key graph.
//!
//! ## Overview
//!
//! Access control is cryptographic. Every principal, datatype, consent,
//! enrollment and contract owns a key, and holding one key grants every
//! key reachable from it through stored edges. Reading protected data
//! means finding a path from the caller's private key to the key that
//! encrypts the data and unwrapping each edge along the way.
//!
//! ## Key Concepts
//!
//! - **Key**: A node in the graph, X25519 private or ChaCha20 symmetric
//! - **Edge**: The target key wrapped for the source key
//! - **Log key**: A key derived from another with HKDF, used for audit logs
//! - **EncryptedPayload**: Ciphertext plus nonce for private asset payloads
//!
//! ## Determinism
//!
//! Endorsers must agree on every byte written. Nonces and sealing
//! ephemerals are derived from their inputs rather than drawn at random,
//! and path search visits neighbours in sorted order.

pub mod crypto;
pub mod envelope;
pub mod error;
pub mod graph;
pub mod key;
pub mod sealed;

pub use crypto::{hkdf_derive, PrivateKey, SymKey, X25519PublicKey};
pub use envelope::{EncryptedPayload, ENVELOPE_V1};
pub use error::{PermsError, Result};
pub use graph::{EdgeStore, KeyGraph, KeyPath, DEFAULT_SEARCH_LIMIT};
pub use key::{
    edge_context, unwrap_edge, Ciphertext, EdgeSource, Key, KeyInfo, KeyMaterial, KeyType,
    WrappedKey, LOG_KEY_INFO,
};
pub use sealed::SealedBox;
