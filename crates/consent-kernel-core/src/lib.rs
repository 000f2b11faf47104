//! # Consent Kernel Core
//!
//! Pure primitives shared by every Consent Kernel crate: identifiers,
//! asset namespaces, hashing and canonical encodings.
//!
//! This crate contains no I/O, no storage, no key material. It is pure
//! computation over identifiers.
//!
//! ## Key Types
//!
//! - [`KeyId`] - Identifier of a node in the access graph
//! - [`Namespace`] - Partition of the asset universe
//! - [`TxMeta`] - Transaction id and substrate timestamp
//! - [`ContentHash`] - Pins off-chain blobs to their ciphertext
//!
//! ## Canonicalization
//!
//! Every value that crosses a replica boundary (asset bodies, index keys,
//! derived ids) is produced through [`canonical`] so that all endorsers
//! compute byte-identical results.

pub mod canonical;
pub mod crypto;
pub mod error;
pub mod types;

pub use canonical::{canonical_json, composite_key, pad_number, split_composite, COMPOSITE_SEP};
pub use crypto::{derive_id, ContentHash};
pub use error::{CoreError, Result};
pub use types::{KeyId, Namespace, TxMeta, LOG_KEY_SUFFIX};
