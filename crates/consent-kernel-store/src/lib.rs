//! # Consent Kernel Store
//!
//! Storage abstraction for the Consent Kernel. The engine runs on top of an
//! append-only key/value substrate with deterministic transaction
//! boundaries; this crate defines that substrate and the per-transaction
//! view the engine works through.
//!
//! ## Key Types
//!
//! - [`Substrate`] - The async trait for ledger state (`get`, `range`, `commit`)
//! - [`Transaction`] - Cached stub: memoised reads, buffered writes
//! - [`BlobStore`] - Off-chain payload storage keyed by connection
//! - [`MemorySubstrate`] / [`SqliteSubstrate`] - Substrate implementations
//! - [`MemoryBlobStore`] / [`SqliteBlobStore`] - Blob store implementations
//!
//! ## Usage
//!
//! ```rust,no_run
//! use consent_kernel_core::TxMeta;
//! use consent_kernel_store::{MemorySubstrate, Transaction};
//!
//! async fn example() {
//!     let substrate = MemorySubstrate::new();
//!     let mut tx = Transaction::begin(&substrate, TxMeta::new("tx-1", 100));
//!     tx.put("counter:demo", b"1".to_vec());
//!     tx.commit().await.unwrap();
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Atomic commits**: a transaction's writes reach the substrate as one batch
//! - **Abort is free**: dropping a transaction discards everything it buffered
//! - **Sorted scans**: `range` always returns keys in byte order

pub mod error;
pub mod layout;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;
pub mod transaction;

pub use error::{Result, StoreError};
pub use memory::{MemoryBlobStore, MemorySubstrate};
pub use sqlite::{SqliteBlobStore, SqliteSubstrate};
pub use traits::{BlobStore, Substrate, WriteBatch, WriteOp};
pub use transaction::Transaction;
