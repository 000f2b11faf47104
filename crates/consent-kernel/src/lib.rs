//! # Consent Kernel
//!
//! A consent-and-access-control engine over an append-only ledger.
//!
//! ## Overview
//!
//! Every asset has a public half and a private half encrypted under the
//! asset's symmetric key. Who may read what is decided by one thing only:
//! whether a chain of wrapped keys leads from the caller's private key to
//! the asset key. On top of that graph the kernel provides:
//!
//! - **Registry**: users, orgs, services and a datatype hierarchy
//! - **Roles**: org members and admins, service admins, auditors
//! - **Consent**: patient and owner consents with read/write/deny options,
//!   validation and short-lived validation tokens
//! - **Enrollment**: patients enrolled in services
//! - **Data**: upload and download of protected records
//! - **Contracts**: metered data sharing between two services
//! - **Audit log**: one encrypted log record per state-changing call
//!
//! ## Usage
//!
//! ```rust,no_run
//! use consent_kernel::{Kernel, KernelConfig, Principal};
//! use consent_kernel::core::TxMeta;
//! use consent_kernel::perms::PrivateKey;
//!
//! async fn example() -> consent_kernel::Result<()> {
//!     let kernel = Kernel::open_sqlite("ledger.db", KernelConfig::default())?;
//!     let caller = Principal::new("p1", PrivateKey::from_bytes([7; 32]))?;
//!
//!     let logs = kernel
//!         .invoke(&caller, TxMeta::new("tx-1", 1_700_000_000), "getLogs", &[])
//!         .await?;
//!     println!("{logs}");
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `consent_kernel::core` - identifiers, namespaces, canonical JSON
//! - `consent_kernel::store` - substrate, transaction stub, blob stores
//! - `consent_kernel::perms` - keys, envelopes and the key graph

pub mod asset;
pub mod call;
pub mod config;
pub mod consent;
pub mod context;
pub mod contract;
pub mod data;
pub mod enrollment;
pub mod error;
pub mod index;
pub mod kernel;
pub mod log;
pub mod principal;
pub mod registry;
pub mod roles;
pub mod token;

#[cfg(test)]
mod testing;

// Re-export component crates
pub use consent_kernel_core as core;
pub use consent_kernel_perms as perms;
pub use consent_kernel_store as store;

pub use call::Call;
pub use config::KernelConfig;
pub use context::Ctx;
pub use error::{ErrorCode, KernelError, Result};
pub use kernel::Kernel;
pub use principal::{KeySpec, Principal, SecretBytes};

pub use consent::{Access, Consent, ConsentInput, ConsentKind, ConsentOption, ValidateRequest, ValidationResult};
pub use contract::{ContractState, ContractView, DetailKind, DownloadReceipt, MeteredDownload};
pub use data::{DataInput, DataKind, DataRecord, DataWindow, DownloadRequest};
pub use enrollment::{Enrollment, EnrollmentInput, EnrollmentStatus};
pub use log::{LogEntry, LogFilter};
pub use registry::{Datatype, Role};
pub use token::ValidationToken;
