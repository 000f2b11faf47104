//! # Consent Kernel Testkit
//!
//! Testing utilities for the Consent Kernel.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Keys**: deterministic principals and client-supplied keys
//! - **Fixtures**: a [`World`] with an in-memory kernel and a clock
//! - **Generators**: proptest strategies for options, ids and datatypes
//!
//! ## Test Fixtures
//!
//! ```rust,no_run
//! use consent_kernel_testkit::World;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let world = World::standard().await?;
//! world.enroll("s1", "p1").await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Once;

use tracing_subscriber::EnvFilter;

pub mod fixtures;
pub mod generators;
pub mod keys;

pub use fixtures::{arg, World, START};
pub use keys::{key_spec, principal, private_secret, sym_secret};

static TRACING: Once = Once::new();

/// Install a test subscriber once. Honours `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
