//! Kernel configuration.

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, Result};

/// Configuration for the Kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Allowed distance between a consent timestamp and substrate time.
    pub consent_clock_skew_secs: i64,
    /// Lifetime of a validation token.
    pub token_ttl_secs: i64,
    /// Most results one query may return.
    pub max_query_results: usize,
    /// Connections whose private payloads are kept in the blob store.
    pub offchain_connections: Vec<String>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            consent_clock_skew_secs: 600,
            token_ttl_secs: 900,
            max_query_results: 1000,
            offchain_connections: Vec::new(),
        }
    }
}

impl KernelConfig {
    /// Parse from TOML. Missing fields take their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| KernelError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.consent_clock_skew_secs < 0 || self.token_ttl_secs <= 0 {
            return Err(KernelError::Config(
                "time windows must be positive".into(),
            ));
        }
        if self.max_query_results == 0 {
            return Err(KernelError::Config("max_query_results must be > 0".into()));
        }
        Ok(())
    }

    /// Whether private payloads written under `connection` go off-chain.
    pub fn is_offchain(&self, connection: &str) -> bool {
        self.offchain_connections.iter().any(|c| c == connection)
    }
}
