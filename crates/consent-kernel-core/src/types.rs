//! Strong type definitions for the Consent Kernel.
//!
//! Identifiers are newtypes so a key id can never be confused with an
//! asset id at compile time.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{CoreError, Result};

/// Suffix appended to a key id to name its derived log key.
pub const LOG_KEY_SUFFIX: &str = ".log";

/// Identifier of a key node in the access graph.
///
/// Key ids appear inside substrate keys (`edge:{src}:{dst}`), so they may
/// not contain `:`, whitespace or control characters.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyId(String);

impl KeyId {
    /// Create a key id, validating its characters.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(CoreError::InvalidKeyId("empty".into()));
        }
        if id
            .chars()
            .any(|c| c == ':' || c.is_whitespace() || c.is_control())
        {
            return Err(CoreError::InvalidKeyId(id));
        }
        Ok(Self(id))
    }

    /// Get the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The id of the log key derived from this key.
    pub fn log_of(&self) -> KeyId {
        KeyId(format!("{}{}", self.0, LOG_KEY_SUFFIX))
    }

    /// Whether this id names a derived log key.
    pub fn is_log(&self) -> bool {
        self.0.ends_with(LOG_KEY_SUFFIX)
    }

    /// The key a log key was derived from.
    pub fn log_parent(&self) -> Option<KeyId> {
        self.0
            .strip_suffix(LOG_KEY_SUFFIX)
            .filter(|p| !p.is_empty())
            .map(|p| KeyId(p.to_string()))
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({})", self.0)
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for KeyId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self> {
        KeyId::new(value)
    }
}

impl From<KeyId> for String {
    fn from(id: KeyId) -> Self {
        id.0
    }
}

impl FromStr for KeyId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        KeyId::new(s)
    }
}

impl AsRef<str> for KeyId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Partition of the asset universe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Namespace {
    /// Users, orgs and other groups.
    User,
    /// Datatype DAG nodes.
    Datatype,
    /// Service profiles.
    Service,
    /// Data records owned by a patient.
    UserData,
    /// Data records owned by an org or service.
    OwnerData,
    Enrollment,
    Consent,
    Contract,
    /// Download receipts issued under a contract.
    ContractDownload,
    Log,
    AuditPermission,
}

impl Namespace {
    /// All namespaces in canonical order.
    pub const ALL: [Namespace; 11] = [
        Namespace::User,
        Namespace::Datatype,
        Namespace::Service,
        Namespace::UserData,
        Namespace::OwnerData,
        Namespace::Enrollment,
        Namespace::Consent,
        Namespace::Contract,
        Namespace::ContractDownload,
        Namespace::Log,
        Namespace::AuditPermission,
    ];

    /// The persisted name of this namespace.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Namespace::User => "user",
            Namespace::Datatype => "datatype",
            Namespace::Service => "service",
            Namespace::UserData => "userData",
            Namespace::OwnerData => "ownerData",
            Namespace::Enrollment => "enrollment",
            Namespace::Consent => "consent",
            Namespace::Contract => "contract",
            Namespace::ContractDownload => "contractDownload",
            Namespace::Log => "log",
            Namespace::AuditPermission => "auditPermission",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Namespace {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Namespace::ALL
            .iter()
            .copied()
            .find(|ns| ns.as_str() == s)
            .ok_or_else(|| CoreError::UnknownNamespace(s.to_string()))
    }
}

/// Transaction metadata supplied by the substrate.
///
/// `timestamp` is Unix seconds agreed by the ordering layer; engines use
/// it instead of the wall clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxMeta {
    pub tx_id: String,
    pub timestamp: i64,
}

impl TxMeta {
    pub fn new(tx_id: impl Into<String>, timestamp: i64) -> Self {
        Self {
            tx_id: tx_id.into(),
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_id_rejects_separator() {
        assert!(KeyId::new("user1-priv").is_ok());
        assert!(KeyId::new("bad:id").is_err());
        assert!(KeyId::new("").is_err());
        assert!(KeyId::new("has space").is_err());
    }

    #[test]
    fn test_log_key_id() {
        let id = KeyId::new("consent-abc").unwrap();
        let log = id.log_of();
        assert_eq!(log.as_str(), "consent-abc.log");
        assert!(log.is_log());
        assert!(!id.is_log());
        assert_eq!(log.log_parent(), Some(id));
    }

    #[test]
    fn test_key_id_serde_validates() {
        let ok: KeyId = serde_json::from_str("\"k1\"").unwrap();
        assert_eq!(ok.as_str(), "k1");
        assert!(serde_json::from_str::<KeyId>("\"k:1\"").is_err());
    }

    #[test]
    fn test_namespace_names() {
        for ns in Namespace::ALL {
            assert_eq!(ns.as_str().parse::<Namespace>().unwrap(), ns);
        }
        assert_eq!(
            serde_json::to_string(&Namespace::ContractDownload).unwrap(),
            "\"contractDownload\""
        );
        assert!("nope".parse::<Namespace>().is_err());
    }
}
