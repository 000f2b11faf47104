//! Persisted key layout on the substrate.
//!
//! ```text
//! asset:{ns}:{id}            asset record (public half + private handle)
//! edge:{srcKeyId}:{dstKeyId} wrapped destination key
//! keyinfo:{keyId}            key type and public bytes
//! idx:{name}:{composite}     index entry pointing to an asset id
//! counter:{name}             monotonic counter
//! ```

use consent_kernel_core::{composite_key, KeyId, Namespace, COMPOSITE_SEP};

use crate::error::{Result, StoreError};

pub const ASSET_PREFIX: &str = "asset:";
pub const EDGE_PREFIX: &str = "edge:";
pub const KEY_INFO_PREFIX: &str = "keyinfo:";
pub const INDEX_PREFIX: &str = "idx:";
pub const COUNTER_PREFIX: &str = "counter:";

/// Upper sentinel used to close prefix ranges.
const RANGE_END: char = char::MAX;

pub fn asset_key(ns: Namespace, id: &str) -> String {
    format!("{ASSET_PREFIX}{}:{id}", ns.as_str())
}

pub fn edge_key(src: &KeyId, dst: &KeyId) -> String {
    format!("{EDGE_PREFIX}{src}:{dst}")
}

/// Prefix shared by every outgoing edge of `src`.
pub fn edge_prefix(src: &KeyId) -> String {
    format!("{EDGE_PREFIX}{src}:")
}

/// Parse `edge:{src}:{dst}` back into its endpoints.
pub fn parse_edge_key(key: &str) -> Result<(KeyId, KeyId)> {
    let rest = key
        .strip_prefix(EDGE_PREFIX)
        .ok_or_else(|| StoreError::InvalidData(format!("not an edge key: {key}")))?;
    let (src, dst) = rest
        .split_once(':')
        .ok_or_else(|| StoreError::InvalidData(format!("malformed edge key: {key}")))?;
    let src = KeyId::new(src).map_err(|e| StoreError::InvalidData(e.to_string()))?;
    let dst = KeyId::new(dst).map_err(|e| StoreError::InvalidData(e.to_string()))?;
    Ok((src, dst))
}

pub fn key_info_key(id: &KeyId) -> String {
    format!("{KEY_INFO_PREFIX}{id}")
}

/// Full index key for an entry.
pub fn index_key<S: AsRef<str>>(name: &str, parts: &[S]) -> Result<String> {
    let composite = composite_key(parts).map_err(|e| StoreError::InvalidData(e.to_string()))?;
    Ok(format!("{INDEX_PREFIX}{name}:{composite}"))
}

/// Prefix matching every index entry whose leading parts equal `parts`.
pub fn index_prefix<S: AsRef<str>>(name: &str, parts: &[S]) -> Result<String> {
    let mut prefix = format!("{INDEX_PREFIX}{name}:");
    if !parts.is_empty() {
        let composite =
            composite_key(parts).map_err(|e| StoreError::InvalidData(e.to_string()))?;
        prefix.push_str(&composite);
        prefix.push(COMPOSITE_SEP);
    }
    Ok(prefix)
}

/// Strip the `idx:{name}:` prefix from a full index key.
pub fn index_composite<'k>(name: &str, key: &'k str) -> Option<&'k str> {
    key.strip_prefix(INDEX_PREFIX)?
        .strip_prefix(name)?
        .strip_prefix(':')
}

pub fn counter_key(name: &str) -> String {
    format!("{COUNTER_PREFIX}{name}")
}

/// Half-open range `[prefix, prefix + MAX)` covering every key with the prefix.
pub fn prefix_range(prefix: &str) -> (String, String) {
    let mut end = prefix.to_string();
    end.push(RANGE_END);
    (prefix.to_string(), end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edge_key_roundtrip() {
        let src = KeyId::new("p1-priv").unwrap();
        let dst = KeyId::new("p1-sym.log").unwrap();
        let key = edge_key(&src, &dst);
        assert_eq!(key, "edge:p1-priv:p1-sym.log");
        assert_eq!(parse_edge_key(&key).unwrap(), (src, dst));
    }

    #[test]
    fn test_edge_prefix_does_not_match_longer_ids() {
        let a = KeyId::new("k1").unwrap();
        let b = KeyId::new("k10").unwrap();
        let c = KeyId::new("x").unwrap();
        let (start, end) = prefix_range(&edge_prefix(&a));
        let other = edge_key(&b, &c);
        assert!(!(other.as_str() >= start.as_str() && other.as_str() < end.as_str()));
    }

    #[test]
    fn test_index_prefix_covers_entries() {
        let key = index_key("userData", &["p1", "d1", "0001"]).unwrap();
        let (start, end) = prefix_range(&index_prefix("userData", &["p1", "d1"]).unwrap());
        assert!(key >= start && key < end);

        let (start, end) = prefix_range(&index_prefix("userData", &["p1", "d"]).unwrap());
        assert!(!(key >= start && key < end));
    }

    #[test]
    fn test_index_composite() {
        let key = index_key("consentOwner", &["p1", "s1"]).unwrap();
        assert_eq!(index_composite("consentOwner", &key), Some("p1\u{0}s1"));
        assert_eq!(index_composite("other", &key), None);
    }

    #[test]
    fn test_asset_key() {
        assert_eq!(asset_key(Namespace::Consent, "abc"), "asset:consent:abc");
    }
}
