//! Content hashes and derived identifiers.

use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// BLAKE3 digest of a byte string.
///
/// Off-chain blobs are pinned by the content hash of their ciphertext;
/// the hash travels as lowercase hex inside the asset record.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Whether `data` hashes to this value.
    pub fn matches(&self, data: &[u8]) -> bool {
        blake3::Hash::from(self.0) == blake3::hash(data)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn into_bytes(self) -> [u8; 32] {
        self.0
    }
}

impl FromStr for ContentHash {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| CoreError::DecodingError(format!("content hash: {e}")))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CoreError::DecodingError(format!("content hash of wrong length: {s}")))?;
        Ok(Self(bytes))
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({}..)", &self.to_hex()[..12])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Derive a hex identifier from a domain and an ordered list of parts.
///
/// Each part is length-prefixed so `("ab", "c")` and `("a", "bc")` never
/// collide.
pub fn derive_id(domain: &str, parts: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new_derive_key(&format!("consent-kernel-v0:{domain}"));
    for part in parts {
        hasher.update(&(part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_pins_bytes() {
        let h = ContentHash::of(b"ciphertext");
        assert!(h.matches(b"ciphertext"));
        assert!(!h.matches(b"ciphertexT"));
        assert_eq!(h.to_string().parse::<ContentHash>().unwrap(), h);
    }

    #[test]
    fn test_content_hash_rejects_bad_hex() {
        assert!("zz".parse::<ContentHash>().is_err());
        assert!("abcd".parse::<ContentHash>().is_err());
    }

    #[test]
    fn test_derive_id_is_length_prefixed() {
        let a = derive_id("consent", &["ab", "c"]);
        let b = derive_id("consent", &["a", "bc"]);
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_derive_id_domain_separated() {
        let a = derive_id("consent", &["d1", "s1", "p1"]);
        let b = derive_id("enrollment", &["d1", "s1", "p1"]);
        assert_ne!(a, b);
        assert_eq!(a, derive_id("consent", &["d1", "s1", "p1"]));
    }
}
