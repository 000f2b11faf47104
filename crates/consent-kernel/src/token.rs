//! Consent validation tokens.
//!
//! A token carries a consent key sealed to the public key of the caller
//! that validated the consent. Redeeming it opens the owner's data for
//! that datatype without walking the key graph, for a bounded time.

use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use serde::{Deserialize, Serialize};

use consent_kernel_core::{canonical_json, KeyId};
use consent_kernel_perms::{Ciphertext, Key, KeyType, SealedBox};

use crate::consent::Access;
use crate::error::{KernelError, Result};
use crate::principal::{Principal, SecretBytes};

const TOKEN_CONTEXT: &[u8] = b"consent-kernel-v0-validation-token";

/// Contents of a validation token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationToken {
    pub owner: String,
    pub target: String,
    /// Datatype that was asked for.
    pub datatype: String,
    /// Datatype the deciding consent was given for; `datatype` or one of
    /// its ancestors.
    pub consent_datatype: String,
    pub access: Access,
    /// Substrate time of issue.
    pub timestamp: i64,
    pub consent_key_id: KeyId,
    pub consent_key: SecretBytes,
}

impl ValidationToken {
    /// Seal for `holder` and encode as URL-safe base64.
    pub fn seal(&self, holder: &Principal) -> Result<String> {
        let plaintext = canonical_json(self)?;
        let sealed = SealedBox::seal(plaintext.as_bytes(), &holder.public_key()?, TOKEN_CONTEXT)?;
        Ok(URL_SAFE.encode(sealed.to_bytes()?))
    }

    /// Open a token sealed for `holder`. Checks the encoding only.
    pub fn open(encoded: &str, holder: &Principal) -> Result<Self> {
        let bytes = URL_SAFE
            .decode(encoded.trim().as_bytes())
            .map_err(|e| KernelError::BadInput(format!("bad token encoding: {e}")))?;
        let sealed = SealedBox::from_bytes(&bytes)
            .map_err(|e| KernelError::BadInput(format!("malformed token: {e}")))?;
        let plaintext = holder
            .key()
            .decrypt(&Ciphertext::Sealed(sealed), TOKEN_CONTEXT)
            .map_err(|_| KernelError::NoAccess(format!("token was not issued to {}", holder.id())))?;
        serde_json::from_slice(&plaintext).map_err(|e| KernelError::BadInput(format!("malformed token: {e}")))
    }

    /// Fail with `expired` unless `timestamp <= now <= timestamp + ttl`.
    pub fn check_fresh(&self, now: i64, ttl_secs: i64) -> Result<()> {
        if now < self.timestamp || now > self.timestamp.saturating_add(ttl_secs) {
            return Err(KernelError::Expired(format!(
                "token issued at {} is not valid at {now}",
                self.timestamp
            )));
        }
        Ok(())
    }

    pub fn consent_key(&self) -> Result<Key> {
        Ok(Key::from_bytes(
            self.consent_key_id.clone(),
            KeyType::Sym,
            &self.consent_key.decode()?,
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use consent_kernel_perms::PrivateKey;

    fn token(ts: i64) -> ValidationToken {
        let key = Key::generate_sym(KeyId::new("ck1").unwrap());
        ValidationToken {
            owner: "p1".into(),
            target: "s1".into(),
            datatype: "d1".into(),
            consent_datatype: "d1".into(),
            access: Access::Read,
            timestamp: ts,
            consent_key_id: key.id().clone(),
            consent_key: SecretBytes::encode(&key.to_bytes()),
        }
    }

    #[test]
    fn test_only_holder_opens() {
        let holder = Principal::new("s1", PrivateKey::from_bytes([3; 32])).unwrap();
        let other = Principal::new("s2", PrivateKey::from_bytes([4; 32])).unwrap();
        let encoded = token(100).seal(&holder).unwrap();

        let opened = ValidationToken::open(&encoded, &holder).unwrap();
        assert_eq!(opened, token(100));
        assert_eq!(opened.consent_key().unwrap().id().as_str(), "ck1");

        let err = ValidationToken::open(&encoded, &other).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::NoAccess);
    }

    #[test]
    fn test_garbage_is_bad_input() {
        let holder = Principal::new("s1", PrivateKey::from_bytes([3; 32])).unwrap();
        let err = ValidationToken::open("not base64!!", &holder).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::BadInput);
        let err = ValidationToken::open(&URL_SAFE.encode(b"junk"), &holder).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::BadInput);
    }

    #[test]
    fn test_freshness_window() {
        let t = token(1_000);
        assert!(t.check_fresh(1_000, 900).is_ok());
        assert!(t.check_fresh(1_899, 900).is_ok());
        assert!(t.check_fresh(1_900, 900).is_ok());
        assert_eq!(t.check_fresh(1_901, 900).unwrap_err().code(), crate::error::ErrorCode::Expired);
        assert_eq!(t.check_fresh(999, 900).unwrap_err().code(), crate::error::ErrorCode::Expired);
    }
}
