//! Plaintext secondary indexes.
//!
//! An entry `idx:{name}:{p1}\0{p2}\0…` maps to an asset id. Scans return
//! entries in key order, which is the canonical order every endorser
//! agrees on.

use consent_kernel_core::{pad_number, split_composite};
use consent_kernel_store::layout;

use crate::context::Ctx;
use crate::error::{KernelError, Result};

pub const USER_DATA: &str = "userData";
pub const OWNER_DATA: &str = "ownerData";
pub const CONSENT_OWNER: &str = "consentOwner";
pub const CONSENT_TARGET: &str = "consentTarget";
pub const ENROLL_USER: &str = "enrollUser";
pub const ENROLL_SERVICE: &str = "enrollService";
pub const CONTRACT_SERVICE: &str = "contractService";
pub const AUDIT_SERVICE: &str = "auditService";
pub const GROUP_MEMBER: &str = "groupMember";
pub const LOG_ALL: &str = "logAll";

/// One index entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexHit {
    pub parts: Vec<String>,
    pub asset_id: String,
}

/// Collects query results against a limit.
///
/// A strict page holds at most `max_query_results` items and refuses one
/// more, so a caller learns to narrow the query instead of silently
/// missing entries. A truncating page stops quietly at a limit the caller
/// asked for.
#[derive(Debug)]
pub struct Page<T> {
    items: Vec<T>,
    limit: usize,
    strict: bool,
}

impl<T> Page<T> {
    pub fn strict(limit: usize) -> Self {
        Self {
            items: Vec::new(),
            limit,
            strict: true,
        }
    }

    pub fn truncating(limit: usize) -> Self {
        Self {
            items: Vec::new(),
            limit,
            strict: false,
        }
    }

    /// A caller-requested `wanted` is honoured quietly up to `cap`; beyond
    /// it, or when nothing was requested, the page is strict at `cap`.
    pub fn requested(wanted: Option<usize>, cap: usize) -> Self {
        match wanted {
            Some(n) if n <= cap => Self::truncating(n),
            _ => Self::strict(cap),
        }
    }

    /// Add a matching item. Returns whether scanning should go on.
    pub fn push(&mut self, item: T) -> Result<bool> {
        if self.items.len() >= self.limit {
            if self.strict {
                return Err(KernelError::BadInput(format!(
                    "more than {} results match; narrow the query",
                    self.limit
                )));
            }
            return Ok(false);
        }
        self.items.push(item);
        Ok(self.strict || self.items.len() < self.limit)
    }

    pub fn into_vec(self) -> Vec<T> {
        self.items
    }
}

/// Zero-padded timestamp component.
pub fn ts_part(ts: i64) -> Result<String> {
    pad_number(ts).map_err(|_| KernelError::BadInput(format!("negative timestamp {ts}")))
}

impl<'a> Ctx<'a> {
    pub fn put_index(&mut self, name: &str, parts: &[&str], asset_id: &str) -> Result<()> {
        let key = layout::index_key(name, parts).map_err(|e| KernelError::BadInput(e.to_string()))?;
        self.tx.put(key, asset_id.as_bytes().to_vec());
        Ok(())
    }

    pub fn delete_index(&mut self, name: &str, parts: &[&str]) -> Result<()> {
        let key = layout::index_key(name, parts).map_err(|e| KernelError::BadInput(e.to_string()))?;
        self.tx.delete(key);
        Ok(())
    }

    /// Every entry whose leading parts equal `prefix`.
    pub async fn scan_index(&mut self, name: &str, prefix: &[&str]) -> Result<Vec<IndexHit>> {
        self.scan_index_between(name, prefix, None, None).await
    }

    /// Entries under `prefix` whose next part lies in `[lo, hi]`.
    ///
    /// Every entry in range is returned; callers cap what they keep with a
    /// [`Page`] after their own filtering.
    pub async fn scan_index_between(
        &mut self,
        name: &str,
        prefix: &[&str],
        lo: Option<&str>,
        hi: Option<&str>,
    ) -> Result<Vec<IndexHit>> {
        let base = layout::index_prefix(name, prefix).map_err(|e| KernelError::BadInput(e.to_string()))?;
        let (mut start, mut end) = layout::prefix_range(&base);
        if let Some(lo) = lo {
            start = format!("{base}{lo}");
        }
        if let Some(hi) = hi {
            end = format!("{base}{hi}{}", char::MAX);
        }

        let rows = self.tx.range_query(&start, &end).await?;
        rows.into_iter()
            .map(|(key, value)| {
                let composite = layout::index_composite(name, &key)
                    .ok_or_else(|| KernelError::Invariant(format!("foreign index key {key:?}")))?;
                let asset_id = String::from_utf8(value)
                    .map_err(|e| KernelError::corrupt("index entry", e))?;
                Ok(IndexHit {
                    parts: split_composite(composite),
                    asset_id,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use consent_kernel_core::TxMeta;
    use consent_kernel_perms::PrivateKey;
    use consent_kernel_store::{MemoryBlobStore, MemorySubstrate, Transaction};

    use crate::config::KernelConfig;
    use crate::principal::Principal;

    #[tokio::test]
    async fn test_scan_prefix_and_range() {
        let substrate = MemorySubstrate::new();
        let blobs = MemoryBlobStore::new();
        let config = KernelConfig::default();
        let caller = Principal::new("s1", PrivateKey::from_bytes([2; 32])).unwrap();
        let mut ctx = Ctx::new(
            Transaction::begin(&substrate, TxMeta::new("tx", 0)),
            &blobs,
            &config,
            &caller,
        );

        for ts in [100, 5, 2000] {
            let t = ts_part(ts).unwrap();
            ctx.put_index(USER_DATA, &["p1", "d1", &t], &format!("r{ts}")).unwrap();
        }
        ctx.put_index(USER_DATA, &["p1", "d10", &ts_part(1).unwrap()], "other").unwrap();

        let all = ctx.scan_index(USER_DATA, &["p1", "d1"]).await.unwrap();
        let ids: Vec<_> = all.iter().map(|h| h.asset_id.as_str()).collect();
        assert_eq!(ids, vec!["r5", "r100", "r2000"]);
        assert_eq!(all[0].parts, vec!["p1", "d1", ts_part(5).unwrap().as_str()]);

        let lo = ts_part(50).unwrap();
        let hi = ts_part(100).unwrap();
        let ranged = ctx
            .scan_index_between(USER_DATA, &["p1", "d1"], Some(&lo), Some(&hi))
            .await
            .unwrap();
        assert_eq!(ranged.len(), 1);
        assert_eq!(ranged[0].asset_id, "r100");
    }

    #[tokio::test]
    async fn test_scan_returns_every_entry_in_range() {
        let substrate = MemorySubstrate::new();
        let blobs = MemoryBlobStore::new();
        let config = KernelConfig {
            max_query_results: 2,
            ..KernelConfig::default()
        };
        let caller = Principal::new("s1", PrivateKey::from_bytes([2; 32])).unwrap();
        let mut ctx = Ctx::new(
            Transaction::begin(&substrate, TxMeta::new("tx", 0)),
            &blobs,
            &config,
            &caller,
        );
        for ts in 1..=5 {
            ctx.put_index(LOG_ALL, &[&ts_part(ts).unwrap()], &format!("l{ts}")).unwrap();
        }
        let hits = ctx.scan_index(LOG_ALL, &[]).await.unwrap();
        let ids: Vec<_> = hits.iter().map(|h| h.asset_id.as_str()).collect();
        assert_eq!(ids, vec!["l1", "l2", "l3", "l4", "l5"]);
    }

    #[test]
    fn test_strict_page_refuses_overflow() {
        let mut page = Page::strict(2);
        assert!(page.push(1).unwrap());
        assert!(page.push(2).unwrap());
        let err = page.push(3).unwrap_err();
        assert!(matches!(err, KernelError::BadInput(_)));
    }

    #[test]
    fn test_truncating_page_stops_at_limit() {
        let mut page = Page::truncating(2);
        assert!(page.push("a").unwrap());
        assert!(!page.push("b").unwrap());
        assert!(!page.push("c").unwrap());
        assert_eq!(page.into_vec(), vec!["a", "b"]);
    }

    #[test]
    fn test_requested_page_clamps_to_cap() {
        let mut page = Page::requested(Some(5), 1);
        assert!(page.push(1).unwrap());
        assert!(page.push(2).is_err());

        let mut page = Page::requested(Some(1), 10);
        assert!(!page.push(1).unwrap());
        assert_eq!(page.into_vec(), vec![1]);

        let mut page = Page::requested(None, 1);
        assert!(page.push(1).unwrap());
        assert!(page.push(2).is_err());
    }

    #[test]
    fn test_negative_timestamp_rejected() {
        assert!(ts_part(-1).is_err());
    }
}
