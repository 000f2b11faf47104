//! Audit log writer and reader.
//!
//! Each invocation that changes or releases data appends exactly one log
//! asset, encrypted under the log key of the key it is bound to (a
//! consent, enrollment, contract or principal key). The descriptive
//! fields are public and indexed; the payload is private. Holding a log
//! key never grants the data key it was derived from.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use consent_kernel_core::{derive_id, KeyId, Namespace};
use consent_kernel_perms::Key;

use crate::asset::AssetWrite;
use crate::context::Ctx;
use crate::error::{KernelError, Result};
use crate::index::{self, ts_part, Page};

/// Public, indexed fields of a log asset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFields {
    pub caller: String,
    pub function: String,
    pub namespace: Option<Namespace>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datatype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_owner_org: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_requester_org: Option<String>,
    pub timestamp: i64,
    pub tx_id: String,
}

impl LogFields {
    /// Indexed fields in a fixed order.
    fn indexed(&self) -> [(&'static str, Option<&str>); 8] {
        [
            ("caller", Some(self.caller.as_str())),
            ("owner", self.owner.as_deref()),
            ("target", self.target.as_deref()),
            ("service", self.service.as_deref()),
            ("datatype", self.datatype.as_deref()),
            ("contract", self.contract.as_deref()),
            ("contractOwnerOrg", self.contract_owner_org.as_deref()),
            ("contractRequesterOrg", self.contract_requester_org.as_deref()),
        ]
    }
}

/// A log entry as returned by `getLogs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: String,
    #[serde(flatten)]
    pub fields: LogFields,
    pub data: Option<Value>,
}

/// Filter for `getLogs`. Every present field must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogFilter {
    pub caller: Option<String>,
    pub owner: Option<String>,
    pub target: Option<String>,
    pub service: Option<String>,
    pub datatype: Option<String>,
    pub contract: Option<String>,
    pub contract_owner_org: Option<String>,
    pub contract_requester_org: Option<String>,
    pub function: Option<String>,
    pub start: Option<i64>,
    pub end: Option<i64>,
}

impl LogFilter {
    fn fields(&self) -> [(&'static str, Option<&str>); 8] {
        [
            ("contract", self.contract.as_deref()),
            ("owner", self.owner.as_deref()),
            ("target", self.target.as_deref()),
            ("service", self.service.as_deref()),
            ("datatype", self.datatype.as_deref()),
            ("contractOwnerOrg", self.contract_owner_org.as_deref()),
            ("contractRequesterOrg", self.contract_requester_org.as_deref()),
            ("caller", self.caller.as_deref()),
        ]
    }

    fn matches(&self, fields: &LogFields) -> bool {
        let indexed: HashMap<_, _> = fields.indexed().into_iter().collect();
        let fields_ok = self.fields().iter().all(|(name, wanted)| match wanted {
            Some(wanted) => indexed.get(name).copied().flatten() == Some(*wanted),
            None => true,
        });
        let function_ok = self.function.as_deref().map_or(true, |f| f == fields.function);
        let start_ok = self.start.map_or(true, |s| fields.timestamp >= s);
        let end_ok = self.end.map_or(true, |e| fields.timestamp <= e);
        fields_ok && function_ok && start_ok && end_ok
    }
}

fn field_index(name: &str) -> String {
    format!("log.{name}")
}

/// Id of the log asset written by a transaction.
pub fn log_id(tx_id: &str) -> String {
    derive_id("log", &[tx_id])
}

impl<'a> Ctx<'a> {
    /// Append this invocation's audit record, bound to `bound`'s log key.
    pub async fn write_log(
        &mut self,
        namespace: Namespace,
        function: &str,
        mut fields: LogFields,
        data: &impl Serialize,
        bound: &Key,
    ) -> Result<String> {
        if self.logged {
            return Err(KernelError::Invariant(format!(
                "second log record in transaction {}",
                self.tx_id()
            )));
        }

        let log_key = if bound.id().is_log() {
            bound.clone()
        } else {
            bound.log_key()?
        };

        fields.caller = self.caller().id().to_string();
        fields.function = function.to_string();
        fields.namespace = Some(namespace);
        fields.timestamp = self.now();
        fields.tx_id = self.tx_id().to_string();

        let id = log_id(self.tx_id());
        let ts = ts_part(fields.timestamp)?;
        let write = AssetWrite::new(Namespace::Log, id.clone(), &fields)?
            .private(&serde_json::json!({ "data": data }), &log_key)?;
        self.put_asset(write, &[]).await?;

        self.put_index(index::LOG_ALL, &[&ts, &id], &id)?;
        for (name, value) in fields.indexed() {
            if let Some(value) = value {
                self.put_index(&field_index(name), &[value, &ts, &id], &id)?;
            }
        }

        self.logged = true;
        debug!(log = %id, function, key = %log_key.id(), "audit record written");
        Ok(id)
    }

    /// Logs matching `filter` whose log key the caller can derive.
    ///
    /// Entries the caller cannot open are omitted, indistinguishable from
    /// absent ones. At most `max_query_results` readable matches come back,
    /// oldest first; when more match the call fails with `bad-input`.
    pub async fn get_logs(&mut self, filter: &LogFilter) -> Result<Vec<LogEntry>> {
        let lo = filter.start.map(ts_part).transpose()?;
        let hi = filter.end.map(ts_part).transpose()?;

        let hits = match filter.fields().into_iter().find_map(|(n, v)| v.map(|v| (n, v))) {
            Some((name, value)) => {
                self.scan_index_between(&field_index(name), &[value], lo.as_deref(), hi.as_deref())
                    .await?
            }
            None => {
                self.scan_index_between(index::LOG_ALL, &[], lo.as_deref(), hi.as_deref())
                    .await?
            }
        };

        let mut keys: HashMap<KeyId, Option<Key>> = HashMap::new();
        let mut page = Page::strict(self.config.max_query_results);
        for hit in hits {
            let Some(record) = self.get_record(Namespace::Log, &hit.asset_id).await? else {
                continue;
            };
            let fields: LogFields = record.public_as()?;
            if !filter.matches(&fields) {
                continue;
            }
            let Some(key_id) = record.key_id.clone() else {
                continue;
            };
            let key = match keys.get(&key_id) {
                Some(key) => key.clone(),
                None => {
                    let key = self.derive_from_caller(&key_id).await?;
                    keys.insert(key_id, key.clone());
                    key
                }
            };
            let Some(key) = key else {
                continue;
            };

            let view = self.read_asset(&record, Some(&key)).await?;
            let data = view
                .private
                .and_then(|mut p| p.get_mut("data").map(Value::take));
            page.push(LogEntry {
                id: record.id.clone(),
                fields,
                data,
            })?;
        }
        Ok(page.into_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use consent_kernel_core::TxMeta;
    use consent_kernel_perms::{EdgeSource, PrivateKey};
    use consent_kernel_store::{MemoryBlobStore, MemorySubstrate, Substrate, Transaction};
    use serde_json::json;

    use crate::config::KernelConfig;
    use crate::principal::Principal;

    fn ctx<'a>(
        substrate: &'a dyn Substrate,
        blobs: &'a MemoryBlobStore,
        config: &'a KernelConfig,
        caller: &'a Principal,
        tx: &str,
        ts: i64,
    ) -> Ctx<'a> {
        Ctx::new(Transaction::begin(substrate, TxMeta::new(tx, ts)), blobs, config, caller)
    }

    #[tokio::test]
    async fn test_one_log_per_transaction() {
        let substrate = MemorySubstrate::new();
        let blobs = MemoryBlobStore::new();
        let config = KernelConfig::default();
        let caller = Principal::new("p1", PrivateKey::from_bytes([1; 32])).unwrap();
        let bound = Key::generate_sym(KeyId::new("c1").unwrap());

        let mut ctx = ctx(&substrate, &blobs, &config, &caller, "tx1", 10);
        ctx.write_log(Namespace::Consent, "putConsent", LogFields::default(), &json!(1), &bound)
            .await
            .unwrap();
        let err = ctx
            .write_log(Namespace::Consent, "putConsent", LogFields::default(), &json!(2), &bound)
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvariantViolation);
    }

    #[tokio::test]
    async fn test_logs_visible_only_with_log_key_path() {
        let substrate = MemorySubstrate::new();
        let blobs = MemoryBlobStore::new();
        let config = KernelConfig::default();
        let owner = Principal::new("p1", PrivateKey::from_bytes([1; 32])).unwrap();
        let stranger = Principal::new("x1", PrivateKey::from_bytes([9; 32])).unwrap();
        let consent = Key::generate_sym(KeyId::new("c1").unwrap());

        let mut c = ctx(&substrate, &blobs, &config, &owner, "tx1", 10);
        let owner_key = owner.key().clone();
        let consent_log = consent.log_key().unwrap();
        c.link(EdgeSource::Key(&owner_key), &consent_log).await.unwrap();
        let fields = LogFields {
            owner: Some("p1".into()),
            datatype: Some("d1".into()),
            ..LogFields::default()
        };
        c.write_log(Namespace::Consent, "putConsent", fields, &json!({"n": 1}), &consent)
            .await
            .unwrap();
        c.commit().await.unwrap();

        let mut c = ctx(&substrate, &blobs, &config, &owner, "tx2", 11);
        let filter = LogFilter {
            owner: Some("p1".into()),
            ..LogFilter::default()
        };
        let logs = c.get_logs(&filter).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].fields.function, "putConsent");
        assert_eq!(logs[0].fields.caller, "p1");
        assert_eq!(logs[0].data, Some(json!({"n": 1})));

        let mut c = ctx(&substrate, &blobs, &config, &stranger, "tx3", 12);
        assert!(c.get_logs(&filter).await.unwrap().is_empty());
        assert!(c.get_logs(&LogFilter::default()).await.unwrap().is_empty());
    }

    #[test]
    fn test_filter_matching() {
        let fields = LogFields {
            caller: "s1".into(),
            function: "uploadUserData".into(),
            owner: Some("p1".into()),
            timestamp: 50,
            ..LogFields::default()
        };
        let mut filter = LogFilter {
            owner: Some("p1".into()),
            ..LogFilter::default()
        };
        assert!(filter.matches(&fields));
        filter.function = Some("putConsent".into());
        assert!(!filter.matches(&fields));
        filter.function = None;
        filter.start = Some(51);
        assert!(!filter.matches(&fields));
        filter.start = None;
        filter.target = Some("s1".into());
        assert!(!filter.matches(&fields));
    }
}
