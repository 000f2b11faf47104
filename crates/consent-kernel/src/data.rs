//! Uploading and downloading protected records.
//!
//! A record of `owner` tagged with `datatype` is encrypted under the
//! `(owner, datatype)` key. The owner reaches it from their symmetric key,
//! a consented service through the consent key, and a token holder
//! directly from the consent key carried by the token.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use consent_kernel_core::{derive_id, Namespace};
use consent_kernel_perms::Key;

use crate::asset::AssetWrite;
use crate::consent::{consent_id, Access, ConsentGrant};
use crate::context::Ctx;
use crate::enrollment::EnrollmentStatus;
use crate::error::{KernelError, Result};
use crate::index::{ts_part, Page, OWNER_DATA, USER_DATA};
use crate::log::LogFields;
use crate::principal::{validate_id, Principal};

/// Patient records or owner (service/org) records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    User,
    Owner,
}

impl DataKind {
    pub fn namespace(&self) -> Namespace {
        match self {
            DataKind::User => Namespace::UserData,
            DataKind::Owner => Namespace::OwnerData,
        }
    }

    fn index(&self) -> &'static str {
        match self {
            DataKind::User => USER_DATA,
            DataKind::Owner => OWNER_DATA,
        }
    }

    fn upload_function(&self) -> &'static str {
        match self {
            DataKind::User => "uploadUserData",
            DataKind::Owner => "uploadOwnerData",
        }
    }
}

pub fn data_id(kind: DataKind, owner: &str, datatype: &str, timestamp: i64) -> String {
    derive_id(kind.namespace().as_str(), &[owner, datatype, &timestamp.to_string()])
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataInput {
    pub owner: String,
    pub datatype: String,
    pub timestamp: i64,
    pub data: Value,
    /// Service the caller acts for, when it is not the owner.
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub connection_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct DataPublic {
    owner: String,
    datatype: String,
    timestamp: i64,
    #[serde(default)]
    service: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct DataPrivate {
    data: Value,
}

/// Time window and size limits of a download.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataWindow {
    pub latest_only: bool,
    pub start: Option<i64>,
    pub end: Option<i64>,
    /// Keep only the latest `max` records.
    pub max: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub owner: String,
    pub datatype: String,
    /// Principal the caller acts for when it is not the owner.
    #[serde(default)]
    pub service: Option<String>,
    #[serde(flatten)]
    pub window: DataWindow,
}

/// A record as returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRecord {
    pub id: String,
    pub owner: String,
    pub datatype: String,
    pub timestamp: i64,
    #[serde(default)]
    pub service: Option<String>,
    pub data: Option<Value>,
    #[serde(default)]
    pub offchain_unavailable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub id: String,
    pub owner: String,
    pub datatype: String,
    pub timestamp: i64,
}

/// How a download was authorized.
enum Route {
    Owner(Principal),
    Consent(Principal, ConsentGrant),
}

impl<'a> Ctx<'a> {
    pub async fn upload_data(&mut self, kind: DataKind, input: DataInput) -> Result<UploadReceipt> {
        validate_id(&input.owner)?;
        self.datatype(&input.datatype).await?;
        let ts = ts_part(input.timestamp)?;

        let route = self
            .route(kind, &input.owner, &input.datatype, input.service.as_deref(), Access::Write)
            .await?;
        let id = data_id(kind, &input.owner, &input.datatype, input.timestamp);
        if self.asset_exists(kind.namespace(), &id).await? {
            return Err(KernelError::BadState(format!(
                "{} already has {} data at {}",
                input.owner, input.datatype, input.timestamp
            )));
        }
        let (data_key, bound, service) = match &route {
            Route::Owner(owner) => {
                let sym = self.principal_sym(owner).await?;
                let key = self.datatype_key(&sym, &input.owner, &input.datatype).await?;
                (key, sym, None)
            }
            Route::Consent(actor, grant) => {
                let key = self
                    .consent_datatype_key(&grant.key, &grant.consent, &input.datatype)
                    .await?;
                (key, grant.key.clone(), Some(actor.id().to_string()))
            }
        };

        let public = DataPublic {
            owner: input.owner.clone(),
            datatype: input.datatype.clone(),
            timestamp: input.timestamp,
            service: service.clone(),
        };
        let write = AssetWrite::new(kind.namespace(), id.clone(), &public)?
            .private(&DataPrivate { data: input.data }, &data_key)?
            .datatypes(vec![input.datatype.clone()])
            .connection(input.connection_id);
        self.put_asset(write, &[]).await?;
        self.put_index(kind.index(), &[&input.owner, &input.datatype, &ts], &id)?;

        let fields = LogFields {
            owner: Some(input.owner.clone()),
            target: service.clone(),
            service,
            datatype: Some(input.datatype.clone()),
            ..LogFields::default()
        };
        let receipt = UploadReceipt {
            id,
            owner: input.owner,
            datatype: input.datatype,
            timestamp: input.timestamp,
        };
        self.write_log(kind.namespace(), kind.upload_function(), fields, &receipt, &bound)
            .await?;
        info!(owner = %receipt.owner, datatype = %receipt.datatype, asset = %receipt.id, "data uploaded");
        Ok(receipt)
    }

    /// Download through the key graph, as the owner or under a consent.
    pub async fn download_data(
        &mut self,
        kind: DataKind,
        req: &DownloadRequest,
        function: &str,
    ) -> Result<Vec<DataRecord>> {
        self.datatype(&req.datatype).await?;
        let route = self
            .route(kind, &req.owner, &req.datatype, req.service.as_deref(), Access::Read)
            .await?;
        let (data_key, bound, service) = match &route {
            Route::Owner(owner) => {
                let sym = self.principal_sym(owner).await?;
                let key = self.datatype_key(&sym, &req.owner, &req.datatype).await?;
                (key, sym, None)
            }
            Route::Consent(actor, grant) => {
                let key = self
                    .consent_datatype_key(&grant.key, &grant.consent, &req.datatype)
                    .await?;
                (key, grant.key.clone(), Some(actor.id().to_string()))
            }
        };

        let records = self
            .collect_records(kind, &req.owner, &req.datatype, &data_key, &req.window)
            .await?;
        self.log_download(kind, function, &req.owner, &req.datatype, service, &records, &bound)
            .await?;
        Ok(records)
    }

    /// Download with a validation token issued to the caller.
    pub async fn download_with_token(
        &mut self,
        kind: DataKind,
        token: &str,
        req: &DownloadRequest,
        function: &str,
    ) -> Result<Vec<DataRecord>> {
        let token = self.decrypt_validation_token(token)?;
        if token.owner != req.owner {
            return Err(KernelError::NoAccess(format!("token does not cover {}", req.owner)));
        }
        let chain = self.datatype_chain(&req.datatype).await?;
        if !chain.contains(&token.consent_datatype) {
            return Err(KernelError::NoAccess(format!("token does not cover {}", req.datatype)));
        }

        let consent_key = token.consent_key()?;
        let record = self
            .require_record(
                Namespace::Consent,
                &consent_id(&token.consent_datatype, &token.target, &token.owner),
            )
            .await?;
        let consent = self.open_consent(&record, &consent_key).await?;
        if let Some(reason) = consent.refusal(Access::Read, self.now()) {
            return Err(KernelError::NoAccess(format!("{reason}: {}", consent.id)));
        }

        let data_key = self
            .consent_datatype_key(&consent_key, &consent, &req.datatype)
            .await?;
        let records = self
            .collect_records(kind, &req.owner, &req.datatype, &data_key, &req.window)
            .await?;
        self.log_download(
            kind,
            function,
            &req.owner,
            &req.datatype,
            Some(token.target.clone()),
            &records,
            &consent_key,
        )
        .await?;
        Ok(records)
    }

    /// Decide how the caller may touch `owner`'s data.
    async fn route(
        &mut self,
        kind: DataKind,
        owner: &str,
        datatype: &str,
        service: Option<&str>,
        access: Access,
    ) -> Result<Route> {
        if let Some(owner) = self.try_effective_caller(owner).await? {
            return Ok(Route::Owner(owner));
        }
        let Some(service) = service else {
            return Err(KernelError::NoAccess(format!(
                "{} is not {owner} and acts for no service",
                self.caller().id()
            )));
        };
        if kind == DataKind::Owner && access == Access::Write {
            return Err(KernelError::NoAccess(format!("only {owner} writes its own data")));
        }
        let actor = self.effective_caller(service).await?;
        if kind == DataKind::User {
            let status = self.enrollment_status(owner, service).await?;
            if status != Some(EnrollmentStatus::Active) {
                return Err(KernelError::BadState(format!(
                    "{owner} has no active enrollment in {service}"
                )));
            }
        }
        let grant = self.consent_grant(&actor, owner, datatype, access).await?;
        Ok(Route::Consent(actor, grant))
    }

    /// Records of `(owner, datatype)` in `window`, oldest first.
    ///
    /// `latest_only` and `max` keep the newest records; without either, more
    /// than `max_query_results` records in the window is a `bad-input`.
    pub(crate) async fn collect_records(
        &mut self,
        kind: DataKind,
        owner: &str,
        datatype: &str,
        key: &Key,
        window: &DataWindow,
    ) -> Result<Vec<DataRecord>> {
        let lo = window.start.map(ts_part).transpose()?;
        let hi = window.end.map(ts_part).transpose()?;
        let hits = self
            .scan_index_between(kind.index(), &[owner, datatype], lo.as_deref(), hi.as_deref())
            .await?;

        let wanted = if window.latest_only { Some(1) } else { window.max };
        let mut page = Page::requested(wanted, self.config.max_query_results);
        for hit in hits.into_iter().rev() {
            let Some(record) = self.get_record(kind.namespace(), &hit.asset_id).await? else {
                continue;
            };
            let public: DataPublic = record.public_as()?;
            let view = self.read_asset(&record, Some(key)).await?;
            let entry = DataRecord {
                id: record.id.clone(),
                owner: public.owner,
                datatype: public.datatype,
                timestamp: public.timestamp,
                service: public.service,
                data: view.private.and_then(|mut p| p.get_mut("data").map(Value::take)),
                offchain_unavailable: view.offchain_unavailable,
            };
            if !page.push(entry)? {
                break;
            }
        }
        let mut out = page.into_vec();
        out.reverse();
        Ok(out)
    }

    #[allow(clippy::too_many_arguments)]
    async fn log_download(
        &mut self,
        kind: DataKind,
        function: &str,
        owner: &str,
        datatype: &str,
        service: Option<String>,
        records: &[DataRecord],
        bound: &Key,
    ) -> Result<()> {
        let fields = LogFields {
            owner: Some(owner.to_string()),
            target: service.clone(),
            service,
            datatype: Some(datatype.to_string()),
            ..LogFields::default()
        };
        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        self.write_log(kind.namespace(), function, fields, &ids, bound)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::testing::{principal, Bench};

    fn input(owner: &str, timestamp: i64, service: Option<&str>) -> DataInput {
        DataInput {
            owner: owner.into(),
            datatype: "d1".into(),
            timestamp,
            data: json!({ "at": timestamp }),
            service: service.map(Into::into),
            connection_id: None,
        }
    }

    async fn owner_stamps(bench: &Bench, window: DataWindow) -> Result<Vec<i64>> {
        let s1 = principal("s1");
        let mut ctx = bench.ctx(&s1);
        let req = DownloadRequest {
            owner: "s1".into(),
            datatype: "d1".into(),
            service: None,
            window,
        };
        let records = ctx.download_data(DataKind::Owner, &req, "downloadOwnerData").await?;
        Ok(records.into_iter().map(|r| r.timestamp).collect())
    }

    #[test]
    fn test_data_id_separates_kinds() {
        assert_ne!(
            data_id(DataKind::User, "p1", "d1", 10),
            data_id(DataKind::Owner, "p1", "d1", 10)
        );
        assert_ne!(
            data_id(DataKind::User, "p1", "d1", 10),
            data_id(DataKind::User, "p1", "d1", 11)
        );
    }

    #[tokio::test]
    async fn test_owner_data_windows() {
        let mut bench = Bench::standard().await;
        let s1 = principal("s1");
        for ts in [10, 20, 30] {
            let mut ctx = bench.ctx(&s1);
            ctx.upload_data(DataKind::Owner, input("s1", ts, None)).await.unwrap();
            ctx.commit().await.unwrap();
        }

        let window = DataWindow::default;
        assert_eq!(owner_stamps(&bench, window()).await.unwrap(), [10, 20, 30]);
        let from = DataWindow { start: Some(15), ..window() };
        assert_eq!(owner_stamps(&bench, from).await.unwrap(), [20, 30]);
        let until = DataWindow { end: Some(20), ..window() };
        assert_eq!(owner_stamps(&bench, until).await.unwrap(), [10, 20]);
        let newest = DataWindow { max: Some(2), ..window() };
        assert_eq!(owner_stamps(&bench, newest).await.unwrap(), [20, 30]);
        let latest = DataWindow { latest_only: true, ..window() };
        assert_eq!(owner_stamps(&bench, latest).await.unwrap(), [30]);

        bench.config.max_query_results = 2;
        let err = owner_stamps(&bench, window()).await.unwrap_err();
        assert!(matches!(err, KernelError::BadInput(_)));
        let newest = DataWindow { max: Some(2), ..window() };
        assert_eq!(owner_stamps(&bench, newest).await.unwrap(), [20, 30]);
        let from = DataWindow { start: Some(15), ..window() };
        assert_eq!(owner_stamps(&bench, from).await.unwrap(), [20, 30]);
    }

    #[tokio::test]
    async fn test_upload_authorizes_before_duplicate_check() {
        let bench = Bench::standard().await;
        let s1 = principal("s1");
        let p1 = principal("p1");
        let u1 = principal("u1");

        let mut ctx = bench.ctx(&s1);
        ctx.upload_data(DataKind::Owner, input("s1", 10, None)).await.unwrap();
        ctx.commit().await.unwrap();
        let mut ctx = bench.ctx(&p1);
        ctx.upload_data(DataKind::User, input("p1", 10, None)).await.unwrap();
        ctx.commit().await.unwrap();

        let mut ctx = bench.ctx(&s1);
        let err = ctx.upload_data(DataKind::Owner, input("s1", 10, None)).await.unwrap_err();
        assert!(matches!(err, KernelError::BadState(_)));

        let mut ctx = bench.ctx(&u1);
        let err = ctx.upload_data(DataKind::User, input("p1", 10, Some("s1"))).await.unwrap_err();
        assert!(matches!(err, KernelError::NoAccess(_)));
        let err = ctx.upload_data(DataKind::User, input("p1", 10, None)).await.unwrap_err();
        assert!(matches!(err, KernelError::NoAccess(_)));

        let mut ctx = bench.ctx(&p1);
        let err = ctx.upload_data(DataKind::Owner, input("s1", 10, Some("s1"))).await.unwrap_err();
        assert!(matches!(err, KernelError::NoAccess(_)));
        let err = ctx.upload_data(DataKind::User, input("p1", -1, None)).await.unwrap_err();
        assert!(matches!(err, KernelError::BadInput(_)));
    }
}
