//! Consents: who may read or write an owner's data of a datatype.
//!
//! A consent is an asset keyed by `(datatype, target, owner)`. Its key is
//! reachable from the owner's symmetric key and from the target's private
//! key, and it leads to the owner's datatype key, so whoever can open the
//! consent can open the data. Whether they may is decided here, at
//! validation time, from the option set: `deny` wins over `write`, which
//! wins over `read`. Revoking is writing `deny`; no edge is ever removed.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use consent_kernel_core::{derive_id, Namespace};
use consent_kernel_perms::{unwrap_edge, EdgeSource, EdgeStore, Key};

use crate::asset::{AssetRecord, AssetWrite};
use crate::context::Ctx;
use crate::enrollment::EnrollmentStatus;
use crate::error::{KernelError, Result};
use crate::index::{Page, CONSENT_OWNER, CONSENT_TARGET, ENROLL_USER};
use crate::log::LogFields;
use crate::principal::{datatype_key_id, priv_key_id, validate_id, KeySpec, Principal, SecretBytes};
use crate::registry::PrincipalKind;
use crate::token::ValidationToken;

/// Access a caller asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    Read,
    Write,
}

/// One option of a consent. Ordered by precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsentOption {
    Read,
    Write,
    Deny,
}

/// The option that decides a set.
pub fn dominant(options: &[ConsentOption]) -> Option<ConsentOption> {
    options.iter().copied().max()
}

/// Whether an option set allows `access`. Write access implies read.
pub fn permits(options: &[ConsentOption], access: Access) -> bool {
    match dominant(options) {
        Some(ConsentOption::Write) => true,
        Some(ConsentOption::Read) => access == Access::Read,
        Some(ConsentOption::Deny) | None => false,
    }
}

/// Which data a consent covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentKind {
    /// A patient's records, given to a service they are enrolled in.
    PatientData,
    /// Data owned by a service or org, given to another principal.
    OwnerData,
}

impl ConsentKind {
    fn function(&self) -> &'static str {
        match self {
            ConsentKind::PatientData => "putConsentPatientData",
            ConsentKind::OwnerData => "putConsentOwnerData",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentInput {
    pub owner: String,
    pub target: String,
    /// The service the consent is about. Defaults to the target; when it
    /// differs the consent is a reference consent.
    #[serde(default)]
    pub service: Option<String>,
    pub datatype: String,
    pub options: Vec<ConsentOption>,
    pub timestamp: i64,
    #[serde(default)]
    pub expiration: i64,
    #[serde(default)]
    pub connection_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ConsentPublic {
    owner: String,
    target: String,
    datatype: String,
    expiration: i64,
    #[serde(default)]
    connection_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ConsentPrivate {
    options: Vec<ConsentOption>,
    service: String,
    consent_date: i64,
}

/// A consent as returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Consent {
    pub id: String,
    pub owner: String,
    pub target: String,
    pub service: String,
    pub datatype: String,
    pub options: Vec<ConsentOption>,
    pub expiration: i64,
    pub consent_date: i64,
    #[serde(default)]
    pub connection_id: Option<String>,
}

impl Consent {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expiration > 0 && now > self.expiration
    }

    /// Why this consent does not allow `access` at `now`, if it doesn't.
    pub fn refusal(&self, access: Access, now: i64) -> Option<&'static str> {
        if dominant(&self.options) == Some(ConsentOption::Deny) {
            Some("consent denied")
        } else if !permits(&self.options, access) {
            Some("access not covered by consent")
        } else if self.is_expired(now) {
            Some("consent expired")
        } else {
            None
        }
    }
}

pub fn consent_id(datatype: &str, target: &str, owner: &str) -> String {
    derive_id("consent", &[datatype, target, owner])
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateRequest {
    pub owner: String,
    pub target: String,
    pub datatype: String,
    pub access: Access,
    /// Client time of the request; checked against the clock-skew window.
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// What a granted validation lets the holder read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRule {
    pub owner: String,
    pub datatype: String,
    /// Datatype the deciding consent was given for.
    pub consent_datatype: String,
    pub expiration: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub granted: bool,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub filter_rule: Option<FilterRule>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsentQuery {
    pub owner: Option<String>,
    pub target: Option<String>,
    pub datatype: Option<String>,
}

/// A datatype a service asks a patient for, with the current answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentRequest {
    pub service: String,
    pub service_name: String,
    pub datatype: String,
    pub access: Vec<Access>,
    pub consent: Option<Consent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryLog {
    pub owner: String,
    pub target: String,
    pub datatype: String,
    #[serde(default)]
    pub query: Value,
}

/// A consent the caller opened, with its key.
pub(crate) struct ConsentGrant {
    pub consent: Consent,
    pub key: Key,
}

impl<'a> Ctx<'a> {
    // ─────────────────────────────────────────────────────────────────────────
    // Write path
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn put_consent(
        &mut self,
        kind: ConsentKind,
        input: ConsentInput,
        key: Option<&KeySpec>,
    ) -> Result<Consent> {
        validate_id(&input.owner)?;
        validate_id(&input.target)?;
        validate_id(&input.datatype)?;
        if input.options.is_empty() {
            return Err(KernelError::BadInput("consent needs at least one option".into()));
        }
        let owner = self.effective_caller(&input.owner).await?;
        if input.owner == input.target {
            return Err(KernelError::BadInput("owner cannot consent to itself".into()));
        }
        self.check_skew(input.timestamp)?;
        if input.expiration > 0 && input.expiration < input.timestamp {
            return Err(KernelError::BadInput(format!(
                "expiration {} precedes timestamp {}",
                input.expiration, input.timestamp
            )));
        }

        let service = input.service.clone().unwrap_or_else(|| input.target.clone());
        let mut options = input.options.clone();
        options.sort();
        options.dedup();
        if service != input.target && options.contains(&ConsentOption::Write) {
            return Err(KernelError::BadInput(format!(
                "reference consent to {} for {service} cannot grant write",
                input.target
            )));
        }

        self.datatype(&input.datatype).await?;
        self.require_principal(&input.target).await?;
        if !self.require_principal(&service).await?.is_service() {
            return Err(KernelError::NotFound(format!("service {service}")));
        }
        let owner_kind = self.require_principal(&input.owner).await?;
        match kind {
            ConsentKind::PatientData => {
                if !owner_kind.is_patient() {
                    return Err(KernelError::BadInput(format!("{} is not a patient", input.owner)));
                }
                self.check_enrollment_for_consent(&input.owner, &service, &options)
                    .await?;
            }
            ConsentKind::OwnerData => {
                if owner_kind.is_patient() {
                    return Err(KernelError::BadInput(format!(
                        "patient data of {} needs a patient consent",
                        input.owner
                    )));
                }
            }
        }

        let id = consent_id(&input.datatype, &input.target, &input.owner);
        let consent_key = match self.get_record(Namespace::Consent, &id).await? {
            Some(record) => {
                let key_id = record_key_id(&record)?;
                if let Some(spec) = key {
                    if spec.id != key_id.as_str() {
                        return Err(KernelError::BadState(format!(
                            "consent {id} is already keyed by {key_id}"
                        )));
                    }
                }
                self.require_key(owner.key(), &key_id).await?
            }
            None => {
                let key = key
                    .ok_or_else(|| KernelError::BadInput("new consent requires a key".into()))?
                    .to_key()?;
                self.ensure_fresh_key(&key).await?;
                key
            }
        };

        let consent = Consent {
            id: id.clone(),
            owner: input.owner.clone(),
            target: input.target.clone(),
            service,
            datatype: input.datatype.clone(),
            options,
            expiration: input.expiration,
            consent_date: self.now(),
            connection_id: input.connection_id.clone(),
        };
        let public = ConsentPublic {
            owner: consent.owner.clone(),
            target: consent.target.clone(),
            datatype: consent.datatype.clone(),
            expiration: consent.expiration,
            connection_id: consent.connection_id.clone(),
        };
        let private = ConsentPrivate {
            options: consent.options.clone(),
            service: consent.service.clone(),
            consent_date: consent.consent_date,
        };

        let owner_sym = self.principal_sym(&owner).await?;
        let write = AssetWrite::new(Namespace::Consent, id.clone(), &public)?
            .private(&private, &consent_key)?
            .datatypes(vec![consent.datatype.clone()])
            .connection(consent.connection_id.clone());
        self.put_asset(write, &[EdgeSource::Key(&owner_sym)]).await?;

        self.link_sealed(&priv_key_id(&consent.target)?, &consent_key).await?;
        let dt_key = self
            .datatype_key(&owner_sym, &consent.owner, &consent.datatype)
            .await?;
        self.link(EdgeSource::Key(&consent_key), &dt_key).await?;
        self.link(EdgeSource::Key(&owner_sym.log_key()?), &consent_key.log_key()?)
            .await?;

        self.put_index(CONSENT_OWNER, &[&consent.owner, &consent.datatype, &consent.target], &id)?;
        self.put_index(CONSENT_TARGET, &[&consent.target, &consent.datatype, &consent.owner], &id)?;

        let fields = LogFields {
            owner: Some(consent.owner.clone()),
            target: Some(consent.target.clone()),
            service: Some(consent.service.clone()),
            datatype: Some(consent.datatype.clone()),
            ..LogFields::default()
        };
        let data = json!({ "options": consent.options, "expiration": consent.expiration });
        self.write_log(Namespace::Consent, kind.function(), fields, &data, &consent_key)
            .await?;
        info!(owner = %consent.owner, target = %consent.target, datatype = %consent.datatype, "consent stored");
        Ok(consent)
    }

    async fn check_enrollment_for_consent(
        &mut self,
        owner: &str,
        service: &str,
        options: &[ConsentOption],
    ) -> Result<()> {
        match self.enrollment_status(owner, service).await? {
            None if options.iter().any(|o| *o != ConsentOption::Deny) => Err(KernelError::BadState(format!(
                "{owner} is not enrolled in {service}; only deny is allowed"
            ))),
            Some(status) if status != EnrollmentStatus::Active && options.contains(&ConsentOption::Write) => {
                Err(KernelError::BadState(format!(
                    "write consent needs an active enrollment of {owner} in {service}"
                )))
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn check_skew(&self, timestamp: i64) -> Result<()> {
        let skew = self.config().consent_clock_skew_secs;
        if timestamp.abs_diff(self.now()) > skew.unsigned_abs() {
            return Err(KernelError::Expired(format!(
                "timestamp {timestamp} is more than {skew}s from {}",
                self.now()
            )));
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lookup
    // ─────────────────────────────────────────────────────────────────────────

    /// The consent that decides `(owner, target, datatype)`: the one for
    /// the datatype itself or its nearest ancestor.
    pub(crate) async fn find_consent_record(
        &mut self,
        owner: &str,
        target: &str,
        datatype: &str,
    ) -> Result<Option<AssetRecord>> {
        let chain = self.datatype_chain(datatype).await?;
        for name in chain.iter().rev() {
            if let Some(record) = self
                .get_record(Namespace::Consent, &consent_id(name, target, owner))
                .await?
            {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    pub(crate) async fn open_consent(&mut self, record: &AssetRecord, key: &Key) -> Result<Consent> {
        let public: ConsentPublic = record.public_as()?;
        let private: ConsentPrivate = self
            .read_private(record, key)
            .await?
            .ok_or_else(|| KernelError::Invariant(format!("consent {} has no private half", record.id)))?;
        Ok(Consent {
            id: record.id.clone(),
            owner: public.owner,
            target: public.target,
            service: private.service,
            datatype: public.datatype,
            options: private.options,
            expiration: public.expiration,
            consent_date: private.consent_date,
            connection_id: public.connection_id,
        })
    }

    /// Open the consent letting `actor` use `owner`'s `datatype` data.
    ///
    /// `no-access` unless a consent exists, the actor can reach its key
    /// and it allows `access` now.
    pub(crate) async fn consent_grant(
        &mut self,
        actor: &Principal,
        owner: &str,
        datatype: &str,
        access: Access,
    ) -> Result<ConsentGrant> {
        let record = self
            .find_consent_record(owner, actor.id(), datatype)
            .await?
            .ok_or_else(|| KernelError::NoAccess(format!("no consent from {owner} to {} for {datatype}", actor.id())))?;
        let key_id = record_key_id(&record)?;
        let key = self
            .derive(actor.key(), &key_id)
            .await?
            .ok_or_else(|| KernelError::NoAccess(format!("{} cannot open consent {}", actor.id(), record.id)))?;
        let consent = self.open_consent(&record, &key).await?;
        if let Some(reason) = consent.refusal(access, self.now()) {
            return Err(KernelError::NoAccess(format!("{reason}: {}", consent.id)));
        }
        self.link_target_log(actor, &key).await?;
        Ok(ConsentGrant { consent, key })
    }

    /// Give a service target's log key a path to the consent log, so its
    /// auditors see activity under the consent.
    pub(crate) async fn link_target_log(&mut self, target: &Principal, consent_key: &Key) -> Result<()> {
        let is_service = self
            .principal_kind(target.id())
            .await?
            .map_or(false, |k| k.is_service());
        if !is_service {
            return Ok(());
        }
        let target_log = self.principal_sym(target).await?.log_key()?;
        if self.link(EdgeSource::Key(&target_log), &consent_key.log_key()?).await? {
            debug!(target = %target.id(), consent = %consent_key.id(), "target log linked to consent log");
        }
        Ok(())
    }

    /// The owner's key for `datatype`, reached through a consent key.
    ///
    /// Follows the single stored edge from the consent key to the datatype
    /// key the consent was given for, then derives down to `datatype`.
    pub(crate) async fn consent_datatype_key(
        &mut self,
        consent_key: &Key,
        consent: &Consent,
        datatype: &str,
    ) -> Result<Key> {
        let dt_id = datatype_key_id(&consent.owner, &consent.datatype)?;
        let wrapped = self.get_edge(consent_key.id(), &dt_id).await?.ok_or_else(|| {
            KernelError::Invariant(format!("consent {} does not lead to its datatype key", consent.id))
        })?;
        let dt_key = unwrap_edge(consent_key, &dt_id, &wrapped)?;
        self.datatype_key(&dt_key, &consent.owner, datatype).await
    }

    pub async fn get_consent(&mut self, owner: &str, target: &str, datatype: &str) -> Result<Consent> {
        let record = self
            .require_record(Namespace::Consent, &consent_id(datatype, target, owner))
            .await?;
        let key = self
            .asset_key(&record)
            .await?
            .ok_or_else(|| KernelError::NoAccess(format!("{} cannot read consent {}", self.caller().id(), record.id)))?;
        self.open_consent(&record, &key).await
    }

    /// Consents by owner or by target; those the caller cannot open are
    /// left out.
    pub async fn get_consents(&mut self, query: &ConsentQuery) -> Result<Vec<Consent>> {
        let hits = match (&query.owner, &query.target) {
            (Some(owner), _) => {
                let mut prefix = vec![owner.as_str()];
                prefix.extend(query.datatype.as_deref());
                self.scan_index(CONSENT_OWNER, &prefix).await?
            }
            (None, Some(target)) => {
                let mut prefix = vec![target.as_str()];
                prefix.extend(query.datatype.as_deref());
                self.scan_index(CONSENT_TARGET, &prefix).await?
            }
            (None, None) => return Err(KernelError::BadInput("owner or target required".into())),
        };

        let mut page = Page::strict(self.config.max_query_results);
        for hit in hits {
            let Some(record) = self.get_record(Namespace::Consent, &hit.asset_id).await? else {
                continue;
            };
            let Some(key) = self.asset_key(&record).await? else {
                continue;
            };
            let consent = self.open_consent(&record, &key).await?;
            if query.target.as_ref().map_or(true, |t| *t == consent.target) {
                page.push(consent)?;
            }
        }
        Ok(page.into_vec())
    }

    /// For each service `user` is actively enrolled in, the datatypes it
    /// asks for and the consent currently given.
    pub async fn get_all_consent_requests(&mut self, user: &str) -> Result<Vec<ConsentRequest>> {
        self.effective_caller(user).await?;
        let hits = self.scan_index(ENROLL_USER, &[user]).await?;

        let mut out = Vec::new();
        for hit in hits {
            let (Some(service), Some(status)) = (hit.parts.get(1), hit.parts.get(2)) else {
                continue;
            };
            if status != EnrollmentStatus::Active.as_str() {
                continue;
            }
            let Some(PrincipalKind::Service(profile)) = self.principal_kind(service).await? else {
                continue;
            };
            for wanted in &profile.datatypes {
                let consent = match self
                    .get_record(Namespace::Consent, &consent_id(&wanted.datatype, service, user))
                    .await?
                {
                    Some(record) => match self.asset_key(&record).await? {
                        Some(key) => Some(self.open_consent(&record, &key).await?),
                        None => None,
                    },
                    None => None,
                };
                out.push(ConsentRequest {
                    service: profile.id.clone(),
                    service_name: profile.name.clone(),
                    datatype: wanted.datatype.clone(),
                    access: wanted.access.clone(),
                    consent,
                });
            }
        }
        Ok(out)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Validation
    // ─────────────────────────────────────────────────────────────────────────

    /// Decide whether the caller, acting for `target`, may use `owner`'s
    /// data. Always writes one log record.
    pub async fn validate_consent(&mut self, req: &ValidateRequest) -> Result<ValidationResult> {
        if let Some(ts) = req.timestamp {
            self.check_skew(ts)?;
        }
        let now = self.now();
        let target = self.try_effective_caller(&req.target).await?;

        let mut consent_key = None;
        let mut service = None;
        let outcome = match self.find_consent_record(&req.owner, &req.target, &req.datatype).await? {
            None => Err("no consent"),
            Some(record) => match self.derive_from_caller(&record_key_id(&record)?).await? {
                None => Err("no key path to consent"),
                Some(key) => {
                    let consent = self.open_consent(&record, &key).await?;
                    service = Some(consent.service.clone());
                    consent_key = Some(key);
                    match consent.refusal(req.access, now) {
                        Some(reason) => Err(reason),
                        None => Ok(consent),
                    }
                }
            },
        };

        let result = match (&outcome, &consent_key) {
            (Ok(consent), Some(key)) => {
                let token = ValidationToken {
                    owner: req.owner.clone(),
                    target: req.target.clone(),
                    datatype: req.datatype.clone(),
                    consent_datatype: consent.datatype.clone(),
                    access: req.access,
                    timestamp: now,
                    consent_key_id: key.id().clone(),
                    consent_key: SecretBytes::encode(&key.to_bytes()),
                };
                if let Some(target) = &target {
                    self.link_target_log(target, key).await?;
                }
                ValidationResult {
                    granted: true,
                    token: Some(token.seal(self.caller())?),
                    filter_rule: Some(FilterRule {
                        owner: req.owner.clone(),
                        datatype: req.datatype.clone(),
                        consent_datatype: consent.datatype.clone(),
                        expiration: consent.expiration,
                    }),
                    message: "granted".into(),
                }
            }
            (Err(reason), _) => ValidationResult {
                granted: false,
                token: None,
                filter_rule: None,
                message: (*reason).to_string(),
            },
            (Ok(_), None) => return Err(KernelError::Invariant("granted consent without key".into())),
        };

        let bound = match consent_key {
            Some(key) => key,
            None => self.fallback_log_key(target.as_ref()).await?,
        };
        let fields = LogFields {
            owner: Some(req.owner.clone()),
            target: Some(req.target.clone()),
            service: service.or_else(|| Some(req.target.clone())),
            datatype: Some(req.datatype.clone()),
            ..LogFields::default()
        };
        let data = json!({ "access": req.access, "granted": result.granted, "message": result.message });
        self.write_log(Namespace::Consent, "validateConsent", fields, &data, &bound)
            .await?;
        Ok(result)
    }

    /// Key to bind a log to when no consent key is at hand: the target's
    /// symmetric key if the caller acts for it, else the caller's own.
    async fn fallback_log_key(&mut self, target: Option<&Principal>) -> Result<Key> {
        let anchor = target.unwrap_or(self.caller()).clone();
        let sym_id = anchor.sym_key_id()?;
        self.derive(anchor.key(), &sym_id)
            .await?
            .ok_or_else(|| KernelError::NoAccess(format!("{} is not registered", anchor.id())))
    }

    /// Record a query made under a consent the caller holds.
    pub async fn add_validate_consent_query_log(&mut self, entry: &QueryLog) -> Result<String> {
        let record = self
            .find_consent_record(&entry.owner, &entry.target, &entry.datatype)
            .await?
            .ok_or_else(|| KernelError::NotFound(format!("consent of {} to {}", entry.owner, entry.target)))?;
        let key = self.require_key(self.caller().key(), &record_key_id(&record)?).await?;
        let consent = self.open_consent(&record, &key).await?;
        let fields = LogFields {
            owner: Some(entry.owner.clone()),
            target: Some(entry.target.clone()),
            service: Some(consent.service.clone()),
            datatype: Some(entry.datatype.clone()),
            ..LogFields::default()
        };
        self.write_log(Namespace::Consent, "addValidateConsentQueryLog", fields, &entry.query, &key)
            .await
    }

    /// Open a validation token issued to the caller.
    pub fn decrypt_validation_token(&self, token: &str) -> Result<ValidationToken> {
        let token = ValidationToken::open(token, self.caller())?;
        token.check_fresh(self.now(), self.config().token_ttl_secs)?;
        Ok(token)
    }
}

pub(crate) fn record_key_id(record: &AssetRecord) -> Result<consent_kernel_core::KeyId> {
    record
        .key_id
        .clone()
        .ok_or_else(|| KernelError::Invariant(format!("{}/{} has no key", record.namespace, record.id)))
}
