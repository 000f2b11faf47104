//! Registration of users, orgs, services and datatypes.
//!
//! Users and orgs live in the `user` namespace, services in `service`,
//! datatypes in `datatype`. Each principal's private key unlocks its
//! symmetric key, which protects its private profile. An org's private
//! key unlocks each of its services' private keys.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use consent_kernel_core::Namespace;
use consent_kernel_perms::{EdgeSource, EdgeStore, Key, KeyType};

use crate::asset::{AssetView, AssetWrite};
use crate::consent::Access;
use crate::context::Ctx;
use crate::error::{KernelError, Result};
use crate::log::LogFields;
use crate::principal::{datatype_key_id, priv_key_id, sym_key_id, validate_id, Principal, SecretBytes};

/// Longest parent chain a datatype may have.
const MAX_DATATYPE_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Patient,
    User,
    Auditor,
    Org,
    Service,
}

/// A user as submitted for registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInput {
    pub id: String,
    pub name: String,
    pub role: Role,
    #[serde(default)]
    pub org: Option<String>,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub data: Value,
}

/// Public half of a user or org.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPublic {
    pub id: String,
    pub name: String,
    pub role: Role,
    pub is_group: bool,
    #[serde(default)]
    pub org: Option<String>,
    /// Hex X25519 public key.
    pub public_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ProfilePrivate {
    email: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrgInput {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub email: String,
}

/// A datatype a service works with, and the access it asks patients for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDatatype {
    pub datatype: String,
    pub access: Vec<Access>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInput {
    pub id: String,
    pub name: String,
    pub org: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub datatypes: Vec<ServiceDatatype>,
    #[serde(default)]
    pub data: Value,
}

/// Public half of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePublic {
    pub id: String,
    pub name: String,
    pub org: String,
    pub is_group: bool,
    pub public_key: String,
    pub datatypes: Vec<ServiceDatatype>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Datatype {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parent: Option<String>,
}

/// What kind of principal an id names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrincipalKind {
    User(UserPublic),
    Service(ServicePublic),
}

impl PrincipalKind {
    pub fn is_service(&self) -> bool {
        matches!(self, PrincipalKind::Service(_))
    }

    pub fn is_patient(&self) -> bool {
        matches!(self, PrincipalKind::User(u) if u.role == Role::Patient)
    }
}

fn sym_from(id: &str, bytes: &SecretBytes) -> Result<Key> {
    Ok(Key::from_bytes(sym_key_id(id)?, KeyType::Sym, &bytes.decode()?)?)
}

impl<'a> Ctx<'a> {
    // ─────────────────────────────────────────────────────────────────────────
    // Registration
    // ─────────────────────────────────────────────────────────────────────────

    /// Register the caller as a user.
    pub async fn register_user(&mut self, user: UserInput, sym_key: &SecretBytes) -> Result<UserPublic> {
        validate_id(&user.id)?;
        let caller = self.caller();
        if caller.id() != user.id {
            return Err(KernelError::NoAccess(format!(
                "{} cannot register {}",
                caller.id(),
                user.id
            )));
        }
        if matches!(user.role, Role::Org | Role::Service) {
            return Err(KernelError::BadInput(format!(
                "use the dedicated call to register a {:?}",
                user.role
            )));
        }
        self.ensure_unregistered(&user.id).await?;

        let sym = sym_from(&user.id, sym_key)?;
        let public = UserPublic {
            id: user.id.clone(),
            name: user.name,
            role: user.role,
            is_group: false,
            org: user.org,
            public_key: hex::encode(caller.public_key()?.as_bytes()),
        };
        let private = ProfilePrivate {
            email: user.email,
            data: user.data,
        };
        let write = AssetWrite::new(Namespace::User, user.id.clone(), &public)?.private(&private, &sym)?;
        self.put_asset(write, &[EdgeSource::Key(caller.key())]).await?;

        let fields = LogFields {
            owner: Some(user.id.clone()),
            ..LogFields::default()
        };
        self.write_log(Namespace::User, "registerUser", fields, &public, &sym)
            .await?;
        info!(user = %user.id, "user registered");
        Ok(public)
    }

    /// Register an org. A caller other than the org becomes its admin.
    pub async fn register_org(
        &mut self,
        org: OrgInput,
        private_key: Option<&SecretBytes>,
        sym_key: &SecretBytes,
    ) -> Result<UserPublic> {
        validate_id(&org.id)?;
        self.ensure_unregistered(&org.id).await?;

        let caller = self.caller();
        let org_principal = if caller.id() == org.id {
            caller.clone()
        } else {
            let secret = private_key
                .ok_or_else(|| KernelError::BadInput("org private key required".into()))?
                .to_private()?;
            Principal::new(org.id.clone(), secret)?
        };
        let sym = sym_from(&org.id, sym_key)?;

        let public = UserPublic {
            id: org.id.clone(),
            name: org.name,
            role: Role::Org,
            is_group: true,
            org: None,
            public_key: hex::encode(org_principal.public_key()?.as_bytes()),
        };
        let private = ProfilePrivate {
            email: org.email,
            data: Value::Null,
        };
        let write = AssetWrite::new(Namespace::User, org.id.clone(), &public)?.private(&private, &sym)?;
        self.put_asset(write, &[EdgeSource::Key(org_principal.key())]).await?;

        if caller.id() != org.id {
            self.link(EdgeSource::Key(caller.key()), org_principal.key()).await?;
            self.link(EdgeSource::Key(caller.key()), &sym).await?;
            self.put_index(crate::index::GROUP_MEMBER, &[&org.id, caller.id()], caller.id())?;
        }

        let fields = LogFields {
            owner: Some(org.id.clone()),
            ..LogFields::default()
        };
        self.write_log(Namespace::User, "registerOrg", fields, &public, &sym)
            .await?;
        info!(org = %org.id, "org registered");
        Ok(public)
    }

    /// Register a service inside an org. The caller must be an org admin.
    pub async fn register_service(
        &mut self,
        service: ServiceInput,
        private_key: &SecretBytes,
        sym_key: &SecretBytes,
    ) -> Result<ServicePublic> {
        validate_id(&service.id)?;
        self.ensure_unregistered(&service.id).await?;
        match self.principal_kind(&service.org).await? {
            Some(PrincipalKind::User(u)) if u.role == Role::Org => {}
            _ => return Err(KernelError::NotFound(format!("org {}", service.org))),
        }
        let org = self.effective_caller(&service.org).await?;

        for entry in &service.datatypes {
            self.datatype(&entry.datatype).await?;
        }

        let svc = Principal::new(service.id.clone(), private_key.to_private()?)?;
        let sym = sym_from(&service.id, sym_key)?;
        let public = ServicePublic {
            id: service.id.clone(),
            name: service.name,
            org: service.org.clone(),
            is_group: true,
            public_key: hex::encode(svc.public_key()?.as_bytes()),
            datatypes: service.datatypes,
        };
        let private = ProfilePrivate {
            email: service.email,
            data: service.data,
        };
        let write = AssetWrite::new(Namespace::Service, service.id.clone(), &public)?.private(&private, &sym)?;
        self.put_asset(write, &[EdgeSource::Key(svc.key())]).await?;
        self.link(EdgeSource::Key(org.key()), svc.key()).await?;

        let fields = LogFields {
            owner: Some(service.org.clone()),
            service: Some(service.id.clone()),
            ..LogFields::default()
        };
        self.write_log(Namespace::Service, "registerService", fields, &public, &sym)
            .await?;
        info!(service = %service.id, org = %service.org, "service registered");
        Ok(public)
    }

    /// Register a datatype. Its parent must already exist.
    pub async fn register_datatype(&mut self, datatype: Datatype) -> Result<Datatype> {
        validate_id(&datatype.id)?;
        let caller = self.caller();
        if self.principal_kind(caller.id()).await?.is_none() {
            return Err(KernelError::NoAccess(format!("{} is not registered", caller.id())));
        }
        if self.asset_exists(Namespace::Datatype, &datatype.id).await? {
            return Err(KernelError::BadState(format!("datatype {} exists", datatype.id)));
        }
        if let Some(parent) = &datatype.parent {
            if parent == &datatype.id {
                return Err(KernelError::BadInput("datatype cannot be its own parent".into()));
            }
            self.datatype_chain(parent).await?;
        }

        let write = AssetWrite::new(Namespace::Datatype, datatype.id.clone(), &datatype)?;
        self.put_asset(write, &[]).await?;

        let sym = self.principal_sym(caller).await?;
        let fields = LogFields {
            datatype: Some(datatype.id.clone()),
            ..LogFields::default()
        };
        self.write_log(Namespace::Datatype, "registerDatatype", fields, &datatype, &sym)
            .await?;
        Ok(datatype)
    }

    async fn ensure_unregistered(&mut self, id: &str) -> Result<()> {
        if self.principal_kind(id).await?.is_some() {
            return Err(KernelError::BadState(format!("{id} is already registered")));
        }
        if self.get_key_info(&priv_key_id(id)?).await?.is_some()
            || self.get_key_info(&sym_key_id(id)?).await?.is_some()
        {
            return Err(KernelError::BadState(format!("keys of {id} already exist")));
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lookups
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn principal_kind(&mut self, id: &str) -> Result<Option<PrincipalKind>> {
        if let Some(record) = self.get_record(Namespace::User, id).await? {
            return Ok(Some(PrincipalKind::User(record.public_as()?)));
        }
        if let Some(record) = self.get_record(Namespace::Service, id).await? {
            return Ok(Some(PrincipalKind::Service(record.public_as()?)));
        }
        Ok(None)
    }

    pub async fn require_principal(&mut self, id: &str) -> Result<PrincipalKind> {
        self.principal_kind(id)
            .await?
            .ok_or_else(|| KernelError::NotFound(format!("principal {id}")))
    }

    pub async fn service_public(&mut self, id: &str) -> Result<ServicePublic> {
        self.require_record(Namespace::Service, id).await?.public_as()
    }

    /// Full profile; `no-access` unless the caller holds its key.
    pub async fn get_profile(&mut self, ns: Namespace, id: &str) -> Result<AssetView> {
        let view = self.get_asset(ns, id).await?;
        if view.private.is_none() && !view.offchain_unavailable {
            return Err(KernelError::NoAccess(format!("{} cannot read {ns}/{id}", self.caller().id())));
        }
        Ok(view)
    }

    pub async fn get_org(&mut self, id: &str) -> Result<AssetView> {
        match self.principal_kind(id).await? {
            Some(PrincipalKind::User(u)) if u.role == Role::Org => self.get_profile(Namespace::User, id).await,
            _ => Err(KernelError::NotFound(format!("org {id}"))),
        }
    }

    pub async fn datatype(&mut self, id: &str) -> Result<Datatype> {
        self.get_record(Namespace::Datatype, id)
            .await?
            .ok_or_else(|| KernelError::NotFound(format!("datatype {id}")))?
            .public_as()
    }

    /// The ancestry of `id`, root first, ending with `id`.
    pub async fn datatype_chain(&mut self, id: &str) -> Result<Vec<String>> {
        let mut chain = vec![id.to_string()];
        let mut current = self.datatype(id).await?;
        while let Some(parent) = current.parent.clone() {
            if chain.len() >= MAX_DATATYPE_DEPTH || chain.contains(&parent) {
                return Err(KernelError::Invariant(format!("datatype chain of {id} is malformed")));
            }
            current = self.datatype(&parent).await?;
            chain.push(parent);
        }
        chain.reverse();
        Ok(chain)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Datatype keys
    // ─────────────────────────────────────────────────────────────────────────

    /// The (owner, datatype) key, derived downward from `from`.
    ///
    /// `from` must be the owner's symmetric key or the key of `datatype`
    /// or one of its ancestors. Edges along the way are installed.
    pub async fn datatype_key(&mut self, from: &Key, owner: &str, datatype: &str) -> Result<Key> {
        let chain = self.datatype_chain(datatype).await?;

        let (mut current, rest) = if from.id() == &sym_key_id(owner)? {
            let root = &chain[0];
            let key = from.derive_sym(datatype_key_id(owner, root)?, datatype_info(root).as_bytes())?;
            self.link(EdgeSource::Key(from), &key).await?;
            (key, &chain[1..])
        } else {
            let mut position = None;
            for (i, name) in chain.iter().enumerate() {
                if from.id() == &datatype_key_id(owner, name)? {
                    position = Some(i);
                }
            }
            let i = position.ok_or_else(|| {
                KernelError::NoAccess(format!("{} does not lead to {owner}/{datatype}", from.id()))
            })?;
            (from.clone(), &chain[i + 1..])
        };

        for name in rest {
            let next = current.derive_sym(datatype_key_id(owner, name)?, datatype_info(name).as_bytes())?;
            self.link(EdgeSource::Key(&current), &next).await?;
            current = next;
        }
        Ok(current)
    }
}

fn datatype_info(datatype: &str) -> String {
    format!("datatype:{datatype}")
}
