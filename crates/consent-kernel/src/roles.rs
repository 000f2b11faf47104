//! Group membership, admin rights and auditor permissions.
//!
//! Every role is a key edge. A member of a group holds an edge to the
//! group's symmetric key, an admin one to its private key. An auditor
//! holds an edge to an audit-permission key, which in turn reaches the
//! log keys of a service and of the consents given to it, but never a
//! data key.

use serde::{Deserialize, Serialize};
use tracing::info;

use consent_kernel_core::{derive_id, Namespace};
use consent_kernel_perms::{EdgeSource, Key};

use crate::asset::{AssetView, AssetWrite};
use crate::consent::record_key_id;
use crate::context::Ctx;
use crate::error::{KernelError, Result};
use crate::index::{AUDIT_SERVICE, CONSENT_TARGET, GROUP_MEMBER};
use crate::log::LogFields;
use crate::principal::{priv_key_id, KeySpec};
use crate::registry::{PrincipalKind, Role, ServicePublic};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub user: String,
    pub group: String,
    #[serde(default)]
    pub admin: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditorGrant {
    pub auditor: String,
    pub service: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct AuditPublic {
    auditor: String,
    service: String,
    granted_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct AuditPrivate {
    granted_by: String,
    consents: Vec<String>,
}

pub fn audit_permission_id(auditor: &str, service: &str) -> String {
    derive_id("audit-permission", &[auditor, service])
}

impl<'a> Ctx<'a> {
    // ─────────────────────────────────────────────────────────────────────────
    // Orgs
    // ─────────────────────────────────────────────────────────────────────────

    /// Make `user` a member of `org`, and an admin if asked.
    pub async fn put_user_in_org(&mut self, m: &Membership) -> Result<()> {
        self.require_org(&m.group).await?;
        self.require_principal(&m.user).await?;
        let org = self.effective_caller(&m.group).await?;
        let org_sym = self.principal_sym(&org).await?;

        let user_priv = priv_key_id(&m.user)?;
        self.link_sealed(&user_priv, &org_sym).await?;
        if m.admin {
            self.link_sealed(&user_priv, org.key()).await?;
        }
        self.put_index(GROUP_MEMBER, &[&m.group, &m.user], &m.user)?;

        self.log_role("putUserInOrg", &m.group, &m.user, m, &org_sym).await?;
        info!(user = %m.user, org = %m.group, admin = m.admin, "user added to org");
        Ok(())
    }

    pub async fn remove_user_from_org(&mut self, m: &Membership) -> Result<()> {
        self.require_org(&m.group).await?;
        if m.user == m.group {
            return Err(KernelError::BadInput("an org cannot leave itself".into()));
        }
        let org = self.effective_caller(&m.group).await?;
        let org_sym = self.principal_sym(&org).await?;

        let user_priv = priv_key_id(&m.user)?;
        let member = self.unlink(&user_priv, org_sym.id()).await?;
        let admin = self.unlink(&user_priv, org.key().id()).await?;
        if !member && !admin {
            return Err(KernelError::NotFound(format!("{} is not in {}", m.user, m.group)));
        }
        self.delete_index(GROUP_MEMBER, &[&m.group, &m.user])?;

        self.log_role("removeUserFromOrg", &m.group, &m.user, m, &org_sym)
            .await?;
        info!(user = %m.user, org = %m.group, "user removed from org");
        Ok(())
    }

    pub async fn add_org_admin(&mut self, m: &Membership) -> Result<()> {
        self.require_org(&m.group).await?;
        self.require_principal(&m.user).await?;
        let org = self.effective_caller(&m.group).await?;
        let org_sym = self.principal_sym(&org).await?;
        self.link_sealed(&priv_key_id(&m.user)?, org.key()).await?;
        self.log_role("addPermissionOrgAdmin", &m.group, &m.user, m, &org_sym)
            .await
    }

    pub async fn remove_org_admin(&mut self, m: &Membership) -> Result<()> {
        self.require_org(&m.group).await?;
        let org = self.effective_caller(&m.group).await?;
        let org_sym = self.principal_sym(&org).await?;
        if !self.unlink(&priv_key_id(&m.user)?, org.key().id()).await? {
            return Err(KernelError::NotFound(format!("{} is not an admin of {}", m.user, m.group)));
        }
        self.log_role("removePermissionOrgAdmin", &m.group, &m.user, m, &org_sym)
            .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Services
    // ─────────────────────────────────────────────────────────────────────────

    /// Grant service admin. Org admins of the enclosing org and existing
    /// service admins may do this.
    pub async fn add_service_admin(&mut self, m: &Membership) -> Result<()> {
        self.require_service(&m.group).await?;
        self.require_principal(&m.user).await?;
        let service = self.effective_caller(&m.group).await?;
        let service_sym = self.principal_sym(&service).await?;
        self.link_sealed(&priv_key_id(&m.user)?, service.key()).await?;
        self.put_index(GROUP_MEMBER, &[&m.group, &m.user], &m.user)?;
        self.log_role("addPermissionServiceAdmin", &m.group, &m.user, m, &service_sym)
            .await?;
        info!(user = %m.user, service = %m.group, "service admin added");
        Ok(())
    }

    pub async fn remove_service_admin(&mut self, m: &Membership) -> Result<()> {
        let profile = self.require_service(&m.group).await?;
        if m.user == profile.org {
            return Err(KernelError::BadInput("the owning org stays admin of its service".into()));
        }
        let service = self.effective_caller(&m.group).await?;
        let service_sym = self.principal_sym(&service).await?;
        if !self.unlink(&priv_key_id(&m.user)?, service.key().id()).await? {
            return Err(KernelError::NotFound(format!("{} is not an admin of {}", m.user, m.group)));
        }
        self.delete_index(GROUP_MEMBER, &[&m.group, &m.user])?;
        self.log_role("removePermissionServiceAdmin", &m.group, &m.user, m, &service_sym)
            .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Auditors
    // ─────────────────────────────────────────────────────────────────────────

    /// Let `auditor` read the logs of `service` and of the consents given
    /// to it.
    pub async fn add_auditor_permission(&mut self, grant: &AuditorGrant, key: &KeySpec) -> Result<AssetView> {
        self.require_service(&grant.service).await?;
        match self.require_principal(&grant.auditor).await? {
            PrincipalKind::User(u) if !u.is_group => {}
            _ => return Err(KernelError::BadInput(format!("{} cannot audit", grant.auditor))),
        }
        let service = self.effective_caller(&grant.service).await?;
        let service_sym = self.principal_sym(&service).await?;

        let id = audit_permission_id(&grant.auditor, &grant.service);
        if self.asset_exists(Namespace::AuditPermission, &id).await? {
            return Err(KernelError::BadState(format!(
                "{} already audits {}",
                grant.auditor, grant.service
            )));
        }
        let perm_key = key.to_key()?;
        self.ensure_fresh_key(&perm_key).await?;

        self.link(EdgeSource::Key(&perm_key), &service_sym.log_key()?)
            .await?;
        let mut consents = Vec::new();
        for hit in self.scan_index(CONSENT_TARGET, &[&grant.service]).await? {
            let Some(record) = self.get_record(Namespace::Consent, &hit.asset_id).await? else {
                continue;
            };
            let Some(consent_key) = self.derive(service.key(), &record_key_id(&record)?).await? else {
                continue;
            };
            self.link(EdgeSource::Key(&perm_key), &consent_key.log_key()?)
                .await?;
            consents.push(record.id.clone());
        }

        let public = AuditPublic {
            auditor: grant.auditor.clone(),
            service: grant.service.clone(),
            granted_at: self.now(),
        };
        let private = AuditPrivate {
            granted_by: self.caller().id().to_string(),
            consents,
        };
        let write = AssetWrite::new(Namespace::AuditPermission, id.clone(), &public)?.private(&private, &perm_key)?;
        self.put_asset(write, &[EdgeSource::Key(&service_sym)]).await?;
        self.link_sealed(&priv_key_id(&grant.auditor)?, &perm_key).await?;
        self.put_index(AUDIT_SERVICE, &[&grant.service, &grant.auditor], &id)?;

        let fields = LogFields {
            owner: Some(grant.service.clone()),
            target: Some(grant.auditor.clone()),
            service: Some(grant.service.clone()),
            ..LogFields::default()
        };
        self.write_log(Namespace::AuditPermission, "addAuditorPermission", fields, &public, &service_sym)
            .await?;
        info!(auditor = %grant.auditor, service = %grant.service, "auditor permission granted");
        self.get_asset(Namespace::AuditPermission, &id).await
    }

    /// Withdraw an auditor permission. The auditor's only edge into the
    /// permission key goes, so every log it reached goes dark at once.
    pub async fn remove_auditor_permission(&mut self, grant: &AuditorGrant) -> Result<()> {
        let id = audit_permission_id(&grant.auditor, &grant.service);
        let record = self.require_record(Namespace::AuditPermission, &id).await?;
        let service = self.effective_caller(&grant.service).await?;
        let service_sym = self.principal_sym(&service).await?;

        let perm_key_id = record_key_id(&record)?;
        self.unlink(&priv_key_id(&grant.auditor)?, &perm_key_id).await?;
        self.delete_asset(Namespace::AuditPermission, &id);
        self.delete_index(AUDIT_SERVICE, &[&grant.service, &grant.auditor])?;

        let fields = LogFields {
            owner: Some(grant.service.clone()),
            target: Some(grant.auditor.clone()),
            service: Some(grant.service.clone()),
            ..LogFields::default()
        };
        self.write_log(Namespace::AuditPermission, "removeAuditorPermission", fields, grant, &service_sym)
            .await?;
        info!(auditor = %grant.auditor, service = %grant.service, "auditor permission removed");
        Ok(())
    }

    pub async fn get_auditor_permission(&mut self, grant: &AuditorGrant) -> Result<AssetView> {
        self.get_asset(Namespace::AuditPermission, &audit_permission_id(&grant.auditor, &grant.service))
            .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Helpers
    // ─────────────────────────────────────────────────────────────────────────

    async fn require_org(&mut self, id: &str) -> Result<()> {
        match self.principal_kind(id).await? {
            Some(PrincipalKind::User(u)) if u.role == Role::Org => Ok(()),
            _ => Err(KernelError::NotFound(format!("org {id}"))),
        }
    }

    async fn require_service(&mut self, id: &str) -> Result<ServicePublic> {
        match self.principal_kind(id).await? {
            Some(PrincipalKind::Service(s)) => Ok(s),
            _ => Err(KernelError::NotFound(format!("service {id}"))),
        }
    }

    async fn log_role(
        &mut self,
        function: &str,
        group: &str,
        user: &str,
        data: &Membership,
        group_sym: &Key,
    ) -> Result<()> {
        let fields = LogFields {
            owner: Some(group.to_string()),
            target: Some(user.to_string()),
            ..LogFields::default()
        };
        self.write_log(Namespace::User, function, fields, data, group_sym)
            .await?;
        Ok(())
    }
}
