//! Patient enrollment in a service.
//!
//! An enrollment is created by an admin of the service and carries its
//! own key. The service reaches it through its symmetric key, the
//! patient through their private key. Unenrolling flips the status and
//! keeps the asset.

use serde::{Deserialize, Serialize};
use tracing::info;

use consent_kernel_core::{derive_id, Namespace};
use consent_kernel_perms::{EdgeSource, Key};

use crate::asset::{AssetRecord, AssetWrite};
use crate::context::Ctx;
use crate::error::{KernelError, Result};
use crate::index::{IndexHit, Page, ENROLL_SERVICE, ENROLL_USER};
use crate::log::LogFields;
use crate::principal::{priv_key_id, KeySpec};
use crate::registry::PrincipalKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrollmentStatus {
    Active,
    Inactive,
}

impl EnrollmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentStatus::Active => "active",
            EnrollmentStatus::Inactive => "inactive",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentInput {
    pub user: String,
    pub service: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct EnrollmentPublic {
    user: String,
    service: String,
    status: EnrollmentStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct EnrollmentPrivate {
    enroll_date: i64,
}

/// An enrollment as returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: String,
    pub user: String,
    pub service: String,
    pub status: EnrollmentStatus,
    pub enroll_date: i64,
}

pub fn enrollment_id(user: &str, service: &str) -> String {
    derive_id("enrollment", &[user, service])
}

impl<'a> Ctx<'a> {
    /// Status of the `(user, service)` enrollment, if one exists.
    pub async fn enrollment_status(&mut self, user: &str, service: &str) -> Result<Option<EnrollmentStatus>> {
        match self.get_record(Namespace::Enrollment, &enrollment_id(user, service)).await? {
            Some(record) => Ok(Some(record.public_as::<EnrollmentPublic>()?.status)),
            None => Ok(None),
        }
    }

    pub async fn enroll_patient(&mut self, input: EnrollmentInput, key: Option<&KeySpec>) -> Result<Enrollment> {
        let service = self.effective_caller(&input.service).await?;
        if !service_kind(self.principal_kind(&input.service).await?) {
            return Err(KernelError::NotFound(format!("service {}", input.service)));
        }
        match self.principal_kind(&input.user).await? {
            Some(kind) if kind.is_patient() => {}
            Some(_) => return Err(KernelError::BadInput(format!("{} is not a patient", input.user))),
            None => return Err(KernelError::NotFound(format!("user {}", input.user))),
        }

        let id = enrollment_id(&input.user, &input.service);
        let service_sym = self.principal_sym(&service).await?;

        let enroll_key = match self.get_record(Namespace::Enrollment, &id).await? {
            Some(record) => {
                let public: EnrollmentPublic = record.public_as()?;
                if public.status == EnrollmentStatus::Active {
                    return Err(KernelError::BadState(format!(
                        "{} is already enrolled in {}",
                        input.user, input.service
                    )));
                }
                let key = self.enrollment_key(&record, &service_sym).await?;
                self.delete_enrollment_indexes(&public)?;
                key
            }
            None => {
                let key = key
                    .ok_or_else(|| KernelError::BadInput("new enrollment requires a key".into()))?
                    .to_key()?;
                self.ensure_fresh_key(&key).await?;
                key
            }
        };
        let enroll_date = self.now();

        let enrollment = self
            .store_enrollment(&id, &input.user, &input.service, EnrollmentStatus::Active, enroll_date, &enroll_key, &service_sym)
            .await?;

        let fields = LogFields {
            owner: Some(input.user.clone()),
            target: Some(input.service.clone()),
            service: Some(input.service.clone()),
            ..LogFields::default()
        };
        self.write_log(Namespace::Enrollment, "enrollPatient", fields, &enrollment, &enroll_key)
            .await?;
        info!(user = %input.user, service = %input.service, "patient enrolled");
        Ok(enrollment)
    }

    /// Mark an enrollment inactive. Callable by a service admin or by the
    /// enrolled patient.
    pub async fn unenroll_patient(&mut self, input: EnrollmentInput) -> Result<Enrollment> {
        let id = enrollment_id(&input.user, &input.service);
        let record = self.require_record(Namespace::Enrollment, &id).await?;
        let public: EnrollmentPublic = record.public_as()?;
        if public.status == EnrollmentStatus::Inactive {
            return Err(KernelError::BadState(format!(
                "{} is not enrolled in {}",
                input.user, input.service
            )));
        }

        let key_id = record
            .key_id
            .clone()
            .ok_or_else(|| KernelError::Invariant(format!("enrollment {id} has no key")))?;
        let actor = if self.caller().id() == input.user {
            self.caller().clone()
        } else {
            self.effective_caller(&input.service).await?
        };
        let enroll_key = self.require_key(actor.key(), &key_id).await?;
        let private: EnrollmentPrivate = self
            .read_private(&record, &enroll_key)
            .await?
            .ok_or_else(|| KernelError::Invariant(format!("enrollment {id} has no private half")))?;

        self.delete_enrollment_indexes(&public)?;
        let enrollment = Enrollment {
            id: id.clone(),
            user: input.user.clone(),
            service: input.service.clone(),
            status: EnrollmentStatus::Inactive,
            enroll_date: private.enroll_date,
        };
        self.put_enrollment_asset(&enrollment, &enroll_key, &[]).await?;

        let fields = LogFields {
            owner: Some(input.user.clone()),
            target: Some(input.service.clone()),
            service: Some(input.service.clone()),
            ..LogFields::default()
        };
        self.write_log(Namespace::Enrollment, "unenrollPatient", fields, &enrollment, &enroll_key)
            .await?;
        info!(user = %input.user, service = %input.service, "patient unenrolled");
        Ok(enrollment)
    }

    /// Enrollments of a patient the caller can read.
    pub async fn get_patient_enrollments(
        &mut self,
        user: &str,
        status: Option<EnrollmentStatus>,
    ) -> Result<Vec<Enrollment>> {
        let hits = self.scan_index(ENROLL_USER, &[user]).await?;
        self.collect_enrollments(hits, status).await
    }

    /// Enrollments of a service. Only its admins may list them.
    pub async fn get_service_enrollments(
        &mut self,
        service: &str,
        status: Option<EnrollmentStatus>,
    ) -> Result<Vec<Enrollment>> {
        self.effective_caller(service).await?;
        let hits = self.scan_index(ENROLL_SERVICE, &[service]).await?;
        self.collect_enrollments(hits, status).await
    }

    async fn collect_enrollments(
        &mut self,
        hits: Vec<IndexHit>,
        status: Option<EnrollmentStatus>,
    ) -> Result<Vec<Enrollment>> {
        let mut page = Page::strict(self.config.max_query_results);
        for hit in hits {
            if let Some(wanted) = status {
                if hit.parts.get(2).map(String::as_str) != Some(wanted.as_str()) {
                    continue;
                }
            }
            let Some(record) = self.get_record(Namespace::Enrollment, &hit.asset_id).await? else {
                continue;
            };
            let Some(key) = self.asset_key(&record).await? else {
                continue;
            };
            let public: EnrollmentPublic = record.public_as()?;
            let Some(private) = self.read_private::<EnrollmentPrivate>(&record, &key).await? else {
                continue;
            };
            page.push(Enrollment {
                id: record.id.clone(),
                user: public.user,
                service: public.service,
                status: public.status,
                enroll_date: private.enroll_date,
            })?;
        }
        Ok(page.into_vec())
    }

    async fn enrollment_key(&mut self, record: &AssetRecord, service_sym: &Key) -> Result<Key> {
        let key_id = record
            .key_id
            .clone()
            .ok_or_else(|| KernelError::Invariant(format!("enrollment {} has no key", record.id)))?;
        self.require_key(service_sym, &key_id).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn store_enrollment(
        &mut self,
        id: &str,
        user: &str,
        service: &str,
        status: EnrollmentStatus,
        enroll_date: i64,
        key: &Key,
        service_sym: &Key,
    ) -> Result<Enrollment> {
        let enrollment = Enrollment {
            id: id.to_string(),
            user: user.to_string(),
            service: service.to_string(),
            status,
            enroll_date,
        };
        self.put_enrollment_asset(&enrollment, key, &[EdgeSource::Key(service_sym)])
            .await?;
        self.link_sealed(&priv_key_id(user)?, key).await?;
        self.link(EdgeSource::Key(&service_sym.log_key()?), &key.log_key()?)
            .await?;
        Ok(enrollment)
    }

    async fn put_enrollment_asset(
        &mut self,
        enrollment: &Enrollment,
        key: &Key,
        parents: &[EdgeSource<'_>],
    ) -> Result<()> {
        let public = EnrollmentPublic {
            user: enrollment.user.clone(),
            service: enrollment.service.clone(),
            status: enrollment.status,
        };
        let private = EnrollmentPrivate {
            enroll_date: enrollment.enroll_date,
        };
        let write = AssetWrite::new(Namespace::Enrollment, enrollment.id.clone(), &public)?.private(&private, key)?;
        self.put_asset(write, parents).await?;

        let status = enrollment.status.as_str();
        self.put_index(ENROLL_USER, &[&enrollment.user, &enrollment.service, status], &enrollment.id)?;
        self.put_index(ENROLL_SERVICE, &[&enrollment.service, &enrollment.user, status], &enrollment.id)?;
        Ok(())
    }

    fn delete_enrollment_indexes(&mut self, public: &EnrollmentPublic) -> Result<()> {
        let status = public.status.as_str();
        self.delete_index(ENROLL_USER, &[&public.user, &public.service, status])?;
        self.delete_index(ENROLL_SERVICE, &[&public.service, &public.user, status])
    }
}

fn service_kind(kind: Option<PrincipalKind>) -> bool {
    kind.map_or(false, |k| k.is_service())
}
