//! The invocation surface.
//!
//! Every operation is addressed by a function name and an ordered list of
//! string arguments. Identifiers are passed as plain strings, structures
//! as JSON, secret key bytes as base64 and client-supplied keys as
//! `{"id": .., "bytes": ..}` objects. [`Call::parse`] turns the raw form
//! into a typed call; [`Ctx::execute`] runs it and returns JSON.

use serde::de::DeserializeOwned;
use serde_json::Value;

use consent_kernel_core::Namespace;

use crate::consent::{ConsentInput, ConsentKind, ConsentQuery, QueryLog, ValidateRequest};
use crate::context::Ctx;
use crate::contract::{ContractInput, DetailInput, PermissionInput, ReceiptInput, RequesterDownload};
use crate::data::{DataInput, DataKind, DownloadRequest};
use crate::enrollment::{EnrollmentInput, EnrollmentStatus};
use crate::error::{KernelError, Result};
use crate::log::LogFilter;
use crate::principal::{KeySpec, SecretBytes};
use crate::registry::{Datatype, OrgInput, ServiceInput, UserInput};
use crate::roles::{AuditorGrant, Membership};

/// A parsed invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    // Registry
    RegisterUser { user: UserInput, sym_key: SecretBytes },
    RegisterOrg { org: OrgInput, sym_key: SecretBytes, private_key: Option<SecretBytes> },
    RegisterService { service: ServiceInput, private_key: SecretBytes, sym_key: SecretBytes },
    RegisterDatatype(Datatype),
    GetUser(String),
    GetService(String),
    GetOrg(String),
    GetDatatype(String),

    // Consent
    PutConsent { kind: ConsentKind, input: ConsentInput, key: Option<KeySpec> },
    GetConsent { owner: String, target: String, datatype: String },
    ValidateConsent(ValidateRequest),
    GetConsents(ConsentQuery),
    DecryptConsentValidationToken(String),
    GetAllConsentRequests(String),

    // Enrollment
    EnrollPatient { input: EnrollmentInput, key: Option<KeySpec> },
    UnenrollPatient(EnrollmentInput),
    GetPatientEnrollments { user: String, status: Option<EnrollmentStatus> },
    GetServiceEnrollments { service: String, status: Option<EnrollmentStatus> },

    // Data
    Upload(DataKind, DataInput),
    DownloadUserData(DownloadRequest),
    DownloadUserDataConsentToken { token: String, request: DownloadRequest },
    DownloadOwnerDataAsOwner(DownloadRequest),
    DownloadOwnerDataWithConsent(DownloadRequest),
    DownloadOwnerDataConsentToken { token: String, request: DownloadRequest },

    // Contracts
    CreateContract { input: ContractInput, key: KeySpec },
    GetContract(String),
    GetContracts(String),
    AddContractDetail(DetailInput),
    GivePermissionByContract(PermissionInput),
    DownloadOwnerDataAsRequester(RequesterDownload),
    AddContractDetailDownload(ReceiptInput),

    // Roles
    PutUserInOrg(Membership),
    RemoveUserFromOrg(Membership),
    AddPermissionOrgAdmin(Membership),
    RemovePermissionOrgAdmin(Membership),
    AddPermissionServiceAdmin(Membership),
    RemovePermissionServiceAdmin(Membership),
    AddAuditorPermission { grant: AuditorGrant, key: KeySpec },
    RemoveAuditorPermission(AuditorGrant),
    GetAuditorPermission(AuditorGrant),

    // Logs
    GetLogs(LogFilter),
    AddValidateConsentQueryLog(QueryLog),
}

/// Positional arguments of one invocation.
struct Args<'a> {
    function: &'a str,
    args: &'a [String],
}

impl<'a> Args<'a> {
    fn raw(&self, i: usize) -> Result<&'a str> {
        self.args
            .get(i)
            .map(String::as_str)
            .ok_or_else(|| KernelError::BadInput(format!("{}: missing argument {i}", self.function)))
    }

    fn id(&self, i: usize) -> Result<String> {
        let raw = self.raw(i)?.trim();
        if raw.is_empty() {
            return Err(KernelError::BadInput(format!("{}: argument {i} is empty", self.function)));
        }
        Ok(raw.to_string())
    }

    fn json<T: DeserializeOwned>(&self, i: usize) -> Result<T> {
        serde_json::from_str(self.raw(i)?)
            .map_err(|e| KernelError::BadInput(format!("{}: argument {i}: {e}", self.function)))
    }

    /// An optional trailing argument; absent, empty and `null` all count as missing.
    fn opt_json<T: DeserializeOwned>(&self, i: usize) -> Result<Option<T>> {
        match self.args.get(i).map(|s| s.trim()) {
            None | Some("") | Some("null") => Ok(None),
            Some(_) => self.json(i).map(Some),
        }
    }

    fn secret(&self, i: usize) -> Result<SecretBytes> {
        let secret = SecretBytes(self.id(i)?);
        secret.decode()?;
        Ok(secret)
    }

    fn opt_secret(&self, i: usize) -> Result<Option<SecretBytes>> {
        match self.args.get(i).map(|s| s.trim()) {
            None | Some("") => Ok(None),
            Some(_) => self.secret(i).map(Some),
        }
    }

    fn opt_status(&self, i: usize) -> Result<Option<EnrollmentStatus>> {
        match self.args.get(i).map(|s| s.trim()) {
            None | Some("") => Ok(None),
            Some("active") => Ok(Some(EnrollmentStatus::Active)),
            Some("inactive") => Ok(Some(EnrollmentStatus::Inactive)),
            Some(other) => Err(KernelError::BadInput(format!("{}: unknown status {other:?}", self.function))),
        }
    }
}

impl Call {
    /// Parse `function(args...)`.
    pub fn parse(function: &str, args: &[String]) -> Result<Self> {
        let a = Args { function, args };
        let call = match function {
            "registerUser" => Call::RegisterUser {
                user: a.json(0)?,
                sym_key: a.secret(1)?,
            },
            "registerOrg" => Call::RegisterOrg {
                org: a.json(0)?,
                sym_key: a.secret(1)?,
                private_key: a.opt_secret(2)?,
            },
            "registerService" => Call::RegisterService {
                service: a.json(0)?,
                private_key: a.secret(1)?,
                sym_key: a.secret(2)?,
            },
            "registerDatatype" => Call::RegisterDatatype(a.json(0)?),
            "getUser" => Call::GetUser(a.id(0)?),
            "getService" => Call::GetService(a.id(0)?),
            "getOrg" => Call::GetOrg(a.id(0)?),
            "getDatatype" => Call::GetDatatype(a.id(0)?),

            "putConsentPatientData" | "putConsentOwnerData" => Call::PutConsent {
                kind: if function == "putConsentPatientData" {
                    ConsentKind::PatientData
                } else {
                    ConsentKind::OwnerData
                },
                input: a.json(0)?,
                key: a.opt_json(1)?,
            },
            "getConsent" => Call::GetConsent {
                owner: a.id(0)?,
                target: a.id(1)?,
                datatype: a.id(2)?,
            },
            "validateConsent" => Call::ValidateConsent(a.json(0)?),
            "getConsents" => Call::GetConsents(a.opt_json(0)?.unwrap_or_default()),
            "decryptConsentValidationToken" => Call::DecryptConsentValidationToken(a.id(0)?),
            "getAllConsentRequests" => Call::GetAllConsentRequests(a.id(0)?),

            "enrollPatient" => Call::EnrollPatient {
                input: a.json(0)?,
                key: a.opt_json(1)?,
            },
            "unenrollPatient" => Call::UnenrollPatient(a.json(0)?),
            "getPatientEnrollments" => Call::GetPatientEnrollments {
                user: a.id(0)?,
                status: a.opt_status(1)?,
            },
            "getServiceEnrollments" => Call::GetServiceEnrollments {
                service: a.id(0)?,
                status: a.opt_status(1)?,
            },

            "uploadUserData" => Call::Upload(DataKind::User, a.json(0)?),
            "uploadOwnerData" => Call::Upload(DataKind::Owner, a.json(0)?),
            "downloadUserData" => Call::DownloadUserData(a.json(0)?),
            "downloadUserDataConsentToken" => Call::DownloadUserDataConsentToken {
                token: a.id(0)?,
                request: a.json(1)?,
            },
            "downloadOwnerDataAsOwner" => Call::DownloadOwnerDataAsOwner(a.json(0)?),
            "downloadOwnerDataWithConsent" => Call::DownloadOwnerDataWithConsent(a.json(0)?),
            "downloadOwnerDataConsentToken" => Call::DownloadOwnerDataConsentToken {
                token: a.id(0)?,
                request: a.json(1)?,
            },

            "createContract" => Call::CreateContract {
                input: a.json(0)?,
                key: a.json(1)?,
            },
            "getContract" => Call::GetContract(a.id(0)?),
            "getContracts" => Call::GetContracts(a.id(0)?),
            "addContractDetail" => Call::AddContractDetail(a.json(0)?),
            "givePermissionByContract" => Call::GivePermissionByContract(a.json(0)?),
            "downloadOwnerDataAsRequester" => Call::DownloadOwnerDataAsRequester(a.json(0)?),
            "addContractDetailDownload" => Call::AddContractDetailDownload(a.json(0)?),

            "putUserInOrg" => Call::PutUserInOrg(a.json(0)?),
            "removeUserFromOrg" => Call::RemoveUserFromOrg(a.json(0)?),
            "addPermissionOrgAdmin" => Call::AddPermissionOrgAdmin(a.json(0)?),
            "removePermissionOrgAdmin" => Call::RemovePermissionOrgAdmin(a.json(0)?),
            "addPermissionServiceAdmin" => Call::AddPermissionServiceAdmin(a.json(0)?),
            "removePermissionServiceAdmin" => Call::RemovePermissionServiceAdmin(a.json(0)?),
            "addAuditorPermission" => Call::AddAuditorPermission {
                grant: a.json(0)?,
                key: a.json(1)?,
            },
            "removeAuditorPermission" => Call::RemoveAuditorPermission(a.json(0)?),
            "getAuditorPermission" => Call::GetAuditorPermission(a.json(0)?),

            "getLogs" => Call::GetLogs(a.opt_json(0)?.unwrap_or_default()),
            "addValidateConsentQueryLog" => Call::AddValidateConsentQueryLog(a.json(0)?),

            other => return Err(KernelError::BadInput(format!("unknown function {other:?}"))),
        };
        Ok(call)
    }

    /// The function name this call is invoked by.
    pub fn name(&self) -> &'static str {
        match self {
            Call::RegisterUser { .. } => "registerUser",
            Call::RegisterOrg { .. } => "registerOrg",
            Call::RegisterService { .. } => "registerService",
            Call::RegisterDatatype(_) => "registerDatatype",
            Call::GetUser(_) => "getUser",
            Call::GetService(_) => "getService",
            Call::GetOrg(_) => "getOrg",
            Call::GetDatatype(_) => "getDatatype",
            Call::PutConsent { kind: ConsentKind::PatientData, .. } => "putConsentPatientData",
            Call::PutConsent { kind: ConsentKind::OwnerData, .. } => "putConsentOwnerData",
            Call::GetConsent { .. } => "getConsent",
            Call::ValidateConsent(_) => "validateConsent",
            Call::GetConsents(_) => "getConsents",
            Call::DecryptConsentValidationToken(_) => "decryptConsentValidationToken",
            Call::GetAllConsentRequests(_) => "getAllConsentRequests",
            Call::EnrollPatient { .. } => "enrollPatient",
            Call::UnenrollPatient(_) => "unenrollPatient",
            Call::GetPatientEnrollments { .. } => "getPatientEnrollments",
            Call::GetServiceEnrollments { .. } => "getServiceEnrollments",
            Call::Upload(DataKind::User, _) => "uploadUserData",
            Call::Upload(DataKind::Owner, _) => "uploadOwnerData",
            Call::DownloadUserData(_) => "downloadUserData",
            Call::DownloadUserDataConsentToken { .. } => "downloadUserDataConsentToken",
            Call::DownloadOwnerDataAsOwner(_) => "downloadOwnerDataAsOwner",
            Call::DownloadOwnerDataWithConsent(_) => "downloadOwnerDataWithConsent",
            Call::DownloadOwnerDataConsentToken { .. } => "downloadOwnerDataConsentToken",
            Call::CreateContract { .. } => "createContract",
            Call::GetContract(_) => "getContract",
            Call::GetContracts(_) => "getContracts",
            Call::AddContractDetail(_) => "addContractDetail",
            Call::GivePermissionByContract(_) => "givePermissionByContract",
            Call::DownloadOwnerDataAsRequester(_) => "downloadOwnerDataAsRequester",
            Call::AddContractDetailDownload(_) => "addContractDetailDownload",
            Call::PutUserInOrg(_) => "putUserInOrg",
            Call::RemoveUserFromOrg(_) => "removeUserFromOrg",
            Call::AddPermissionOrgAdmin(_) => "addPermissionOrgAdmin",
            Call::RemovePermissionOrgAdmin(_) => "removePermissionOrgAdmin",
            Call::AddPermissionServiceAdmin(_) => "addPermissionServiceAdmin",
            Call::RemovePermissionServiceAdmin(_) => "removePermissionServiceAdmin",
            Call::AddAuditorPermission { .. } => "addAuditorPermission",
            Call::RemoveAuditorPermission(_) => "removeAuditorPermission",
            Call::GetAuditorPermission(_) => "getAuditorPermission",
            Call::GetLogs(_) => "getLogs",
            Call::AddValidateConsentQueryLog(_) => "addValidateConsentQueryLog",
        }
    }
}

fn to_json(value: impl serde::Serialize) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

impl<'a> Ctx<'a> {
    /// Run a parsed call inside this context.
    pub async fn execute(&mut self, call: Call) -> Result<Value> {
        let name = call.name();
        match call {
            Call::RegisterUser { user, sym_key } => to_json(self.register_user(user, &sym_key).await?),
            Call::RegisterOrg { org, sym_key, private_key } => {
                to_json(self.register_org(org, private_key.as_ref(), &sym_key).await?)
            }
            Call::RegisterService { service, private_key, sym_key } => {
                to_json(self.register_service(service, &private_key, &sym_key).await?)
            }
            Call::RegisterDatatype(dt) => to_json(self.register_datatype(dt).await?),
            Call::GetUser(id) => to_json(self.get_profile(Namespace::User, &id).await?),
            Call::GetService(id) => to_json(self.get_profile(Namespace::Service, &id).await?),
            Call::GetOrg(id) => to_json(self.get_org(&id).await?),
            Call::GetDatatype(id) => to_json(self.datatype(&id).await?),

            Call::PutConsent { kind, input, key } => to_json(self.put_consent(kind, input, key.as_ref()).await?),
            Call::GetConsent { owner, target, datatype } => {
                to_json(self.get_consent(&owner, &target, &datatype).await?)
            }
            Call::ValidateConsent(req) => to_json(self.validate_consent(&req).await?),
            Call::GetConsents(query) => to_json(self.get_consents(&query).await?),
            Call::DecryptConsentValidationToken(token) => to_json(self.decrypt_validation_token(&token)?),
            Call::GetAllConsentRequests(user) => to_json(self.get_all_consent_requests(&user).await?),

            Call::EnrollPatient { input, key } => to_json(self.enroll_patient(input, key.as_ref()).await?),
            Call::UnenrollPatient(input) => to_json(self.unenroll_patient(input).await?),
            Call::GetPatientEnrollments { user, status } => {
                to_json(self.get_patient_enrollments(&user, status).await?)
            }
            Call::GetServiceEnrollments { service, status } => {
                to_json(self.get_service_enrollments(&service, status).await?)
            }

            Call::Upload(kind, input) => to_json(self.upload_data(kind, input).await?),
            Call::DownloadUserData(req) => to_json(self.download_data(DataKind::User, &req, name).await?),
            Call::DownloadOwnerDataAsOwner(req) => {
                if self.try_effective_caller(&req.owner).await?.is_none() {
                    return Err(KernelError::NoAccess(format!(
                        "{} cannot act as {}",
                        self.caller().id(),
                        req.owner
                    )));
                }
                to_json(self.download_data(DataKind::Owner, &req, name).await?)
            }
            Call::DownloadOwnerDataWithConsent(req) => {
                to_json(self.download_data(DataKind::Owner, &req, name).await?)
            }
            Call::DownloadUserDataConsentToken { token, request } => {
                to_json(self.download_with_token(DataKind::User, &token, &request, name).await?)
            }
            Call::DownloadOwnerDataConsentToken { token, request } => {
                to_json(self.download_with_token(DataKind::Owner, &token, &request, name).await?)
            }

            Call::CreateContract { input, key } => to_json(self.create_contract(input, &key).await?),
            Call::GetContract(id) => to_json(self.get_contract(&id).await?),
            Call::GetContracts(service) => to_json(self.get_contracts(&service).await?),
            Call::AddContractDetail(input) => to_json(self.add_contract_detail(input).await?),
            Call::GivePermissionByContract(input) => to_json(self.give_permission_by_contract(input).await?),
            Call::DownloadOwnerDataAsRequester(req) => {
                to_json(self.download_owner_data_as_requester(&req).await?)
            }
            Call::AddContractDetailDownload(input) => to_json(self.add_contract_detail_download(&input).await?),

            Call::PutUserInOrg(m) => to_json(self.put_user_in_org(&m).await?),
            Call::RemoveUserFromOrg(m) => to_json(self.remove_user_from_org(&m).await?),
            Call::AddPermissionOrgAdmin(m) => to_json(self.add_org_admin(&m).await?),
            Call::RemovePermissionOrgAdmin(m) => to_json(self.remove_org_admin(&m).await?),
            Call::AddPermissionServiceAdmin(m) => to_json(self.add_service_admin(&m).await?),
            Call::RemovePermissionServiceAdmin(m) => to_json(self.remove_service_admin(&m).await?),
            Call::AddAuditorPermission { grant, key } => to_json(self.add_auditor_permission(&grant, &key).await?),
            Call::RemoveAuditorPermission(grant) => to_json(self.remove_auditor_permission(&grant).await?),
            Call::GetAuditorPermission(grant) => to_json(self.get_auditor_permission(&grant).await?),

            Call::GetLogs(filter) => to_json(self.get_logs(&filter).await?),
            Call::AddValidateConsentQueryLog(entry) => to_json(self.add_validate_consent_query_log(&entry).await?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_consent_without_key() {
        let call = Call::parse(
            "putConsentPatientData",
            &args(&[r#"{"owner":"p1","target":"s1","datatype":"d1","options":["write"],"timestamp":100}"#]),
        )
        .unwrap();
        match &call {
            Call::PutConsent { kind, input, key } => {
                assert_eq!(*kind, ConsentKind::PatientData);
                assert_eq!(input.owner, "p1");
                assert!(key.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(call.name(), "putConsentPatientData");
    }

    #[test]
    fn test_name_round_trips_for_scalar_calls() {
        for (function, argv) in [
            ("getConsent", args(&["p1", "s1", "d1"])),
            ("getContract", args(&["c1"])),
            ("getPatientEnrollments", args(&["p1", "active"])),
            ("getLogs", args(&[])),
            ("getConsents", args(&["null"])),
            ("decryptConsentValidationToken", args(&["abc"])),
        ] {
            assert_eq!(Call::parse(function, &argv).unwrap().name(), function);
        }
    }

    #[test]
    fn test_bad_arguments_are_bad_input() {
        let cases = [
            ("nope", args(&[])),
            ("getConsent", args(&["p1", "s1"])),
            ("getContract", args(&["  "])),
            ("validateConsent", args(&["{not json"])),
            ("getServiceEnrollments", args(&["s1", "paused"])),
            ("registerUser", args(&[r#"{"id":"u1","name":"U","role":"patient"}"#, "!!"])),
        ];
        for (function, argv) in cases {
            let err = Call::parse(function, &argv).unwrap_err();
            assert_eq!(err.code(), ErrorCode::BadInput, "{function}");
        }
    }
}
