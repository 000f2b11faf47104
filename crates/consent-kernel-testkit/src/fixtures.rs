//! Test fixtures.
//!
//! A [`World`] is an in-memory kernel plus a controllable clock. Every
//! helper goes through [`Kernel::invoke`] with JSON arguments, the same
//! path a ledger client takes.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use consent_kernel::{Access, Consent, ConsentOption, Enrollment, Kernel, KernelConfig};
use consent_kernel_core::TxMeta;
use consent_kernel_store::{MemoryBlobStore, MemorySubstrate};

use crate::keys::{key_spec, principal, private_secret, sym_secret};

/// Substrate time at which every world starts.
pub const START: i64 = 1_700_000_000;

/// Encode a value as a JSON argument.
pub fn arg(value: &impl Serialize) -> String {
    match serde_json::to_string(value) {
        Ok(s) => s,
        Err(e) => panic!("argument does not serialize: {e}"),
    }
}

/// An in-memory kernel with a clock.
pub struct World {
    pub kernel: Kernel<MemorySubstrate, MemoryBlobStore>,
    clock: AtomicI64,
    tx_seq: AtomicU64,
}

impl World {
    pub fn new() -> Self {
        Self::with_config(KernelConfig::default())
    }

    pub fn with_config(config: KernelConfig) -> Self {
        let kernel = match Kernel::in_memory(config) {
            Ok(k) => k,
            Err(e) => panic!("invalid test config: {e}"),
        };
        Self {
            kernel,
            clock: AtomicI64::new(START),
            tx_seq: AtomicU64::new(0),
        }
    }

    /// Org `org1`, datatype `d1`, services `s1` and `s2` asking for read
    /// and write on `d1`, patient `p1`, auditor `a1`.
    pub async fn standard() -> Result<Self> {
        Self::standard_with(KernelConfig::default()).await
    }

    /// The [`World::standard`] principals under `config`.
    pub async fn standard_with(config: KernelConfig) -> Result<Self> {
        let world = Self::with_config(config);
        world.register_org("org1").await?;
        world.register_datatype("org1", "d1", None).await?;
        world
            .register_service("org1", "s1", &[("d1", &[Access::Read, Access::Write])])
            .await?;
        world
            .register_service("org1", "s2", &[("d1", &[Access::Read, Access::Write])])
            .await?;
        world.register_user("p1", "patient").await?;
        world.register_user("a1", "auditor").await?;
        Ok(world)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Clock
    // ─────────────────────────────────────────────────────────────────────────

    pub fn now(&self) -> i64 {
        self.clock.load(Ordering::SeqCst)
    }

    pub fn advance(&self, secs: i64) {
        self.clock.fetch_add(secs, Ordering::SeqCst);
    }

    pub fn set_time(&self, ts: i64) {
        self.clock.store(ts, Ordering::SeqCst);
    }

    fn next_meta(&self) -> TxMeta {
        let n = self.tx_seq.fetch_add(1, Ordering::SeqCst) + 1;
        TxMeta::new(format!("tx-{n}"), self.now())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Raw calls
    // ─────────────────────────────────────────────────────────────────────────

    /// Invoke `function` as `who`, keeping the kernel's error.
    pub async fn call(&self, who: &str, function: &str, args: &[String]) -> consent_kernel::Result<Value> {
        let caller = principal(who);
        let out = self
            .kernel
            .invoke(&caller, self.next_meta(), function, args)
            .await?;
        Ok(serde_json::from_str(&out)?)
    }

    /// Invoke and decode the result.
    pub async fn call_as<T: DeserializeOwned>(&self, who: &str, function: &str, args: &[String]) -> Result<T> {
        let value = self
            .call(who, function, args)
            .await
            .with_context(|| format!("{who} -> {function}"))?;
        serde_json::from_value(value).with_context(|| format!("decoding {function} result"))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Registry
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn register_user(&self, id: &str, role: &str) -> Result<Value> {
        let user = json!({ "id": id, "name": id, "role": role, "email": format!("{id}@example.org") });
        self.call_as(id, "registerUser", &[arg(&user), sym_secret(id).0])
            .await
    }

    pub async fn register_org(&self, id: &str) -> Result<Value> {
        let org = json!({ "id": id, "name": id });
        self.call_as(id, "registerOrg", &[arg(&org), sym_secret(id).0])
            .await
    }

    pub async fn register_service(&self, org: &str, id: &str, datatypes: &[(&str, &[Access])]) -> Result<Value> {
        let datatypes: Vec<Value> = datatypes
            .iter()
            .map(|(d, access)| json!({ "datatype": d, "access": access }))
            .collect();
        let service = json!({ "id": id, "name": id, "org": org, "datatypes": datatypes });
        self.call_as(
            org,
            "registerService",
            &[arg(&service), private_secret(id).0, sym_secret(id).0],
        )
        .await
    }

    pub async fn register_datatype(&self, who: &str, id: &str, parent: Option<&str>) -> Result<Value> {
        let dt = json!({ "id": id, "description": id, "parent": parent });
        self.call_as(who, "registerDatatype", &[arg(&dt)]).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Enrollment and consent
    // ─────────────────────────────────────────────────────────────────────────

    /// Enroll `patient` in `service`, called by the service.
    pub async fn enroll(&self, service: &str, patient: &str) -> Result<Enrollment> {
        let input = json!({ "user": patient, "service": service });
        let key = key_spec(&format!("enroll-{patient}-{service}"));
        self.call_as(service, "enrollPatient", &[arg(&input), arg(&key)])
            .await
    }

    /// The consent request `owner` would send, timestamped now.
    pub fn consent_input(&self, owner: &str, target: &str, datatype: &str, options: &[ConsentOption]) -> Value {
        json!({
            "owner": owner,
            "target": target,
            "datatype": datatype,
            "options": options,
            "timestamp": self.now(),
        })
    }

    /// Key id used for the consent of `owner` to `target` on `datatype`.
    pub fn consent_key_id(owner: &str, target: &str, datatype: &str) -> String {
        format!("consent-{owner}-{target}-{datatype}")
    }

    /// `owner` gives `target` a patient-data consent on `datatype`.
    pub async fn consent(&self, owner: &str, target: &str, datatype: &str, options: &[ConsentOption]) -> Result<Consent> {
        let input = self.consent_input(owner, target, datatype, options);
        let key = key_spec(&Self::consent_key_id(owner, target, datatype));
        self.call_as(owner, "putConsentPatientData", &[arg(&input), arg(&key)])
            .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Data
    // ─────────────────────────────────────────────────────────────────────────

    /// `service` uploads a record of `owner` at `timestamp`.
    pub async fn upload_as_service(
        &self,
        service: &str,
        owner: &str,
        datatype: &str,
        timestamp: i64,
        data: Value,
    ) -> consent_kernel::Result<Value> {
        let input = json!({
            "owner": owner,
            "datatype": datatype,
            "timestamp": timestamp,
            "data": data,
            "service": service,
        });
        self.call(service, "uploadUserData", &[arg(&input)]).await
    }

    /// `service` downloads `owner`'s records.
    pub async fn download_as_service(
        &self,
        service: &str,
        owner: &str,
        datatype: &str,
        latest_only: bool,
    ) -> consent_kernel::Result<Value> {
        let req = json!({
            "owner": owner,
            "datatype": datatype,
            "service": service,
            "latest_only": latest_only,
        });
        self.call(service, "downloadUserData", &[arg(&req)]).await
    }

    /// Logs `who` can read, filtered by `filter`.
    pub async fn logs(&self, who: &str, filter: Value) -> Result<Vec<Value>> {
        self.call_as(who, "getLogs", &[arg(&filter)]).await
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}
