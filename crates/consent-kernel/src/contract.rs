//! Data contracts between an owner service and a requester service.
//!
//! ```text
//! requested --sign--> signed --payment--> paid --verify--> paymentVerified
//!                       |                                        |
//!                       +------ givePermission (no payment) -----+--> permitted --> completed
//! ```
//!
//! Either side may terminate a contract that is not yet final. While
//! permitted, the requester downloads the owner's data under a meter:
//! each download issues a receipt and each verified receipt counts
//! towards `max_num_download`. When the count is reached the contract's
//! edge to the owner's datatype key is removed.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use consent_kernel_core::Namespace;
use consent_kernel_perms::{EdgeSource, Key};
use consent_kernel_store::layout;

use crate::asset::{AssetRecord, AssetWrite};
use crate::consent::record_key_id;
use crate::context::Ctx;
use crate::data::{DataKind, DataRecord, DataWindow};
use crate::error::{KernelError, Result};
use crate::index::{Page, CONTRACT_SERVICE};
use crate::log::LogFields;
use crate::principal::{datatype_key_id, priv_key_id, validate_id, KeySpec, Principal};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContractState {
    Requested,
    Signed,
    Paid,
    PaymentVerified,
    Permitted,
    Completed,
    Terminated,
}

impl ContractState {
    pub fn is_final(&self) -> bool {
        matches!(self, ContractState::Completed | ContractState::Terminated)
    }
}

/// Which party acts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Owner,
    Requester,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetailKind {
    Terms,
    Sign,
    Payment,
    Verify,
    Terminate,
}

impl DetailKind {
    /// The state a detail moves the contract to from `from`, if allowed.
    pub fn transition(&self, from: ContractState, payment_required: bool) -> Option<ContractState> {
        use ContractState::*;
        match (self, from) {
            (DetailKind::Terms, Requested) => Some(Signed),
            (DetailKind::Sign, Requested) => Some(Signed),
            (DetailKind::Payment, Signed) if payment_required => Some(Paid),
            (DetailKind::Verify, Paid) => Some(PaymentVerified),
            (DetailKind::Terminate, s) if !s.is_final() => Some(Terminated),
            _ => None,
        }
    }

    fn sides(&self) -> &'static [Side] {
        match self {
            DetailKind::Terms | DetailKind::Verify => &[Side::Owner],
            DetailKind::Sign | DetailKind::Payment => &[Side::Requester],
            DetailKind::Terminate => &[Side::Owner, Side::Requester],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractInput {
    pub id: String,
    pub owner_org: String,
    pub owner_service: String,
    pub requester_org: String,
    pub requester_service: String,
    #[serde(default)]
    pub payment_required: bool,
    #[serde(default)]
    pub terms: Value,
}

/// Public half of a contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractPublic {
    pub id: String,
    pub owner_org: String,
    pub owner_service: String,
    pub requester_org: String,
    pub requester_service: String,
    pub state: ContractState,
    pub payment_required: bool,
    #[serde(default)]
    pub datatype: Option<String>,
    pub max_num_download: u64,
    pub num_verified: u64,
    pub num_issued: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractDetail {
    pub kind: DetailKind,
    pub by: String,
    pub timestamp: i64,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContractPrivate {
    #[serde(default)]
    pub terms: Value,
    #[serde(default)]
    pub details: Vec<ContractDetail>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractView {
    #[serde(flatten)]
    pub public: ContractPublic,
    /// Present when the caller holds the contract key.
    #[serde(default)]
    pub private: Option<ContractPrivate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailInput {
    pub contract: String,
    pub kind: DetailKind,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionInput {
    pub contract: String,
    pub max_num_download: u64,
    pub datatype: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequesterDownload {
    pub contract: String,
    /// Defaults to the contract's datatype; may be a descendant of it.
    #[serde(default)]
    pub datatype: Option<String>,
    #[serde(flatten)]
    pub window: DataWindow,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadReceipt {
    pub id: String,
    pub contract: String,
    pub seq: u64,
    pub datatype: String,
    pub timestamp: i64,
    pub verified: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeteredDownload {
    pub receipt: DownloadReceipt,
    pub records: Vec<DataRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptInput {
    pub contract: String,
    pub receipt: String,
}

pub fn receipt_id(contract: &str, seq: u64) -> String {
    format!("{contract}-{seq}")
}

fn counter_name(contract: &str) -> String {
    layout::counter_key(&format!("contractDownload:{contract}"))
}

/// A loaded contract with the key the acting side derived.
struct Opened {
    record: AssetRecord,
    public: ContractPublic,
    private: ContractPrivate,
    key: Key,
    actor: Principal,
}

impl<'a> Ctx<'a> {
    /// Create a contract on behalf of the requester service.
    pub async fn create_contract(&mut self, input: ContractInput, key: &KeySpec) -> Result<ContractView> {
        validate_id(&input.id)?;
        if input.owner_service == input.requester_service {
            return Err(KernelError::BadInput("a service cannot contract with itself".into()));
        }
        for (service, org) in [
            (&input.owner_service, &input.owner_org),
            (&input.requester_service, &input.requester_org),
        ] {
            let profile = self.service_public(service).await?;
            if &profile.org != org {
                return Err(KernelError::BadInput(format!("{service} does not belong to {org}")));
            }
        }
        let requester = self.effective_caller(&input.requester_service).await?;
        if self.asset_exists(Namespace::Contract, &input.id).await? {
            return Err(KernelError::BadState(format!("contract {} exists", input.id)));
        }
        let contract_key = key.to_key()?;
        self.ensure_fresh_key(&contract_key).await?;

        let public = ContractPublic {
            id: input.id.clone(),
            owner_org: input.owner_org,
            owner_service: input.owner_service,
            requester_org: input.requester_org,
            requester_service: input.requester_service,
            state: ContractState::Requested,
            payment_required: input.payment_required,
            datatype: None,
            max_num_download: 0,
            num_verified: 0,
            num_issued: 0,
        };
        let private = ContractPrivate {
            terms: input.terms,
            details: Vec::new(),
        };

        let requester_sym = self.principal_sym(&requester).await?;
        self.put_contract(&public, &private, &contract_key, &[EdgeSource::Key(&requester_sym)])
            .await?;
        self.link_sealed(&priv_key_id(&public.owner_service)?, &contract_key)
            .await?;
        self.link(EdgeSource::Key(&requester_sym.log_key()?), &contract_key.log_key()?)
            .await?;
        self.put_index(CONTRACT_SERVICE, &[&public.requester_service, &public.id], &public.id)?;
        self.put_index(CONTRACT_SERVICE, &[&public.owner_service, &public.id], &public.id)?;

        self.log_contract("createContract", &public, &public, &contract_key)
            .await?;
        info!(contract = %public.id, "contract created");
        Ok(ContractView {
            public,
            private: Some(private),
        })
    }

    /// Append a detail and apply its transition.
    pub async fn add_contract_detail(&mut self, input: DetailInput) -> Result<ContractView> {
        let mut opened = self.open_contract(&input.contract, input.kind.sides()).await?;
        let next = input
            .kind
            .transition(opened.public.state, opened.public.payment_required)
            .ok_or_else(|| {
                KernelError::BadState(format!(
                    "{:?} not allowed in state {:?}",
                    input.kind, opened.public.state
                ))
            })?;

        if input.kind == DetailKind::Terms {
            opened.private.terms = input.data.clone();
        }
        if next == ContractState::Terminated {
            self.revoke_contract_edge(&opened).await?;
        }
        opened.public.state = next;
        opened.private.details.push(ContractDetail {
            kind: input.kind,
            by: opened.actor.id().to_string(),
            timestamp: self.now(),
            data: input.data,
        });

        self.put_contract(&opened.public, &opened.private, &opened.key, &[])
            .await?;
        self.log_contract("addContractDetail", &opened.public, &opened.private.details, &opened.key)
            .await?;
        info!(contract = %opened.public.id, state = ?opened.public.state, "contract detail added");
        Ok(ContractView {
            public: opened.public,
            private: Some(opened.private),
        })
    }

    /// Let the requester read the owner's `datatype` data, metered.
    pub async fn give_permission_by_contract(&mut self, input: PermissionInput) -> Result<ContractView> {
        let mut opened = self.open_contract(&input.contract, &[Side::Owner]).await?;
        let ready = match opened.public.state {
            ContractState::PaymentVerified => true,
            ContractState::Signed => !opened.public.payment_required,
            _ => false,
        };
        if !ready {
            return Err(KernelError::BadState(format!(
                "cannot give permission in state {:?}",
                opened.public.state
            )));
        }
        if input.max_num_download == 0 {
            return Err(KernelError::BadInput("max_num_download must be positive".into()));
        }

        let owner_sym = self.principal_sym(&opened.actor).await?;
        let dt_key = self
            .datatype_key(&owner_sym, &opened.public.owner_service, &input.datatype)
            .await?;
        self.link(EdgeSource::Key(&opened.key), &dt_key).await?;

        opened.public.state = ContractState::Permitted;
        opened.public.datatype = Some(input.datatype.clone());
        opened.public.max_num_download = input.max_num_download;
        opened.public.num_verified = 0;
        opened.public.num_issued = 0;
        self.put_contract(&opened.public, &opened.private, &opened.key, &[])
            .await?;
        self.log_contract("givePermissionByContract", &opened.public, &input, &opened.key)
            .await?;
        info!(contract = %opened.public.id, datatype = %input.datatype, max = input.max_num_download, "contract permission given");
        Ok(ContractView {
            public: opened.public,
            private: Some(opened.private),
        })
    }

    /// Download the owner's data under the contract and issue a receipt.
    pub async fn download_owner_data_as_requester(&mut self, req: &RequesterDownload) -> Result<MeteredDownload> {
        let mut opened = self.open_contract(&req.contract, &[Side::Requester]).await?;
        let permitted = require_permitted(&opened.public)?;
        if opened.public.num_issued >= opened.public.max_num_download {
            return Err(KernelError::BadState(format!(
                "contract {} has no downloads left",
                opened.public.id
            )));
        }

        let datatype = req.datatype.clone().unwrap_or_else(|| permitted.clone());
        if !self.datatype_chain(&datatype).await?.contains(permitted) {
            return Err(KernelError::NoAccess(format!(
                "contract {} does not cover {datatype}",
                opened.public.id
            )));
        }
        let owner = opened.public.owner_service.clone();
        let dt_id = datatype_key_id(&owner, &permitted)?;
        let dt_key = self.require_key(&opened.key, &dt_id).await?;
        let data_key = self.datatype_key(&dt_key, &owner, &datatype).await?;
        let records = self
            .collect_records(DataKind::Owner, &owner, &datatype, &data_key, &req.window)
            .await?;

        let seq = self.tx.increment_counter(&counter_name(&opened.public.id)).await?;
        let receipt = DownloadReceipt {
            id: receipt_id(&opened.public.id, seq),
            contract: opened.public.id.clone(),
            seq,
            datatype: datatype.clone(),
            timestamp: self.now(),
            verified: false,
        };
        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        let write = AssetWrite::new(Namespace::ContractDownload, receipt.id.clone(), &receipt)?
            .private(&ids, &opened.key)?
            .datatypes(vec![datatype.clone()]);
        self.put_asset(write, &[]).await?;

        opened.public.num_issued += 1;
        self.put_contract(&opened.public, &opened.private, &opened.key, &[])
            .await?;

        let mut fields = contract_fields(&opened.public);
        fields.datatype = Some(datatype);
        self.write_log(Namespace::Contract, "downloadOwnerDataAsRequester", fields, &receipt, &opened.key)
            .await?;
        Ok(MeteredDownload { receipt, records })
    }

    /// Confirm a receipt. The last confirmation completes the contract.
    pub async fn add_contract_detail_download(&mut self, input: &ReceiptInput) -> Result<ContractView> {
        let mut opened = self.open_contract(&input.contract, &[Side::Requester]).await?;
        require_permitted(&opened.public)?;

        let record = self
            .require_record(Namespace::ContractDownload, &input.receipt)
            .await?;
        let mut receipt: DownloadReceipt = record.public_as()?;
        if receipt.contract != opened.public.id {
            return Err(KernelError::BadInput(format!(
                "receipt {} belongs to {}",
                receipt.id, receipt.contract
            )));
        }
        if receipt.verified {
            return Err(KernelError::BadState(format!("receipt {} already counted", receipt.id)));
        }
        if opened.public.num_verified >= opened.public.max_num_download {
            return Err(KernelError::Invariant(format!(
                "contract {} is over its meter",
                opened.public.id
            )));
        }

        let ids: Vec<String> = self
            .read_private(&record, &opened.key)
            .await?
            .unwrap_or_default();
        receipt.verified = true;
        let write = AssetWrite::new(Namespace::ContractDownload, receipt.id.clone(), &receipt)?
            .private(&ids, &opened.key)?
            .datatypes(record.datatypes.clone());
        self.put_asset(write, &[]).await?;

        opened.public.num_verified += 1;
        if opened.public.num_verified == opened.public.max_num_download {
            self.revoke_contract_edge(&opened).await?;
            opened.public.state = ContractState::Completed;
            info!(contract = %opened.public.id, "contract completed");
        }
        self.put_contract(&opened.public, &opened.private, &opened.key, &[])
            .await?;

        let mut fields = contract_fields(&opened.public);
        fields.datatype = Some(receipt.datatype.clone());
        self.write_log(Namespace::Contract, "addContractDetailDownload", fields, &receipt, &opened.key)
            .await?;
        Ok(ContractView {
            public: opened.public,
            private: Some(opened.private),
        })
    }

    pub async fn get_contract(&mut self, id: &str) -> Result<ContractView> {
        let record = self.require_record(Namespace::Contract, id).await?;
        self.contract_view(&record).await
    }

    /// Contracts a service is party to. Only its admins may list them.
    pub async fn get_contracts(&mut self, service: &str) -> Result<Vec<ContractView>> {
        self.effective_caller(service).await?;
        let mut page = Page::strict(self.config.max_query_results);
        for hit in self.scan_index(CONTRACT_SERVICE, &[service]).await? {
            if let Some(record) = self.get_record(Namespace::Contract, &hit.asset_id).await? {
                page.push(self.contract_view(&record).await?)?;
            }
        }
        Ok(page.into_vec())
    }

    async fn contract_view(&mut self, record: &AssetRecord) -> Result<ContractView> {
        let public: ContractPublic = record.public_as()?;
        let private = match self.asset_key(record).await? {
            Some(key) => self.read_private(record, &key).await?,
            None => None,
        };
        Ok(ContractView { public, private })
    }

    /// Load a contract as one of `sides`, deriving its key.
    async fn open_contract(&mut self, id: &str, sides: &[Side]) -> Result<Opened> {
        let record = self.require_record(Namespace::Contract, id).await?;
        let public: ContractPublic = record.public_as()?;

        let mut actor = None;
        for side in sides {
            let service = match side {
                Side::Owner => &public.owner_service,
                Side::Requester => &public.requester_service,
            };
            if let Some(principal) = self.try_effective_caller(service).await? {
                actor = Some((*side, principal));
                break;
            }
        }
        let Some((side, actor)) = actor else {
            return Err(KernelError::NoAccess(format!(
                "{} is not on the required side of contract {id}",
                self.caller().id()
            )));
        };

        let key_id = record_key_id(&record)?;
        let key = self.require_key(actor.key(), &key_id).await?;
        let private: ContractPrivate = self.read_private(&record, &key).await?.unwrap_or_default();

        if side == Side::Owner {
            let owner_log = self.principal_sym(&actor).await?.log_key()?;
            self.link(EdgeSource::Key(&owner_log), &key.log_key()?).await?;
        }
        Ok(Opened {
            record,
            public,
            private,
            key,
            actor,
        })
    }

    async fn revoke_contract_edge(&mut self, opened: &Opened) -> Result<()> {
        if let Some(datatype) = &opened.public.datatype {
            let dt_id = datatype_key_id(&opened.public.owner_service, datatype)?;
            if !self.unlink(opened.key.id(), &dt_id).await? {
                warn!(contract = %opened.public.id, "permission edge already gone");
            }
        }
        Ok(())
    }

    async fn put_contract(
        &mut self,
        public: &ContractPublic,
        private: &ContractPrivate,
        key: &Key,
        parents: &[EdgeSource<'_>],
    ) -> Result<()> {
        let datatypes = public.datatype.iter().cloned().collect();
        let write = AssetWrite::new(Namespace::Contract, public.id.clone(), public)?
            .private(private, key)?
            .datatypes(datatypes);
        self.put_asset(write, parents).await
    }

    async fn log_contract(
        &mut self,
        function: &str,
        public: &ContractPublic,
        data: &impl Serialize,
        key: &Key,
    ) -> Result<()> {
        let fields = contract_fields(public);
        self.write_log(Namespace::Contract, function, fields, data, key)
            .await?;
        Ok(())
    }
}

fn contract_fields(public: &ContractPublic) -> LogFields {
    LogFields {
        owner: Some(public.owner_service.clone()),
        target: Some(public.requester_service.clone()),
        service: Some(public.requester_service.clone()),
        datatype: public.datatype.clone(),
        contract: Some(public.id.clone()),
        contract_owner_org: Some(public.owner_org.clone()),
        contract_requester_org: Some(public.requester_org.clone()),
        ..LogFields::default()
    }
}

fn require_permitted(public: &ContractPublic) -> Result<&String> {
    if public.state != ContractState::Permitted {
        return Err(KernelError::BadState(format!(
            "contract {} is {:?}, not permitted",
            public.id, public.state
        )));
    }
    public
        .datatype
        .as_ref()
        .ok_or_else(|| KernelError::Invariant(format!("permitted contract {} has no datatype", public.id)))
}
