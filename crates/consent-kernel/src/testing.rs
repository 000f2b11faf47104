//! Unit-test bench: an in-memory substrate and a few principals, driven
//! one committed transaction at a time.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;

use consent_kernel_core::{ContentHash, TxMeta};
use consent_kernel_perms::PrivateKey;
use consent_kernel_store::{MemoryBlobStore, MemorySubstrate, Transaction};

use crate::config::KernelConfig;
use crate::consent::Access;
use crate::context::Ctx;
use crate::principal::{KeySpec, Principal, SecretBytes};
use crate::registry::{Datatype, OrgInput, Role, ServiceDatatype, ServiceInput, UserInput};

pub const START: i64 = 1_700_000_000;

fn seed(kind: &str, label: &str) -> [u8; 32] {
    ContentHash::of(format!("bench:{kind}:{label}").as_bytes()).into_bytes()
}

pub fn principal(id: &str) -> Principal {
    Principal::new(id, PrivateKey::from_bytes(seed("priv", id))).unwrap()
}

pub fn private_secret(id: &str) -> SecretBytes {
    SecretBytes::encode(&seed("priv", id))
}

pub fn sym_secret(id: &str) -> SecretBytes {
    SecretBytes::encode(&seed("sym", id))
}

pub fn key_spec(id: &str) -> KeySpec {
    KeySpec {
        id: id.to_string(),
        bytes: SecretBytes::encode(&seed("key", id)),
    }
}

pub struct Bench {
    pub substrate: MemorySubstrate,
    pub blobs: MemoryBlobStore,
    pub config: KernelConfig,
    seq: AtomicU64,
}

impl Bench {
    pub fn new() -> Self {
        Self {
            substrate: MemorySubstrate::new(),
            blobs: MemoryBlobStore::new(),
            config: KernelConfig::default(),
            seq: AtomicU64::new(0),
        }
    }

    /// A fresh transaction as `caller`. Each one is ten seconds after the
    /// previous.
    pub fn ctx<'a>(&'a self, caller: &'a Principal) -> Ctx<'a> {
        let n = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let meta = TxMeta::new(format!("tx-{n}"), START + 10 * n as i64);
        Ctx::new(Transaction::begin(&self.substrate, meta), &self.blobs, &self.config, caller)
    }

    /// Org `org1` with datatype `d1`, service `s1` asking for read and
    /// write on `d1`, patient `p1` and plain user `u1`.
    pub async fn standard() -> Self {
        let bench = Self::new();
        let org = principal("org1");

        let mut ctx = bench.ctx(&org);
        let input = OrgInput {
            id: "org1".into(),
            name: "org1".into(),
            email: String::new(),
        };
        ctx.register_org(input, None, &sym_secret("org1")).await.unwrap();
        ctx.commit().await.unwrap();

        let mut ctx = bench.ctx(&org);
        let datatype = Datatype {
            id: "d1".into(),
            description: String::new(),
            parent: None,
        };
        ctx.register_datatype(datatype).await.unwrap();
        ctx.commit().await.unwrap();

        let mut ctx = bench.ctx(&org);
        let service = ServiceInput {
            id: "s1".into(),
            name: "s1".into(),
            org: "org1".into(),
            email: String::new(),
            datatypes: vec![ServiceDatatype {
                datatype: "d1".into(),
                access: vec![Access::Read, Access::Write],
            }],
            data: Value::Null,
        };
        ctx.register_service(service, &private_secret("s1"), &sym_secret("s1"))
            .await
            .unwrap();
        ctx.commit().await.unwrap();

        for (id, role) in [("p1", Role::Patient), ("u1", Role::User)] {
            let who = principal(id);
            let mut ctx = bench.ctx(&who);
            let user = UserInput {
                id: id.into(),
                name: id.into(),
                role,
                org: None,
                email: format!("{id}@example.org"),
                data: Value::Null,
            };
            ctx.register_user(user, &sym_secret(id)).await.unwrap();
            ctx.commit().await.unwrap();
        }
        bench
    }
}
