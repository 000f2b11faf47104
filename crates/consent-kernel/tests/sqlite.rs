//! The kernel over a SQLite file survives a restart.

use serde_json::{json, Value};
use tempfile::TempDir;

use consent_kernel::core::TxMeta;
use consent_kernel::{ErrorCode, Kernel, KernelConfig};
use consent_kernel_testkit::{arg, init_tracing, principal, sym_secret, START};

async fn call(
    kernel: &Kernel<consent_kernel::store::SqliteSubstrate, consent_kernel::store::SqliteBlobStore>,
    who: &str,
    tx: &str,
    function: &str,
    args: &[String],
) -> consent_kernel::Result<Value> {
    let out = kernel
        .invoke(&principal(who), TxMeta::new(tx, START), function, args)
        .await?;
    Ok(serde_json::from_str(&out)?)
}

#[tokio::test]
async fn registry_persists_across_reopen() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("kernel.db");

    {
        let kernel = Kernel::open_sqlite(&path, KernelConfig::default()).unwrap();
        let org = json!({ "id": "org1", "name": "Clinic" });
        call(&kernel, "org1", "tx-1", "registerOrg", &[arg(&org), sym_secret("org1").0])
            .await
            .unwrap();
        let dt = json!({ "id": "d1", "description": "heart rate" });
        call(&kernel, "org1", "tx-2", "registerDatatype", &[arg(&dt)])
            .await
            .unwrap();

        // A rejected call writes nothing.
        let err = call(&kernel, "org1", "tx-3", "registerDatatype", &[arg(&dt)])
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadState);
    }

    let kernel = Kernel::open_sqlite(&path, KernelConfig::default()).unwrap();
    let dt = call(&kernel, "org1", "tx-4", "getDatatype", &["d1".to_string()])
        .await
        .unwrap();
    assert_eq!(dt["description"], "heart rate");

    let org = call(&kernel, "org1", "tx-5", "getOrg", &["org1".to_string()])
        .await
        .unwrap();
    assert_eq!(org["public"]["name"], "Clinic");
    assert!(org["private"].is_object());

    let err = call(&kernel, "org2", "tx-6", "getOrg", &["org1".to_string()])
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NoAccess);
}
