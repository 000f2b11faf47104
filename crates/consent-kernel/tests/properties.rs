//! Universal properties of the access graph, consents, tokens and meters.

use proptest::prelude::*;
use serde_json::json;

use consent_kernel::{consent::permits, Access, ConsentOption, ErrorCode};
use consent_kernel_testkit::generators::{consent_options, datatype_chain, upload_timestamps};
use consent_kernel_testkit::{arg, init_tracing, key_spec, World};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

async fn enrolled_world() -> World {
    init_tracing();
    let world = World::standard().await.unwrap();
    world.enroll("s1", "p1").await.unwrap();
    world
}

// ─────────────────────────────────────────────────────────────────────────────
// P1: private data iff a key path exists
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn consent_is_readable_exactly_along_key_paths() {
    let world = enrolled_world().await;
    world
        .consent("p1", "s1", "d1", &[ConsentOption::Read])
        .await
        .unwrap();
    let grant = json!({ "auditor": "a1", "service": "s1" });
    world
        .call("s1", "addAuditorPermission", &[arg(&grant), arg(&key_spec("audit-a1-s1"))])
        .await
        .unwrap();

    let args = ["p1".to_string(), "s1".to_string(), "d1".to_string()];
    for (caller, readable) in [("p1", true), ("s1", true), ("org1", true), ("s2", false), ("a1", false)] {
        match world.call(caller, "getConsent", &args).await {
            Ok(consent) => {
                assert!(readable, "{caller} should not read the consent");
                assert_eq!(consent["options"], json!(["read"]));
            }
            Err(e) => {
                assert!(!readable, "{caller} should read the consent: {e}");
                assert_eq!(e.code(), ErrorCode::NoAccess);
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// A consent on a datatype covers its descendants and nothing above it.
    #[test]
    fn consent_covers_descendants_only(
        (chain, consented, used) in datatype_chain(4).prop_flat_map(|c| {
            let n = c.len();
            (Just(c), 0..n, 0..n)
        })
    ) {
        runtime().block_on(async {
            let world = enrolled_world().await;
            let mut parent: Option<&str> = None;
            for dt in &chain {
                world.register_datatype("org1", dt, parent).await.unwrap();
                parent = Some(dt);
            }
            world
                .consent("p1", "s1", &chain[consented], &[ConsentOption::Write])
                .await
                .unwrap();

            let upload = world
                .upload_as_service("s1", "p1", &chain[used], 100, json!("v"))
                .await;
            if consented <= used {
                upload.unwrap();
                // The owner derives the same key from their own side.
                let req = json!({ "owner": "p1", "datatype": chain[used] });
                let records = world.call("p1", "downloadUserData", &[arg(&req)]).await.unwrap();
                assert_eq!(records[0]["data"], "v");
            } else {
                assert_eq!(upload.unwrap_err().code(), ErrorCode::NoAccess);
            }
        });
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// P2: validation tokens expire, the key graph does not
// ─────────────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn token_expires_but_graph_path_remains(elapsed in 0i64..2_000) {
        runtime().block_on(async {
            let world = enrolled_world().await;
            world
                .consent("p1", "s1", "d1", &[ConsentOption::Write])
                .await
                .unwrap();
            world
                .upload_as_service("s1", "p1", "d1", 100, json!(1))
                .await
                .unwrap();

            let req = json!({ "owner": "p1", "target": "s1", "datatype": "d1", "access": "read" });
            let validation = world.call("s1", "validateConsent", &[arg(&req)]).await.unwrap();
            let token = validation["token"].as_str().unwrap().to_string();

            world.advance(elapsed);
            let download = json!({ "owner": "p1", "datatype": "d1" });
            let by_token = world
                .call("s1", "downloadUserDataConsentToken", &[token, arg(&download)])
                .await;
            if elapsed <= 900 {
                assert_eq!(by_token.unwrap().as_array().unwrap().len(), 1);
            } else {
                assert_eq!(by_token.unwrap_err().code(), ErrorCode::Expired);
            }

            let by_graph = world.download_as_service("s1", "p1", "d1", false).await.unwrap();
            assert_eq!(by_graph.as_array().unwrap().len(), 1);
        });
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// P3: the download meter never overruns
// ─────────────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(6))]

    #[test]
    fn contract_meter_is_bounded(max in 1u64..=4) {
        runtime().block_on(async {
            init_tracing();
            let world = World::standard().await.unwrap();
            let upload = json!({ "owner": "s1", "datatype": "d1", "timestamp": 1, "data": 0 });
            world.call("s1", "uploadOwnerData", &[arg(&upload)]).await.unwrap();
            let contract = json!({
                "id": "c1",
                "owner_org": "org1",
                "owner_service": "s1",
                "requester_org": "org1",
                "requester_service": "s2",
                "payment_required": true,
            });
            world
                .call("s2", "createContract", &[arg(&contract), arg(&key_spec("contract-c1"))])
                .await
                .unwrap();
            for (who, kind) in [("s2", "sign"), ("s2", "payment"), ("s1", "verify")] {
                let detail = json!({ "contract": "c1", "kind": kind });
                world.call(who, "addContractDetail", &[arg(&detail)]).await.unwrap();
            }
            let permission = json!({ "contract": "c1", "max_num_download": max, "datatype": "d1" });
            world.call("s1", "givePermissionByContract", &[arg(&permission)]).await.unwrap();

            let download = json!({ "contract": "c1" });
            for _ in 0..max {
                let metered = world
                    .call("s2", "downloadOwnerDataAsRequester", &[arg(&download)])
                    .await
                    .unwrap();
                let confirm = json!({ "contract": "c1", "receipt": metered["receipt"]["id"] });
                let view = world
                    .call("s2", "addContractDetailDownload", &[arg(&confirm)])
                    .await
                    .unwrap();
                assert!(view["num_verified"].as_u64().unwrap() <= view["max_num_download"].as_u64().unwrap());
            }

            let err = world
                .call("s2", "downloadOwnerDataAsRequester", &[arg(&download)])
                .await
                .unwrap_err();
            assert_eq!(err.code(), ErrorCode::BadState);
        });
    }
}

#[tokio::test]
async fn receipts_cannot_outrun_the_meter() {
    init_tracing();
    let world = World::standard().await.unwrap();
    let contract = json!({
        "id": "c2",
        "owner_org": "org1",
        "owner_service": "s1",
        "requester_org": "org1",
        "requester_service": "s2",
    });
    world
        .call("s2", "createContract", &[arg(&contract), arg(&key_spec("contract-c2"))])
        .await
        .unwrap();
    let sign = json!({ "contract": "c2", "kind": "sign" });
    world.call("s2", "addContractDetail", &[arg(&sign)]).await.unwrap();
    let permission = json!({ "contract": "c2", "max_num_download": 1, "datatype": "d1" });
    world.call("s1", "givePermissionByContract", &[arg(&permission)]).await.unwrap();

    let download = json!({ "contract": "c2" });
    let metered = world
        .call("s2", "downloadOwnerDataAsRequester", &[arg(&download)])
        .await
        .unwrap();
    assert!(metered["records"].as_array().unwrap().is_empty());

    // A second receipt before the first is confirmed would exceed the meter.
    let err = world
        .call("s2", "downloadOwnerDataAsRequester", &[arg(&download)])
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::BadState);

    let confirm = json!({ "contract": "c2", "receipt": metered["receipt"]["id"] });
    world
        .call("s2", "addContractDetailDownload", &[arg(&confirm)])
        .await
        .unwrap();
    let err = world
        .call("s2", "addContractDetailDownload", &[arg(&confirm)])
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::BadState);
}

// ─────────────────────────────────────────────────────────────────────────────
// P4: one record per (owner, datatype, timestamp)
// ─────────────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn duplicate_uploads_are_rejected(timestamps in upload_timestamps(5)) {
        runtime().block_on(async {
            let world = enrolled_world().await;
            world
                .consent("p1", "s1", "d1", &[ConsentOption::Write])
                .await
                .unwrap();
            for ts in &timestamps {
                world
                    .upload_as_service("s1", "p1", "d1", *ts, json!(ts))
                    .await
                    .unwrap();
                let err = world
                    .upload_as_service("s1", "p1", "d1", *ts, json!("again"))
                    .await
                    .unwrap_err();
                assert_eq!(err.code(), ErrorCode::BadState);
            }

            let records = world.download_as_service("s1", "p1", "d1", false).await.unwrap();
            let records = records.as_array().unwrap();
            assert_eq!(records.len(), timestamps.len());
            for (record, ts) in records.iter().zip(&timestamps) {
                assert_eq!(record["data"], json!(ts));
            }
        });
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// P5: deny short-circuits
// ─────────────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn validation_follows_option_precedence(options in consent_options()) {
        runtime().block_on(async {
            let world = enrolled_world().await;
            world.consent("p1", "s1", "d1", &options).await.unwrap();

            for access in [Access::Read, Access::Write] {
                let req = json!({ "owner": "p1", "target": "s1", "datatype": "d1", "access": access });
                let validation = world.call("s1", "validateConsent", &[arg(&req)]).await.unwrap();
                let expected = permits(&options, access);
                assert_eq!(validation["granted"], expected);
                assert_eq!(validation["token"].is_string(), expected);
            }

            let download = world.download_as_service("s1", "p1", "d1", false).await;
            if options.contains(&ConsentOption::Deny) {
                assert_eq!(download.unwrap_err().code(), ErrorCode::NoAccess);
            } else {
                download.unwrap();
            }
        });
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// P6: removing an auditor hides every log it could see
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn removed_auditor_sees_only_own_logs() {
    let world = enrolled_world().await;
    world
        .consent("p1", "s1", "d1", &[ConsentOption::Write])
        .await
        .unwrap();
    let grant = json!({ "auditor": "a1", "service": "s1" });
    world
        .call("s1", "addAuditorPermission", &[arg(&grant), arg(&key_spec("audit-a1-s1"))])
        .await
        .unwrap();
    world
        .upload_as_service("s1", "p1", "d1", 5, json!(5))
        .await
        .unwrap();

    let before = world.logs("a1", json!({})).await.unwrap();
    assert!(before.iter().any(|l| l["service"] == "s1"));

    world
        .call("s1", "removeAuditorPermission", &[arg(&grant)])
        .await
        .unwrap();
    world
        .upload_as_service("s1", "p1", "d1", 6, json!(6))
        .await
        .unwrap();

    let after = world.logs("a1", json!({})).await.unwrap();
    assert!(!after.is_empty());
    for log in &after {
        assert_eq!(log["caller"], "a1", "unexpected log {log}");
    }
    let err = world
        .call("a1", "getAuditorPermission", &[arg(&grant)])
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
}
