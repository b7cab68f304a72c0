//! Freeze registry durability and concurrency.

use std::sync::Arc;

use kiln::error::Error;
use kiln::fingerprint::ApiFingerprint;
use kiln::freeze::{AdditiveOnly, FreezeOutcome, FreezeRegistry, StrictEquality};
use tempfile::TempDir;

fn fingerprint(signatures: &[&str]) -> ApiFingerprint {
    ApiFingerprint::from_signatures(signatures.iter().copied())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_commits_to_distinct_modules() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(FreezeRegistry::open(dir.path()).unwrap());

    let mut handles = Vec::new();
    for i in 0..16 {
        let registry = Arc::clone(&registry);
        handles.push(tokio::spawn(async move {
            let module = format!("m{:02}", i);
            let signature = format!("def f{}()", i);
            registry
                .commit(&module, &fingerprint(&[signature.as_str()]), &StrictEquality)
                .await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap().record.version, 1);
    }

    let reopened = FreezeRegistry::open(dir.path()).unwrap();
    let records = reopened.records().await;
    assert_eq!(records.len(), 16);
    assert_eq!(records[0].module, "m00");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_identical_commits_create_once() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(FreezeRegistry::open(dir.path()).unwrap());

    let mut handles = Vec::new();
    for _ in 0..8 {
        let registry = Arc::clone(&registry);
        handles.push(tokio::spawn(async move {
            registry
                .commit("users", &fingerprint(&["def get(id)"]), &StrictEquality)
                .await
        }));
    }
    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap().unwrap().outcome);
    }

    assert_eq!(
        outcomes
            .iter()
            .filter(|o| **o == FreezeOutcome::Created)
            .count(),
        1
    );
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| **o == FreezeOutcome::Unchanged)
            .count(),
        7
    );
    let log = std::fs::read_to_string(dir.path().join("freeze.jsonl")).unwrap();
    assert_eq!(log.lines().count(), 1);
}

#[test]
fn test_records_survive_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let registry = FreezeRegistry::open(dir.path()).unwrap();
        tokio_test::block_on(registry.commit(
            "users",
            &fingerprint(&["def get(id)"]),
            &AdditiveOnly,
        ))
        .unwrap();
        tokio_test::block_on(registry.commit(
            "users",
            &fingerprint(&["def get(id)", "def list()"]),
            &AdditiveOnly,
        ))
        .unwrap();
    }

    let reopened = FreezeRegistry::open(dir.path()).unwrap();
    let record = tokio_test::block_on(reopened.lookup("users")).unwrap();
    assert_eq!(record.version, 2);
    assert_eq!(record.fingerprint.signatures.len(), 2);
}

#[tokio::test]
async fn test_drift_leaves_persisted_record_untouched() {
    let dir = TempDir::new().unwrap();
    let registry = FreezeRegistry::open(dir.path()).unwrap();
    registry
        .commit("users", &fingerprint(&["def get(id)"]), &AdditiveOnly)
        .await
        .unwrap();
    let snapshot = std::fs::read_to_string(dir.path().join("freeze.json")).unwrap();

    let err = registry
        .commit("users", &fingerprint(&["def get(id, deep)"]), &AdditiveOnly)
        .await
        .unwrap_err();

    match err {
        Error::Drift(drift) => {
            assert_eq!(drift.module, "users");
            assert_eq!(drift.frozen_version, 1);
            assert_eq!(drift.removed, vec!["def get(id)".to_string()]);
            assert_eq!(drift.added, vec!["def get(id, deep)".to_string()]);
        }
        other => panic!("expected drift, got {:?}", other),
    }
    assert_eq!(
        std::fs::read_to_string(dir.path().join("freeze.json")).unwrap(),
        snapshot
    );
    assert_eq!(registry.lookup("users").await.unwrap().version, 1);
}
