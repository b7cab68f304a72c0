//! Compatibility rules applied across consecutive runs.

use kiln::core::{FailureKind, TaskId, TaskStatus};
use kiln::freeze::CompatibilityRule;
use kiln::store::ResumeOptions;

use crate::fixtures::{charter, module, python, Project};

fn chain(rule: CompatibilityRule) -> kiln::Charter {
    charter(
        rule,
        vec![
            module("a", &["a_api()"], &[]),
            module("b", &["b_api()"], &["a"]),
            module("c", &["c_api()"], &["b"]),
        ],
    )
}

fn script_consumers(project: &Project) {
    project.backend.script("b", vec![python(&["b_api()"])]);
    project.backend.script("c", vec![python(&["c_api()"])]);
}

#[tokio::test]
async fn test_additive_change_bumps_version() {
    let project = Project::new();
    project.backend.script("a", vec![python(&["a_api()"])]);
    script_consumers(&project);
    project.resume(&chain(CompatibilityRule::AdditiveOnly), 3).await;

    project.backend.clear_requests();
    project
        .backend
        .script("a", vec![python(&["a_api()", "a_helper(x)"])]);
    let report = project.fresh(&chain(CompatibilityRule::AdditiveOnly), 3).await;

    assert!(report.is_complete());
    assert_eq!(report.record("a").unwrap().version, 2);
    assert_eq!(report.record("b").unwrap().version, 1);
    let request = &project.backend.requests_for(&TaskId::implement("b"))[0];
    assert_eq!(request.dependency_interfaces[0].version, 2);
    assert_eq!(request.dependency_interfaces[0].signatures.len(), 2);
}

#[tokio::test]
async fn test_removal_is_drift_under_additive_only() {
    let project = Project::new();
    project
        .backend
        .script("a", vec![python(&["a_api()", "a_legacy()"])]);
    script_consumers(&project);
    project.resume(&chain(CompatibilityRule::AdditiveOnly), 3).await;

    project.backend.script("a", vec![python(&["a_api()"])]);
    let report = project.fresh(&chain(CompatibilityRule::AdditiveOnly), 3).await;

    let freeze_a = report.task(&TaskId::freeze("a")).unwrap();
    assert!(matches!(freeze_a.status, TaskStatus::Abandoned { .. }));
    assert_eq!(
        freeze_a.attempts[0].failure_kind(),
        Some(FailureKind::Drift)
    );
    assert_eq!(report.record("a").unwrap().version, 1);
    assert_eq!(
        report.record("a").unwrap().fingerprint.signatures.len(),
        2
    );
}

/// Test: Drift cancels the whole downstream subtree
/// Given A <- B <- C all frozen
/// When A comes back with an incompatible interface under strict rules
/// Then every task downstream of A's freeze is blocked, naming the cause
#[tokio::test]
async fn test_strict_drift_blocks_transitive_consumers() {
    let project = Project::new();
    project.backend.script("a", vec![python(&["a_api()"])]);
    script_consumers(&project);
    project.resume(&chain(CompatibilityRule::Strict), 3).await;

    project.backend.clear_requests();
    project.backend.script("a", vec![python(&["a_api(strict)"])]);
    let report = project.fresh(&chain(CompatibilityRule::Strict), 3).await;

    // Drift is not retried.
    assert_eq!(report.attempts(&TaskId::freeze("a")), 1);
    assert_eq!(
        report.blocked(),
        vec![
            &TaskId::implement("b"),
            &TaskId::freeze("b"),
            &TaskId::implement("c"),
            &TaskId::freeze("c"),
        ]
    );
    for id in report.blocked() {
        match report.status(id) {
            Some(TaskStatus::Blocked { reason }) => {
                assert_eq!(reason, "freeze:a abandoned");
            }
            other => panic!("unexpected status {:?}", other),
        }
    }
    assert_eq!(project.backend.requests().len(), 1);
}

#[tokio::test]
async fn test_identical_refreeze_writes_nothing() {
    let project = Project::new();
    project.backend.script("a", vec![python(&["a_api()"])]);
    script_consumers(&project);
    project.resume(&chain(CompatibilityRule::Strict), 3).await;
    let log = project.state().join("freeze.jsonl");
    let before = std::fs::read_to_string(&log).unwrap();

    let report = project.fresh(&chain(CompatibilityRule::Strict), 3).await;

    assert!(report.is_complete());
    assert!(report.frozen.iter().all(|r| r.version == 1));
    assert_eq!(std::fs::read_to_string(&log).unwrap(), before);
    assert_eq!(before.lines().count(), 3);
}

/// Test: Regenerating one module that drifts
/// Given A <- B <- C all frozen
/// When only A is regenerated and comes back with an incompatible interface
/// Then B and C are blocked instead of staying frozen, and A's frozen
/// source is back on disk
#[tokio::test]
async fn test_regenerate_drift_blocks_frozen_consumers() {
    let project = Project::new();
    project.backend.script("a", vec![python(&["a_api()"])]);
    script_consumers(&project);
    let first = project.resume(&chain(CompatibilityRule::Strict), 3).await;
    assert!(first.is_complete());

    project.backend.clear_requests();
    project.backend.script("a", vec![python(&["a_api(flag)"])]);
    let options = ResumeOptions {
        fresh: false,
        regenerate: vec!["a".to_string()],
    };
    let report = project
        .run(&chain(CompatibilityRule::Strict), options, 3)
        .await;

    let freeze_a = report.task(&TaskId::freeze("a")).unwrap();
    assert_eq!(freeze_a.attempts[0].failure_kind(), Some(FailureKind::Drift));
    assert_eq!(
        report.blocked(),
        vec![
            &TaskId::implement("b"),
            &TaskId::freeze("b"),
            &TaskId::implement("c"),
            &TaskId::freeze("c"),
        ]
    );
    assert_eq!(report.attempts(&TaskId::implement("b")), 0);
    assert!(project
        .backend
        .requests_for(&TaskId::implement("b"))
        .is_empty());
    assert_eq!(project.read("src/a.py"), Some(python(&["a_api()"])));
    assert_eq!(project.registry().lookup("a").await.unwrap().version, 1);
}

#[tokio::test]
async fn test_regenerate_compatible_change_reruns_consumers() {
    let project = Project::new();
    project.backend.script("a", vec![python(&["a_api()"])]);
    script_consumers(&project);
    project.resume(&chain(CompatibilityRule::AdditiveOnly), 3).await;

    project.backend.clear_requests();
    project
        .backend
        .script("a", vec![python(&["a_api()", "a_more()"])]);
    let options = ResumeOptions {
        fresh: false,
        regenerate: vec!["a".to_string()],
    };
    let report = project
        .run(&chain(CompatibilityRule::AdditiveOnly), options, 3)
        .await;

    assert!(report.is_complete());
    assert_eq!(report.record("a").unwrap().version, 2);
    let request = &project.backend.requests_for(&TaskId::implement("b"))[0];
    assert_eq!(request.dependency_interfaces[0].version, 2);
    assert_eq!(project.backend.requests().len(), 3);
}
