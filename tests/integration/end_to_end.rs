//! End-to-end runs: Charter in, frozen interfaces out.

use kiln::core::{FailureKind, TaskId, TaskStatus};
use kiln::freeze::CompatibilityRule;
use kiln::report::{render_public_interfaces, write_public_interfaces};

use crate::fixtures::{charter, failing, module, python, Project};

fn two_modules() -> kiln::Charter {
    charter(
        CompatibilityRule::Strict,
        vec![
            module("a", &["a_api()"], &[]),
            module("b", &["b_api()"], &["a"]),
        ],
    )
}

/// Test: Happy path with one retry
/// Given modules A and B where B uses A
/// And B's first candidate fails its tests
/// When the Charter is run
/// Then both interfaces are frozen and B took two attempts
#[tokio::test]
async fn test_two_modules_with_one_retry() {
    let project = Project::new();
    project.backend.script("a", vec![python(&["a_api()"])]);
    project
        .backend
        .script("b", vec![failing(&["b_api()"]), python(&["b_api()"])]);

    let report = project.resume(&two_modules(), 3).await;

    assert!(report.is_complete(), "report:\n{}", report);
    assert_eq!(
        report.frozen_tasks(),
        vec![&TaskId::freeze("a"), &TaskId::freeze("b")]
    );
    assert_eq!(report.attempts(&TaskId::implement("a")), 1);

    let b = report.task(&TaskId::implement("b")).unwrap();
    assert_eq!(b.attempts.len(), 2);
    assert_eq!(b.attempts[0].failure_kind(), Some(FailureKind::Validation));
    assert!(b.attempts[1].verdict.passed());

    // The second request carried the first failure and A's frozen interface.
    let requests = project.backend.requests_for(&TaskId::implement("b"));
    assert_eq!(requests.len(), 2);
    assert!(requests[0].prior_failures.is_empty());
    assert_eq!(requests[1].attempt, 2);
    assert_eq!(requests[1].prior_failures.len(), 1);
    assert!(requests[1].prior_failures[0].render().contains("test_b"));
    let interfaces = &requests[1].dependency_interfaces;
    assert_eq!(interfaces.len(), 1);
    assert_eq!(interfaces[0].module, "a");
    assert_eq!(interfaces[0].version, 1);
    assert_eq!(interfaces[0].signatures, vec!["def a_api()".to_string()]);
    assert!(requests[0]
        .workspace_files
        .contains(&std::path::PathBuf::from("src/a.py")));
    assert!(!requests[0]
        .workspace_files
        .contains(&std::path::PathBuf::from("src/b.py")));

    // Committed artifacts and durable records.
    assert_eq!(project.read("src/b.py"), Some(python(&["b_api()"])));
    let registry = project.registry();
    assert_eq!(registry.lookup("a").await.unwrap().version, 1);
    assert_eq!(registry.lookup("b").await.unwrap().version, 1);
    assert_eq!(
        project
            .store()
            .read_attempts(&TaskId::implement("b"))
            .unwrap()
            .len(),
        2
    );

    // The public interfaces document lists both modules.
    let doc = project.root().join("docs/PUBLIC_APIS.md");
    write_public_interfaces(&doc, &report.frozen).unwrap();
    let text = project.read("docs/PUBLIC_APIS.md").unwrap();
    assert_eq!(text, render_public_interfaces(&report.frozen));
    assert!(text.contains("## a (v1)"));
    assert!(text.contains("- `def b_api()`"));
}

/// Test: B waits for A's freeze
/// Given modules A and B where B uses A
/// When the Charter is run
/// Then B starts only after A's interface is frozen
#[tokio::test]
async fn test_consumer_starts_after_freeze() {
    let project = Project::new();
    project.backend.script("a", vec![python(&["a_api()"])]);
    project.backend.script("b", vec![python(&["b_api()"])]);

    project.resume(&two_modules(), 3).await;

    let journal = project.store().read_journal().unwrap();
    let position = |task: TaskId, status: TaskStatus| {
        journal
            .iter()
            .position(|e| e.task == task && e.status == status)
            .unwrap()
    };
    assert!(
        position(TaskId::freeze("a"), TaskStatus::Frozen)
            < position(TaskId::implement("b"), TaskStatus::Running)
    );
}

/// Test: Incompatible re-run
/// Given a completed run of A and B
/// When A is regenerated with a different interface under strict rules
/// Then A's freeze drifts, B is blocked without any attempt, and the
/// frozen record is untouched
#[tokio::test]
async fn test_incompatible_rerun_blocks_consumer() {
    let project = Project::new();
    project.backend.script("a", vec![python(&["a_api()"])]);
    project.backend.script("b", vec![python(&["b_api()"])]);
    let first = project.resume(&two_modules(), 3).await;
    assert!(first.is_complete());
    let frozen_digest = first.record("a").unwrap().fingerprint.digest.clone();

    project.backend.clear_requests();
    project.backend.script("a", vec![python(&["a_api(flag)"])]);
    let second = project.fresh(&two_modules(), 3).await;

    assert_eq!(
        second.status(&TaskId::implement("a")),
        Some(&TaskStatus::Succeeded)
    );
    let freeze_a = second.task(&TaskId::freeze("a")).unwrap();
    assert!(matches!(freeze_a.status, TaskStatus::Abandoned { .. }));
    assert_eq!(freeze_a.attempts.len(), 1);
    let trace = freeze_a.attempts[0].failure.as_ref().unwrap();
    assert_eq!(trace.kind, FailureKind::Drift);
    assert!(trace
        .findings
        .iter()
        .any(|f| f.message == "removed `def a_api()`"));
    assert!(trace
        .findings
        .iter()
        .any(|f| f.message == "added `def a_api(flag)`"));

    assert_eq!(
        second.blocked(),
        vec![&TaskId::implement("b"), &TaskId::freeze("b")]
    );
    assert_eq!(second.attempts(&TaskId::implement("b")), 0);
    assert!(project
        .backend
        .requests_for(&TaskId::implement("b"))
        .is_empty());

    let record = project.registry().lookup("a").await.unwrap();
    assert_eq!(record.version, 1);
    assert_eq!(record.fingerprint.digest, frozen_digest);
    // The drifted candidate does not stay in the workspace.
    assert_eq!(project.read("src/a.py"), Some(python(&["a_api()"])));
}
