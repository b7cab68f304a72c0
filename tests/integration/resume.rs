//! Continuing a run from persisted state.

use kiln::core::{Attempt, FailureKind, FailureTrace, TaskId, TaskStatus};
use kiln::freeze::CompatibilityRule;
use kiln::orchestration::build_plan;
use kiln::store::{ResumeOptions, Snapshot};

use crate::fixtures::{charter, module, python, Project};

fn single() -> kiln::Charter {
    charter(
        CompatibilityRule::Strict,
        vec![module("a", &["a_api()"], &[])],
    )
}

fn pair() -> kiln::Charter {
    charter(
        CompatibilityRule::Strict,
        vec![
            module("a", &["a_api()"], &[]),
            module("b", &["b_api()"], &["a"]),
        ],
    )
}

/// Test: Frozen work is not redone
/// Given a run that froze A
/// When the Charter grows a consumer B and the run resumes
/// Then the backend is never asked for A again
#[tokio::test]
async fn test_resume_skips_frozen_module() {
    let project = Project::new();
    project.backend.script("a", vec![python(&["a_api()"])]);
    project.backend.script("b", vec![python(&["b_api()"])]);
    project.resume(&single(), 3).await;
    project.backend.clear_requests();

    let report = project.resume(&pair(), 3).await;

    assert!(report.is_complete());
    assert!(project
        .backend
        .requests_for(&TaskId::implement("a"))
        .is_empty());
    assert_eq!(project.backend.requests().len(), 1);
    assert_eq!(report.attempts(&TaskId::implement("a")), 1);
    assert_eq!(project.registry().lookup("a").await.unwrap().version, 1);
}

/// Test: Interrupted attempt
/// Given a snapshot where A was running after one failed attempt
/// When the run resumes
/// Then A continues with attempt 2 and sees the earlier failure
#[tokio::test]
async fn test_interrupted_task_keeps_history() {
    let project = Project::new();
    project.backend.script("a", vec![python(&["a_api()"])]);

    let mut dag = build_plan(&single()).unwrap();
    {
        let task = dag.task_mut(&TaskId::implement("a")).unwrap();
        task.mark_ready().unwrap();
        task.start().unwrap();
        task.record_attempt(Attempt::failed(
            1,
            FailureTrace::new(FailureKind::Validation, "test_a failed"),
        ))
        .unwrap();
    }
    project
        .store()
        .save_snapshot(&Snapshot::of(&dag))
        .await
        .unwrap();

    let report = project.resume(&single(), 3).await;

    assert!(report.is_complete());
    let requests = project.backend.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].attempt, 2);
    assert_eq!(requests[0].prior_failures[0].summary, "test_a failed");
    assert_eq!(report.attempts(&TaskId::implement("a")), 2);
}

/// Test: Snapshot ahead of the registry
/// Given a snapshot saying A is frozen but no freeze record on disk
/// When the run resumes
/// Then A's freeze runs again from the committed artifact
#[tokio::test]
async fn test_frozen_without_record_is_refrozen() {
    let project = Project::new();
    project.backend.script("a", vec![python(&["a_api()"])]);
    project.resume(&single(), 3).await;
    std::fs::remove_file(project.state().join("freeze.json")).unwrap();
    std::fs::remove_file(project.state().join("freeze.jsonl")).unwrap();
    project.backend.clear_requests();

    let report = project.resume(&single(), 3).await;

    assert!(project.backend.requests().is_empty());
    assert_eq!(report.status(&TaskId::freeze("a")), Some(&TaskStatus::Frozen));
    assert_eq!(project.registry().lookup("a").await.unwrap().version, 1);
}

#[tokio::test]
async fn test_regenerate_reruns_module_and_refreeze_is_idempotent() {
    let project = Project::new();
    project.backend.script("a", vec![python(&["a_api()"])]);
    project.resume(&single(), 3).await;
    project.backend.clear_requests();

    let options = ResumeOptions {
        fresh: false,
        regenerate: vec!["a".to_string()],
    };
    let report = project.run(&single(), options, 3).await;

    assert_eq!(project.backend.requests().len(), 1);
    assert_eq!(report.attempts(&TaskId::implement("a")), 1);
    assert_eq!(report.status(&TaskId::freeze("a")), Some(&TaskStatus::Frozen));
    assert_eq!(report.record("a").unwrap().version, 1);
}

#[tokio::test]
async fn test_changed_declaration_starts_module_over() {
    let project = Project::new();
    project.backend.script("a", vec![python(&["a_api()"])]);
    project.resume(&single(), 3).await;
    project.backend.clear_requests();

    let widened = charter(
        CompatibilityRule::AdditiveOnly,
        vec![module("a", &["a_api()", "a_extra()"], &[])],
    );
    project
        .backend
        .script("a", vec![python(&["a_api()", "a_extra()"])]);
    let report = project.resume(&widened, 3).await;

    assert_eq!(project.backend.requests().len(), 1);
    assert_eq!(report.record("a").unwrap().version, 2);
}
