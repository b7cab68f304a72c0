//! Scheduling behavior across a whole run.

use kiln::core::{TaskId, TaskStatus};
use kiln::error::PlanError;
use kiln::freeze::CompatibilityRule;
use kiln::orchestration::{build_plan, SchedulerEvent};
use tokio::sync::mpsc;

use crate::fixtures::{charter, failing, module, python, Project};

#[tokio::test]
async fn test_chain_runs_in_dependency_order() {
    let project = Project::new();
    for name in ["a", "b", "c"] {
        let signature = format!("{}_api()", name);
        project
            .backend
            .script(name, vec![python(&[signature.as_str()])]);
    }
    let charter = charter(
        CompatibilityRule::Strict,
        vec![
            module("c", &["c_api()"], &["b"]),
            module("b", &["b_api()"], &["a"]),
            module("a", &["a_api()"], &[]),
        ],
    );

    let report = project.resume(&charter, 3).await;

    assert!(report.is_complete());
    let order: Vec<String> = project
        .backend
        .requests()
        .into_iter()
        .map(|r| r.module.name)
        .collect();
    assert_eq!(order, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_cycle_rejected_before_execution() {
    let project = Project::new();
    let charter = charter(
        CompatibilityRule::Strict,
        vec![
            module("a", &["a_api()"], &["b"]),
            module("b", &["b_api()"], &["a"]),
        ],
    );

    let err = build_plan(&charter).unwrap_err();

    assert_eq!(
        err,
        PlanError::Cycle {
            modules: vec!["a".to_string(), "b".to_string()],
        }
    );
    assert!(project.backend.requests().is_empty());
    assert!(project.store().load_snapshot().unwrap().is_none());
}

/// Test: Retry bound
/// Given a module whose candidates always fail
/// When run with at most two attempts
/// Then it is abandoned after exactly two and its consumer never runs
#[tokio::test]
async fn test_retry_bound_and_blocked_consumer() {
    let project = Project::new();
    project.backend.script("a", vec![failing(&["a_api()"])]);
    project.backend.script("b", vec![python(&["b_api()"])]);
    let charter = charter(
        CompatibilityRule::Strict,
        vec![
            module("a", &["a_api()"], &[]),
            module("b", &["b_api()"], &["a"]),
        ],
    );

    let report = project.resume(&charter, 2).await;

    assert_eq!(report.attempts(&TaskId::implement("a")), 2);
    assert_eq!(project.backend.requests().len(), 2);
    assert_eq!(report.abandoned(), vec![&TaskId::implement("a")]);
    assert_eq!(
        report.blocked(),
        vec![
            &TaskId::freeze("a"),
            &TaskId::implement("b"),
            &TaskId::freeze("b"),
        ]
    );
    assert_eq!(
        project
            .store()
            .read_attempts(&TaskId::implement("a"))
            .unwrap()
            .len(),
        2
    );
}

/// Test: Abandonment cancels only its subtree
/// Given D uses B and C, B uses A, and A always fails
/// When the Charter is run
/// Then B and D are blocked while C still freezes
#[tokio::test]
async fn test_abandonment_blocks_only_downstream() {
    let project = Project::new();
    project.backend.script("a", vec![failing(&["a_api()"])]);
    project.backend.script("b", vec![python(&["b_api()"])]);
    project.backend.script("c", vec![python(&["c_api()"])]);
    project.backend.script("d", vec![python(&["d_api()"])]);
    let charter = charter(
        CompatibilityRule::Strict,
        vec![
            module("a", &["a_api()"], &[]),
            module("b", &["b_api()"], &["a"]),
            module("c", &["c_api()"], &[]),
            module("d", &["d_api()"], &["b", "c"]),
        ],
    );

    let report = project.resume(&charter, 1).await;

    assert_eq!(report.frozen_tasks(), vec![&TaskId::freeze("c")]);
    assert_eq!(report.abandoned(), vec![&TaskId::implement("a")]);
    for id in [
        TaskId::freeze("a"),
        TaskId::implement("b"),
        TaskId::freeze("b"),
        TaskId::implement("d"),
        TaskId::freeze("d"),
    ] {
        assert!(
            matches!(report.status(&id), Some(TaskStatus::Blocked { .. })),
            "{} should be blocked",
            id
        );
        assert_eq!(report.attempts(&id), 0);
    }
}

#[tokio::test]
async fn test_single_worker_runs_are_deterministic() {
    let charter = charter(
        CompatibilityRule::Strict,
        vec![
            module("z", &["z_api()"], &[]),
            module("x", &["x_api()"], &[]),
            module("y", &["y_api()"], &["z"]),
        ],
    );

    let mut orders = Vec::new();
    for _ in 0..2 {
        let project = Project::new();
        for name in ["x", "y", "z"] {
            let signature = format!("{}_api()", name);
            project
                .backend
                .script(name, vec![python(&[signature.as_str()])]);
        }
        let dag = build_plan(&charter).unwrap();
        let (tx, mut rx) = mpsc::channel(256);
        project
            .orchestrator(&charter, 1)
            .with_events(tx)
            .run(dag, 1)
            .await
            .unwrap();

        let mut started = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SchedulerEvent::TaskStarted { task, .. } = event {
                started.push(task.to_string());
            }
        }
        orders.push(started);
    }

    assert_eq!(orders[0], orders[1]);
    assert_eq!(
        orders[0],
        vec![
            "implement:x",
            "freeze:x",
            "implement:z",
            "freeze:z",
            "implement:y",
            "freeze:y",
        ]
    );
}

/// Test: Abort lets the running attempt finish
/// Given a run whose first attempt is already with the backend
/// When the operator cancels the run
/// Then that attempt completes and is persisted, and nothing else starts
#[tokio::test]
async fn test_cancel_mid_attempt_keeps_its_result() {
    let project = Project::new();
    project.backend.script("a", vec![python(&["a_api()"])]);
    let charter = charter(CompatibilityRule::Strict, vec![module("a", &["a_api()"], &[])]);

    let (tx, mut rx) = mpsc::channel(64);
    let orchestrator = project.orchestrator(&charter, 1).with_events(tx);
    let cancel = orchestrator.cancel_token();
    let listener = tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(event) = rx.recv().await {
            if matches!(event, SchedulerEvent::TaskStarted { .. }) {
                cancel.cancel();
            }
            seen.push(event);
        }
        seen
    });

    let report = orchestrator
        .run(build_plan(&charter).unwrap(), 3)
        .await
        .unwrap();
    drop(orchestrator);
    let events = listener.await.unwrap();

    assert!(report.aborted);
    let implement = TaskId::implement("a");
    assert_eq!(
        report.task(&implement).unwrap().status,
        TaskStatus::Succeeded
    );
    assert_eq!(report.attempts(&TaskId::freeze("a")), 0);
    assert_eq!(
        events.last(),
        Some(&SchedulerEvent::RunFinished { aborted: true })
    );

    let persisted = project.store().read_attempts(&implement).unwrap();
    assert_eq!(persisted.len(), 1);
    assert!(persisted[0].verdict.passed());
    assert_eq!(project.read("src/a.py"), Some(python(&["a_api()"])));
}
