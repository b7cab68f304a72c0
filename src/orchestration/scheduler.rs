//! Orchestrator: drives the task DAG to completion.
//!
//! The Orchestrator owns every task state transition. It promotes tasks
//! whose dependencies are complete, dispatches them to the
//! [`WorkerPool`] in task-id order, records each returned [`Attempt`],
//! and decides between success, retry, and abandonment. Abandonment
//! blocks every downstream task that has not started.
//!
//! Persistence is optional. With a [`RunStore`] attached, every
//! transition is journaled, every attempt is appended to its task's log,
//! and the task snapshot is rewritten after each change.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::{Attempt, FailureKind, FailureTrace, TaskDAG, TaskId, TaskKind, TaskStatus};
use crate::error::{Error, Result};
use crate::orchestration::executor::{AttemptExecutor, AttemptInput};
use crate::orchestration::pool::{WorkerEvent, WorkerPool};
use crate::report::RunReport;
use crate::store::{RunStore, Snapshot};
use crate::{klog, klog_debug, klog_error, klog_warn};

/// Events emitted by the orchestrator for task lifecycle changes.
///
/// These let a caller follow a run without polling. The run waits for
/// channel capacity, so a subscriber must keep draining.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// An attempt was handed to a worker.
    TaskStarted { task: TaskId, attempt: u32 },
    /// An attempt came back and was recorded.
    AttemptFinished {
        task: TaskId,
        attempt: u32,
        passed: bool,
    },
    /// The task failed and will be dispatched again.
    TaskRetrying { task: TaskId, next_attempt: u32 },
    /// An implement task succeeded.
    TaskSucceeded { task: TaskId },
    /// A freeze task committed its interface.
    TaskFrozen { task: TaskId, version: u32 },
    TaskAbandoned { task: TaskId, reason: String },
    TaskBlocked { task: TaskId, reason: String },
    /// The run ended; no further events follow.
    RunFinished { aborted: bool },
}

/// Runs a task DAG on a bounded worker pool.
///
/// # Example
///
/// ```ignore
/// let orchestrator = Orchestrator::new(Arc::new(executor), config.workers)
///     .with_store(RunStore::open(&config.state_path())?);
/// let report = orchestrator.run(build_plan(&charter)?, config.max_retries).await?;
/// ```
pub struct Orchestrator {
    executor: Arc<AttemptExecutor>,
    workers: usize,
    store: Option<RunStore>,
    events: Option<mpsc::Sender<SchedulerEvent>>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(executor: Arc<AttemptExecutor>, workers: usize) -> Self {
        Self {
            executor,
            workers: workers.max(1),
            store: None,
            events: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_store(mut self, store: RunStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_events(mut self, events: mpsc::Sender<SchedulerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Token that stops dispatching new attempts when cancelled.
    ///
    /// In-flight attempts are allowed to finish and are recorded; the
    /// report is then marked aborted.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Execute `dag` until no task can make progress.
    ///
    /// `max_retries` is the maximum number of attempts per task.
    ///
    /// # Errors
    ///
    /// Fails before dispatching anything if `max_retries` is zero or the
    /// DAG references unknown tasks. Fails after draining in-flight
    /// attempts if run state could not be persisted or an attempt hit an
    /// infrastructure error.
    pub async fn run(&self, dag: TaskDAG, max_retries: u32) -> Result<RunReport> {
        if max_retries == 0 {
            return Err(Error::Config("max_retries must be at least 1".to_string()));
        }
        dag.validate()?;

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let (tx, mut rx) = mpsc::channel(self.workers * 2);
        let mut run = Run {
            orchestrator: self,
            pool: WorkerPool::new(self.workers, Arc::clone(&self.executor), tx),
            dag,
            max_retries,
            failure: None,
        };

        klog!(
            "run {} starting: {} tasks, {} workers, at most {} attempts per task",
            run_id,
            run.dag.task_count(),
            self.workers,
            max_retries
        );
        run.reconcile().await?;

        loop {
            run.promote().await?;
            if !run.stopping() {
                run.dispatch().await?;
            }
            run.save().await;

            if run.pool.active_count() == 0 {
                break;
            }

            tokio::select! {
                _ = self.cancel.cancelled(), if !self.cancel.is_cancelled() => {
                    klog_warn!(
                        "run {} cancelled; waiting for {} in-flight attempt(s)",
                        run_id,
                        run.pool.active_count()
                    );
                }
                event = rx.recv() => match event {
                    Some(event) => run.handle(event).await?,
                    None => break,
                },
            }
        }

        run.save().await;
        if let Some(error) = run.failure.take() {
            klog_error!("run {} stopped: {}", run_id, error);
            return Err(error);
        }

        let aborted = self.cancel.is_cancelled() && !run.dag.all_terminal();
        let frozen = self.executor.registry().records().await;
        run.emit(SchedulerEvent::RunFinished { aborted }).await;

        let report = RunReport::new(run_id, started_at, &run.dag, frozen, aborted);
        klog!(
            "run {} finished: frozen={} succeeded={} abandoned={} blocked={} unfinished={}",
            run_id,
            report.frozen_tasks().len(),
            report.succeeded().len(),
            report.abandoned().len(),
            report.blocked().len(),
            report.unfinished().len()
        );
        Ok(report)
    }
}

/// Mutable state of one run.
struct Run<'a> {
    orchestrator: &'a Orchestrator,
    dag: TaskDAG,
    pool: WorkerPool,
    max_retries: u32,
    /// First infrastructure error; stops dispatching.
    failure: Option<Error>,
}

impl<'a> Run<'a> {
    fn store(&self) -> Option<&'a RunStore> {
        self.orchestrator.store.as_ref()
    }

    fn stopping(&self) -> bool {
        self.failure.is_some() || self.orchestrator.cancel.is_cancelled()
    }

    fn fail(&mut self, error: Error) {
        klog_error!("infrastructure failure: {}", error);
        if self.failure.is_none() {
            self.failure = Some(error);
        }
    }

    async fn emit(&self, event: SchedulerEvent) {
        if let Some(events) = &self.orchestrator.events {
            let _ = events.send(event).await;
        }
    }

    async fn journal(&mut self, id: &TaskId) {
        let Some(store) = self.store() else {
            return;
        };
        let Some(task) = self.dag.get_task(id) else {
            return;
        };
        if let Err(e) = store.record_transition(task).await {
            self.fail(e);
        }
    }

    async fn save(&mut self) {
        let Some(store) = self.store() else {
            return;
        };
        if let Err(e) = store.save_snapshot(&Snapshot::of(&self.dag)).await {
            self.fail(e);
        }
    }

    async fn transition(&mut self, id: &TaskId, to: TaskStatus) -> Result<()> {
        self.dag.task_mut(id)?.transition(to)?;
        self.journal(id).await;
        Ok(())
    }

    /// Bring carried-over task states in line with the registry, and
    /// re-derive blocking from abandoned tasks.
    async fn reconcile(&mut self) -> Result<()> {
        let registry = Arc::clone(self.orchestrator.executor.registry());
        for id in self.dag.task_ids() {
            let task = self.dag.task_mut(&id)?;
            task.restore();
            if id.kind == TaskKind::Freeze
                && task.status == TaskStatus::Frozen
                && registry.lookup(&id.module).await.is_none()
            {
                klog_warn!("{} was frozen but has no freeze record; running it again", id);
                self.dag.task_mut(&id)?.reset();
            }
        }

        let abandoned: Vec<TaskId> = self
            .dag
            .all_tasks()
            .into_iter()
            .filter(|t| matches!(t.status, TaskStatus::Abandoned { .. }))
            .map(|t| t.id.clone())
            .collect();
        for id in abandoned {
            self.block_dependents(&id).await?;
        }
        Ok(())
    }

    async fn promote(&mut self) -> Result<()> {
        for id in self.dag.newly_ready() {
            klog_debug!("{} ready", id);
            self.transition(&id, TaskStatus::Ready).await?;
        }
        Ok(())
    }

    /// Start ready tasks in id order while the pool has room.
    async fn dispatch(&mut self) -> Result<usize> {
        let mut started = 0;
        for id in self.dag.dispatchable() {
            if !self.pool.has_capacity() {
                break;
            }

            let task = self.dag.task_mut(&id)?;
            let attempts = task.attempt_count();
            if attempts >= self.max_retries {
                let reason = format!("no attempts left ({} of {} used)", attempts, self.max_retries);
                self.abandon(&id, &reason).await?;
                continue;
            }

            let input = AttemptInput {
                task: id.clone(),
                module: task.module.clone(),
                ordinal: attempts + 1,
                deps: task.deps.clone(),
                prior_failures: task.prior_failures(),
            };
            task.start()?;
            self.pool.spawn(input)?;
            self.journal(&id).await;

            klog!("{} attempt {} started", id, attempts + 1);
            self.emit(SchedulerEvent::TaskStarted {
                task: id,
                attempt: attempts + 1,
            })
            .await;
            started += 1;
        }
        Ok(started)
    }

    async fn handle(&mut self, event: WorkerEvent) -> Result<()> {
        let id = event.task().clone();
        self.pool.complete(&id);

        let attempt = match event {
            WorkerEvent::Finished { result: Ok(attempt), .. } => attempt,
            WorkerEvent::Finished { result: Err(e), .. } => {
                klog_error!("{} could not finish its attempt: {}", id, e);
                self.fail(e);
                return Ok(());
            }
            WorkerEvent::Panicked {
                ordinal, message, ..
            } => Attempt::failed(
                ordinal,
                FailureTrace::new(
                    FailureKind::Validation,
                    &format!("worker panicked: {}", message),
                ),
            ),
        };
        self.settle(&id, attempt).await
    }

    /// Record a finished attempt and decide what happens to the task.
    async fn settle(&mut self, id: &TaskId, attempt: Attempt) -> Result<()> {
        if let Some(store) = self.store() {
            if let Err(e) = store.append_attempt(id, &attempt).await {
                self.fail(e);
            }
        }

        let ordinal = attempt.ordinal;
        let passed = attempt.verdict.passed();
        let freeze_version = attempt.freeze_version;
        let failure = attempt.failure.clone();
        self.dag.task_mut(id)?.record_attempt(attempt)?;
        self.emit(SchedulerEvent::AttemptFinished {
            task: id.clone(),
            attempt: ordinal,
            passed,
        })
        .await;

        if passed {
            self.transition(id, TaskStatus::Succeeded).await?;
            if id.kind == TaskKind::Freeze {
                self.transition(id, TaskStatus::Frozen).await?;
                self.emit(SchedulerEvent::TaskFrozen {
                    task: id.clone(),
                    version: freeze_version.unwrap_or_default(),
                })
                .await;
            } else {
                self.emit(SchedulerEvent::TaskSucceeded { task: id.clone() })
                    .await;
            }
            return Ok(());
        }

        self.transition(id, TaskStatus::Failed).await?;
        let trace = failure.unwrap_or_else(|| {
            FailureTrace::new(FailureKind::Validation, "attempt failed without a trace")
        });
        klog_warn!("{} attempt {} failed: {}", id, ordinal, trace.summary);

        if trace.kind.is_fatal() {
            return self.abandon(id, &trace.summary).await;
        }
        if ordinal >= self.max_retries {
            let reason = format!("gave up after {} attempt(s): {}", ordinal, trace.summary);
            return self.abandon(id, &reason).await;
        }

        self.transition(id, TaskStatus::Retrying).await?;
        self.emit(SchedulerEvent::TaskRetrying {
            task: id.clone(),
            next_attempt: ordinal + 1,
        })
        .await;
        Ok(())
    }

    async fn abandon(&mut self, id: &TaskId, reason: &str) -> Result<()> {
        klog_warn!("{} abandoned: {}", id, reason);
        self.dag.task_mut(id)?.abandon(reason)?;
        self.journal(id).await;
        self.emit(SchedulerEvent::TaskAbandoned {
            task: id.clone(),
            reason: reason.to_string(),
        })
        .await;
        self.block_dependents(id).await
    }

    /// Block every downstream task that has not started.
    async fn block_dependents(&mut self, id: &TaskId) -> Result<()> {
        let reason = format!("{} abandoned", id);
        for dependent in self.dag.transitive_dependents(id) {
            let waiting = matches!(
                self.dag.task_mut(&dependent)?.status,
                TaskStatus::Pending | TaskStatus::Ready | TaskStatus::Retrying
            );
            if !waiting {
                continue;
            }
            self.dag.task_mut(&dependent)?.block(&reason)?;
            self.journal(&dependent).await;
            klog_debug!("{} blocked: {}", dependent, reason);
            self.emit(SchedulerEvent::TaskBlocked {
                task: dependent,
                reason: reason.clone(),
            })
            .await;
        }
        Ok(())
    }
}
