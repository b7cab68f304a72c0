//! Task data model for the execution DAG.
//!
//! A task either implements a module or freezes its public interface.
//! Tasks carry their own attempt history; the orchestrator is the only
//! component that moves them through their lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::charter::ModuleSpec;
use crate::core::attempt::{Attempt, FailureTrace};
use crate::error::{Error, Result};

/// What a task does to its module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Implement,
    Freeze,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Implement => write!(f, "implement"),
            TaskKind::Freeze => write!(f, "freeze"),
        }
    }
}

/// Identity of a task: the module it acts on and what it does.
///
/// Ordering is by module name, then kind, which gives the scheduler a
/// stable dispatch order for tasks that are ready at the same time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId {
    pub module: String,
    pub kind: TaskKind,
}

impl TaskId {
    pub fn new(module: &str, kind: TaskKind) -> Self {
        Self {
            module: module.to_string(),
            kind,
        }
    }

    pub fn implement(module: &str) -> Self {
        Self::new(module, TaskKind::Implement)
    }

    pub fn freeze(module: &str) -> Self {
        Self::new(module, TaskKind::Freeze)
    }

    /// File-name friendly form, e.g. `implement.users`.
    pub fn slug(&self) -> String {
        format!("{}.{}", self.kind, self.module)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.module)
    }
}

impl std::str::FromStr for TaskId {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (kind, module) = s
            .split_once(':')
            .ok_or_else(|| Error::Config(format!("invalid task id: {}", s)))?;
        let kind = match kind {
            "implement" => TaskKind::Implement,
            "freeze" => TaskKind::Freeze,
            other => return Err(Error::Config(format!("unknown task kind: {}", other))),
        };
        if module.is_empty() {
            return Err(Error::Config(format!("invalid task id: {}", s)));
        }
        Ok(Self::new(module, kind))
    }
}

/// Task status in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Waiting on dependencies.
    #[default]
    Pending,
    /// Dependencies satisfied, waiting for a worker.
    Ready,
    Running,
    /// Last attempt failed; waiting for a worker to try again.
    Retrying,
    /// Last attempt failed; retry decision not yet made.
    Failed,
    Succeeded,
    /// Interface committed to the freeze registry (freeze tasks only).
    Frozen,
    /// Out of attempts, or drifted.
    Abandoned { reason: String },
    /// An ancestor was abandoned or blocked; never executed.
    Blocked { reason: String },
}

impl TaskStatus {
    fn name(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Failed => "failed",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Frozen => "frozen",
            TaskStatus::Abandoned { .. } => "abandoned",
            TaskStatus::Blocked { .. } => "blocked",
        }
    }

    pub fn is_dispatchable(&self) -> bool {
        matches!(self, TaskStatus::Ready | TaskStatus::Retrying)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Abandoned { reason } => write!(f, "abandoned: {}", reason),
            TaskStatus::Blocked { reason } => write!(f, "blocked: {}", reason),
            other => write!(f, "{}", other.name()),
        }
    }
}

/// A single task in the execution DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Module the task was planned from.
    pub module: ModuleSpec,
    /// Dependency identities, in the order the planner added them.
    pub deps: Vec<TaskId>,
    pub status: TaskStatus,
    pub attempts: Vec<Attempt>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(module: &ModuleSpec, kind: TaskKind) -> Self {
        Self {
            id: TaskId::new(&module.name, kind),
            module: module.clone(),
            deps: Vec::new(),
            status: TaskStatus::Pending,
            attempts: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn implement(module: &ModuleSpec) -> Self {
        Self::new(module, TaskKind::Implement)
    }

    pub fn freeze(module: &ModuleSpec) -> Self {
        Self::new(module, TaskKind::Freeze)
    }

    pub fn kind(&self) -> TaskKind {
        self.id.kind
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }

    /// Failure traces of earlier attempts worth feeding back, oldest first.
    pub fn prior_failures(&self) -> Vec<FailureTrace> {
        self.attempts
            .iter()
            .filter_map(|a| a.failure.as_ref())
            .filter(|f| f.kind.is_feedback())
            .cloned()
            .collect()
    }

    fn can_transition(&self, to: &TaskStatus) -> bool {
        use TaskStatus::*;
        match (&self.status, to) {
            (Pending, Ready) => true,
            (Ready, Running) | (Retrying, Running) => true,
            (Running, Succeeded) | (Running, Failed) => true,
            (Failed, Retrying) | (Failed, Abandoned { .. }) => true,
            // Out of attempts before dispatch, e.g. after the budget shrank.
            (Ready, Abandoned { .. }) | (Retrying, Abandoned { .. }) => true,
            (Succeeded, Frozen) => self.kind() == TaskKind::Freeze,
            (Pending, Blocked { .. }) | (Ready, Blocked { .. }) | (Retrying, Blocked { .. }) => {
                true
            }
            _ => false,
        }
    }

    /// Move to `to`, rejecting transitions the lifecycle does not allow.
    pub fn transition(&mut self, to: TaskStatus) -> Result<()> {
        if !self.can_transition(&to) {
            return Err(Error::InvalidTransition {
                task: self.id.clone(),
                from: self.status.name().to_string(),
                to: to.name().to_string(),
            });
        }
        match to {
            TaskStatus::Running if self.started_at.is_none() => {
                self.started_at = Some(Utc::now());
            }
            TaskStatus::Succeeded
            | TaskStatus::Frozen
            | TaskStatus::Abandoned { .. }
            | TaskStatus::Blocked { .. } => {
                self.completed_at = Some(Utc::now());
            }
            _ => {}
        }
        self.status = to;
        Ok(())
    }

    pub fn mark_ready(&mut self) -> Result<()> {
        self.transition(TaskStatus::Ready)
    }

    pub fn start(&mut self) -> Result<()> {
        self.transition(TaskStatus::Running)
    }

    pub fn block(&mut self, reason: &str) -> Result<()> {
        self.transition(TaskStatus::Blocked {
            reason: reason.to_string(),
        })
    }

    pub fn abandon(&mut self, reason: &str) -> Result<()> {
        self.transition(TaskStatus::Abandoned {
            reason: reason.to_string(),
        })
    }

    /// Append an attempt to the history. Ordinals must be consecutive.
    pub fn record_attempt(&mut self, attempt: Attempt) -> Result<()> {
        let expected = self.attempt_count() + 1;
        if attempt.ordinal != expected {
            return Err(Error::InvalidTransition {
                task: self.id.clone(),
                from: format!("attempt {}", self.attempt_count()),
                to: format!("attempt {}", attempt.ordinal),
            });
        }
        self.attempts.push(attempt);
        Ok(())
    }

    /// Whether the task reached the state its dependents wait for.
    pub fn is_complete(&self) -> bool {
        match self.kind() {
            TaskKind::Implement => self.status == TaskStatus::Succeeded,
            TaskKind::Freeze => self.status == TaskStatus::Frozen,
        }
    }

    /// Whether the task cannot make further progress in this run.
    pub fn is_terminal(&self) -> bool {
        self.is_complete() || self.is_failed_terminal()
    }

    /// Abandoned or Blocked.
    pub fn is_failed_terminal(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Abandoned { .. } | TaskStatus::Blocked { .. }
        )
    }

    /// Bring a task restored from persisted state back to a schedulable
    /// state. Completed and abandoned tasks keep their status; anything
    /// interrupted mid-flight, and anything blocked (blocking is derived),
    /// returns to Pending with its attempt history intact.
    pub fn restore(&mut self) {
        let keep = self.is_complete() || matches!(self.status, TaskStatus::Abandoned { .. });
        if !keep {
            self.status = TaskStatus::Pending;
            self.completed_at = None;
        }
    }

    /// Forget all progress, including attempt history.
    pub fn reset(&mut self) {
        self.status = TaskStatus::Pending;
        self.attempts.clear();
        self.started_at = None;
        self.completed_at = None;
    }
}
