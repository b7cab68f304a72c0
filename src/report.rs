//! Run reports and operator-facing artifacts.
//!
//! A [`RunReport`] is the final manifest of a run: every task with its
//! terminal (or unfinished) state and attempt history, plus the freeze
//! records the run ended with. The public interfaces document and the
//! fingerprint file are rendered from freeze records alone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use uuid::Uuid;

use crate::core::{Attempt, Task, TaskDAG, TaskId, TaskKind, TaskStatus};
use crate::freeze::FreezeRecord;
use crate::util::write_atomic;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: TaskId,
    pub status: TaskStatus,
    pub attempts: Vec<Attempt>,
}

impl TaskSummary {
    pub fn from_task(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            status: task.status.clone(),
            attempts: task.attempts.clone(),
        }
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.len()
    }

    fn is_unfinished(&self) -> bool {
        match self.status {
            TaskStatus::Succeeded => self.id.kind == TaskKind::Freeze,
            TaskStatus::Frozen | TaskStatus::Abandoned { .. } | TaskStatus::Blocked { .. } => {
                false
            }
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// The operator stopped the run before every task settled.
    pub aborted: bool,
    /// Sorted by task id.
    pub tasks: Vec<TaskSummary>,
    /// Freeze records at the end of the run, sorted by module.
    pub frozen: Vec<FreezeRecord>,
}

impl RunReport {
    pub fn new(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        dag: &TaskDAG,
        frozen: Vec<FreezeRecord>,
        aborted: bool,
    ) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: Utc::now(),
            aborted,
            tasks: dag.all_tasks().into_iter().map(TaskSummary::from_task).collect(),
            frozen,
        }
    }

    pub fn task(&self, id: &TaskId) -> Option<&TaskSummary> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    pub fn status(&self, id: &TaskId) -> Option<&TaskStatus> {
        self.task(id).map(|t| &t.status)
    }

    pub fn attempts(&self, id: &TaskId) -> usize {
        self.task(id).map_or(0, TaskSummary::attempt_count)
    }

    fn ids_where<F>(&self, predicate: F) -> Vec<&TaskId>
    where
        F: Fn(&TaskSummary) -> bool,
    {
        self.tasks
            .iter()
            .filter(|t| predicate(t))
            .map(|t| &t.id)
            .collect()
    }

    pub fn frozen_tasks(&self) -> Vec<&TaskId> {
        self.ids_where(|t| t.status == TaskStatus::Frozen)
    }

    /// Implement tasks that succeeded.
    pub fn succeeded(&self) -> Vec<&TaskId> {
        self.ids_where(|t| t.status == TaskStatus::Succeeded && t.id.kind == TaskKind::Implement)
    }

    pub fn abandoned(&self) -> Vec<&TaskId> {
        self.ids_where(|t| matches!(t.status, TaskStatus::Abandoned { .. }))
    }

    pub fn blocked(&self) -> Vec<&TaskId> {
        self.ids_where(|t| matches!(t.status, TaskStatus::Blocked { .. }))
    }

    pub fn unfinished(&self) -> Vec<&TaskId> {
        self.ids_where(TaskSummary::is_unfinished)
    }

    /// Every task reached the state its dependents wait for.
    pub fn is_complete(&self) -> bool {
        self.abandoned().is_empty() && self.blocked().is_empty() && self.unfinished().is_empty()
    }

    pub fn record(&self, module: &str) -> Option<&FreezeRecord> {
        self.frozen.iter().find(|r| r.module == module)
    }
}

impl std::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Run {} ({}){}",
            self.run_id,
            self.finished_at.format("%Y-%m-%d %H:%M:%S UTC"),
            if self.aborted { " [aborted]" } else { "" }
        )?;
        for task in &self.tasks {
            write!(f, "  {:<28} {}", task.id.to_string(), task.status)?;
            if !task.attempts.is_empty() {
                write!(f, " ({} attempt(s))", task.attempts.len())?;
            }
            writeln!(f)?;
        }
        writeln!(
            f,
            "frozen={} succeeded={} abandoned={} blocked={} unfinished={}",
            self.frozen_tasks().len(),
            self.succeeded().len(),
            self.abandoned().len(),
            self.blocked().len(),
            self.unfinished().len()
        )
    }
}

/// Markdown listing of every frozen interface.
pub fn render_public_interfaces(records: &[FreezeRecord]) -> String {
    let mut out = String::from("# Public APIs\n");
    if records.is_empty() {
        out.push_str("\nNo interfaces frozen yet.\n");
        return out;
    }
    for record in records {
        out.push_str(&format!(
            "\n## {} (v{})\n\nDigest: `{}`  \nFrozen: {}\n\n",
            record.module,
            record.version,
            record.fingerprint.digest,
            record.frozen_at.format("%Y-%m-%d %H:%M:%S UTC")
        ));
        for signature in &record.fingerprint.signatures {
            out.push_str(&format!("- `{}`\n", signature));
        }
    }
    out
}

pub fn write_public_interfaces(path: &Path, records: &[FreezeRecord]) -> Result<()> {
    write_atomic(path, render_public_interfaces(records).as_bytes())
}

#[derive(Serialize)]
struct FingerprintEntry<'a> {
    version: u32,
    digest: &'a str,
    signatures: Vec<&'a str>,
}

/// Machine-readable companion of the public interfaces document.
pub fn write_fingerprint_file(path: &Path, records: &[FreezeRecord]) -> Result<()> {
    let map: BTreeMap<&str, FingerprintEntry<'_>> = records
        .iter()
        .map(|r| {
            (
                r.module.as_str(),
                FingerprintEntry {
                    version: r.version,
                    digest: &r.fingerprint.digest,
                    signatures: r.fingerprint.signatures.iter().map(String::as_str).collect(),
                },
            )
        })
        .collect();
    write_atomic(path, &serde_json::to_vec_pretty(&map)?)
}
