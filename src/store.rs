//! Persisted run state: task snapshot, transition journal, attempt logs.
//!
//! Layout under the state directory:
//!
//! ```text
//! tasks.json                  latest task snapshot (atomic rewrite)
//! journal.jsonl               one line per status transition
//! attempts/<kind>.<module>.jsonl  attempts of one task, in arrival order
//! plan.json                   last plan printed by `kiln plan`
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::{Attempt, Task, TaskDAG, TaskId, TaskStatus};
use crate::util::{append_line, blocking, write_atomic};
use crate::{klog, klog_debug, klog_warn, Error, Result};

pub const TASKS_FILE: &str = "tasks.json";
pub const JOURNAL_FILE: &str = "journal.jsonl";
pub const ATTEMPTS_DIR: &str = "attempts";
pub const PLAN_FILE: &str = "plan.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub saved_at: DateTime<Utc>,
    pub tasks: Vec<Task>,
}

impl Snapshot {
    pub fn of(dag: &TaskDAG) -> Self {
        Self {
            saved_at: Utc::now(),
            tasks: dag.all_tasks().into_iter().cloned().collect(),
        }
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    /// Carry persisted progress into a freshly planned DAG.
    ///
    /// A task is restored only when its module declaration is unchanged;
    /// tasks that no longer exist in the plan are ignored. Returns the ids
    /// that were restored.
    pub fn apply(&self, dag: &mut TaskDAG) -> Vec<TaskId> {
        let mut restored = Vec::new();
        for saved in &self.tasks {
            let Some(task) = dag.get_task_mut(&saved.id) else {
                klog_debug!("snapshot task {} no longer planned", saved.id);
                continue;
            };
            if task.module != saved.module {
                klog_warn!(
                    "module declaration of {} changed since last run; starting it over",
                    saved.id
                );
                continue;
            }
            task.status = saved.status.clone();
            task.attempts = saved.attempts.clone();
            task.created_at = saved.created_at;
            task.started_at = saved.started_at;
            task.completed_at = saved.completed_at;
            task.restore();
            restored.push(saved.id.clone());
        }
        restored
    }
}

/// How a run treats progress persisted by earlier runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResumeOptions {
    /// Discard task progress. Freeze records are kept.
    pub fresh: bool,
    /// Modules whose tasks start over even if they completed.
    pub regenerate: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub at: DateTime<Utc>,
    pub task: TaskId,
    pub status: TaskStatus,
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct RunStore {
    dir: PathBuf,
}

impl RunStore {
    pub fn open(dir: &Path) -> Result<Self> {
        if !dir.exists() {
            klog_debug!("Creating state directory: {}", dir.display());
            fs::create_dir_all(dir)?;
        }
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn attempt_log_path(&self, id: &TaskId) -> PathBuf {
        self.dir
            .join(ATTEMPTS_DIR)
            .join(format!("{}.jsonl", id.slug()))
    }

    pub fn load_snapshot(&self) -> Result<Option<Snapshot>> {
        let path = self.dir.join(TASKS_FILE);
        klog_debug!("RunStore::load_snapshot path={}", path.display());
        if !path.exists() {
            return Ok(None);
        }
        let snapshot: Snapshot = serde_json::from_str(&fs::read_to_string(&path)?)?;
        klog_debug!("Snapshot loaded: {} tasks", snapshot.tasks.len());
        Ok(Some(snapshot))
    }

    pub async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let contents = serde_json::to_vec_pretty(snapshot)?;
        let path = self.dir.join(TASKS_FILE);
        blocking(move || write_atomic(&path, &contents)).await
    }

    pub async fn record_transition(&self, task: &Task) -> Result<()> {
        let entry = JournalEntry {
            at: Utc::now(),
            task: task.id.clone(),
            status: task.status.clone(),
            attempts: task.attempt_count(),
        };
        let line = serde_json::to_string(&entry)?;
        let path = self.dir.join(JOURNAL_FILE);
        blocking(move || append_line(&path, &line)).await
    }

    pub async fn append_attempt(&self, id: &TaskId, attempt: &Attempt) -> Result<()> {
        let line = serde_json::to_string(attempt)?;
        let path = self.attempt_log_path(id);
        blocking(move || append_line(&path, &line)).await
    }

    pub fn read_attempts(&self, id: &TaskId) -> Result<Vec<Attempt>> {
        read_jsonl(&self.attempt_log_path(id))
    }

    pub fn read_journal(&self) -> Result<Vec<JournalEntry>> {
        read_jsonl(&self.dir.join(JOURNAL_FILE))
    }

    pub fn save_plan(&self, dag: &TaskDAG) -> Result<()> {
        let contents = serde_json::to_vec_pretty(&Snapshot::of(dag))?;
        write_atomic(&self.dir.join(PLAN_FILE), &contents)
    }

    /// Carry persisted progress into a freshly planned `dag` according to
    /// `options`. Returns the ids restored from the snapshot.
    pub fn prepare(&self, dag: &mut TaskDAG, options: &ResumeOptions) -> Result<Vec<TaskId>> {
        for module in &options.regenerate {
            if !dag.contains_task(&TaskId::implement(module)) {
                return Err(Error::Config(format!(
                    "cannot regenerate unknown module: {}",
                    module
                )));
            }
        }

        let restored = if options.fresh {
            klog!("starting fresh; discarding saved progress");
            self.reset()?;
            Vec::new()
        } else {
            match self.load_snapshot()? {
                Some(snapshot) => snapshot.apply(dag),
                None => Vec::new(),
            }
        };

        // Everything built on a regenerated module starts over with it, so a
        // drifting re-freeze finds its consumers unfinished and blocks them.
        let mut regenerated = BTreeSet::new();
        for module in &options.regenerate {
            let implement = TaskId::implement(module);
            regenerated.extend(dag.transitive_dependents(&implement));
            regenerated.insert(implement);
        }
        for id in &regenerated {
            if let Some(task) = dag.get_task_mut(id) {
                klog!("regenerating {}", task.id);
                task.reset();
            }
        }
        Ok(restored)
    }

    /// Forget task progress. Freeze records live elsewhere and survive.
    pub fn reset(&self) -> Result<()> {
        klog_debug!("RunStore::reset dir={}", self.dir.display());
        for file in [TASKS_FILE, JOURNAL_FILE] {
            let path = self.dir.join(file);
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        let attempts = self.dir.join(ATTEMPTS_DIR);
        if attempts.exists() {
            fs::remove_dir_all(attempts)?;
        }
        Ok(())
    }
}

fn read_jsonl<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(path)?;
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(Into::into))
        .collect()
}
