//! Durable module -> FreezeRecord map.
//!
//! Commits to the same module are serialized by a per-module lock. Every
//! change rewrites `freeze.json` atomically and appends one line to
//! `freeze.jsonl`, so the snapshot is always a committed state and the log
//! shows how it got there.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, RwLock};

use super::policy::{Compatibility, CompatibilityPolicy};
use crate::error::DriftError;
use crate::fingerprint::ApiFingerprint;
use crate::util::{append_line, blocking, write_atomic};
use crate::{klog, klog_debug, klog_warn, Error, Result};

pub const SNAPSHOT_FILE: &str = "freeze.json";
pub const LOG_FILE: &str = "freeze.jsonl";
/// Source each module was last frozen from, one file per module.
pub const SOURCES_DIR: &str = "frozen";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreezeRecord {
    pub module: String,
    pub fingerprint: ApiFingerprint,
    /// Starts at 1; bumped by every compatible re-freeze.
    pub version: u32,
    pub frozen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum FreezeOutcome {
    Created,
    /// Same digest as the existing record; nothing was written.
    Unchanged,
    Bumped { from: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreezeCommit {
    pub record: FreezeRecord,
    pub outcome: FreezeOutcome,
}

#[derive(Serialize)]
struct LogEntry<'a> {
    #[serde(flatten)]
    outcome: FreezeOutcome,
    record: &'a FreezeRecord,
}

pub struct FreezeRegistry {
    dir: Option<PathBuf>,
    records: RwLock<BTreeMap<String, FreezeRecord>>,
    sources: RwLock<HashMap<String, String>>,
    module_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FreezeRegistry {
    /// Registry backed by `dir`, loading the last committed snapshot.
    pub fn open(dir: &Path) -> Result<Self> {
        let snapshot = dir.join(SNAPSHOT_FILE);
        let records = if snapshot.exists() {
            let text = fs::read_to_string(&snapshot)?;
            let list: Vec<FreezeRecord> = serde_json::from_str(&text)?;
            list.into_iter().map(|r| (r.module.clone(), r)).collect()
        } else {
            BTreeMap::new()
        };
        klog_debug!(
            "FreezeRegistry::open dir={} records={}",
            dir.display(),
            records.len()
        );
        Ok(Self {
            dir: Some(dir.to_path_buf()),
            records: RwLock::new(records),
            sources: RwLock::new(HashMap::new()),
            module_locks: StdMutex::new(HashMap::new()),
        })
    }

    /// Registry that never touches the filesystem.
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            records: RwLock::new(BTreeMap::new()),
            sources: RwLock::new(HashMap::new()),
            module_locks: StdMutex::new(HashMap::new()),
        }
    }

    fn module_lock(&self, module: &str) -> Arc<Mutex<()>> {
        let mut locks = match self.module_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks
            .entry(module.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn lookup(&self, module: &str) -> Option<FreezeRecord> {
        self.records.read().await.get(module).cloned()
    }

    /// All records, sorted by module name.
    pub async fn records(&self) -> Vec<FreezeRecord> {
        self.records.read().await.values().cloned().collect()
    }

    /// Freeze `fingerprint` for `module` under `policy`.
    ///
    /// # Errors
    /// [`Error::Drift`] when the candidate is incompatible with the existing
    /// record; I/O errors when the snapshot cannot be persisted (the record
    /// is not updated in that case).
    pub async fn commit(
        &self,
        module: &str,
        fingerprint: &ApiFingerprint,
        policy: &dyn CompatibilityPolicy,
    ) -> Result<FreezeCommit> {
        let lock = self.module_lock(module);
        let _guard = lock.lock().await;

        let existing = self.lookup(module).await;
        let (version, outcome) = match &existing {
            None => (1, FreezeOutcome::Created),
            Some(frozen) => match policy.compare(&frozen.fingerprint, fingerprint) {
                Compatibility::Identical => {
                    klog_debug!("freeze {} unchanged at v{}", module, frozen.version);
                    return Ok(FreezeCommit {
                        record: frozen.clone(),
                        outcome: FreezeOutcome::Unchanged,
                    });
                }
                Compatibility::Compatible { added } => {
                    klog!(
                        "freeze {} v{} -> v{} (+{} signatures)",
                        module,
                        frozen.version,
                        frozen.version + 1,
                        added.len()
                    );
                    (
                        frozen.version + 1,
                        FreezeOutcome::Bumped {
                            from: frozen.version,
                        },
                    )
                }
                Compatibility::Incompatible { removed, added } => {
                    klog_warn!(
                        "drift in {} under {} policy: -{} +{}",
                        module,
                        policy.name(),
                        removed.len(),
                        added.len()
                    );
                    return Err(Error::Drift(DriftError {
                        module: module.to_string(),
                        frozen_version: frozen.version,
                        frozen_digest: frozen.fingerprint.digest.clone(),
                        candidate_digest: fingerprint.digest.clone(),
                        removed,
                        added,
                    }));
                }
            },
        };

        let record = FreezeRecord {
            module: module.to_string(),
            fingerprint: fingerprint.clone(),
            version,
            frozen_at: Utc::now(),
        };

        let mut records = self.records.write().await;
        let mut next = records.clone();
        next.insert(module.to_string(), record.clone());
        self.persist(&next, &record, outcome).await?;
        *records = next;

        Ok(FreezeCommit { record, outcome })
    }

    fn source_path(dir: &Path, module: &str) -> PathBuf {
        dir.join(SOURCES_DIR).join(format!("{}.src", module))
    }

    /// Remember the source `module` was frozen from, so a later drifting
    /// candidate can be rolled back.
    pub async fn keep_source(&self, module: &str, content: &str) -> Result<()> {
        if let Some(dir) = self.dir.clone() {
            let path = Self::source_path(&dir, module);
            let bytes = content.as_bytes().to_vec();
            blocking(move || write_atomic(&path, &bytes)).await?;
        }
        self.sources
            .write()
            .await
            .insert(module.to_string(), content.to_string());
        Ok(())
    }

    /// Source kept by [`keep_source`](Self::keep_source), if any.
    pub async fn frozen_source(&self, module: &str) -> Result<Option<String>> {
        if let Some(source) = self.sources.read().await.get(module) {
            return Ok(Some(source.clone()));
        }
        let Some(dir) = self.dir.as_deref() else {
            return Ok(None);
        };
        let path = Self::source_path(dir, module);
        if !path.exists() {
            return Ok(None);
        }
        let source = fs::read_to_string(&path)?;
        self.sources
            .write()
            .await
            .insert(module.to_string(), source.clone());
        Ok(Some(source))
    }

    async fn persist(
        &self,
        records: &BTreeMap<String, FreezeRecord>,
        record: &FreezeRecord,
        outcome: FreezeOutcome,
    ) -> Result<()> {
        let Some(dir) = self.dir.clone() else {
            return Ok(());
        };
        let snapshot: Vec<&FreezeRecord> = records.values().collect();
        let snapshot_json = serde_json::to_vec_pretty(&snapshot)?;
        let log_line = serde_json::to_string(&LogEntry { outcome, record })?;

        blocking(move || {
            write_atomic(&dir.join(SNAPSHOT_FILE), &snapshot_json)?;
            append_line(&dir.join(LOG_FILE), &log_line)
        })
        .await
    }
}

impl std::fmt::Debug for FreezeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreezeRegistry")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}
