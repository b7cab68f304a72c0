//! Attempt records: one generation-and-validation cycle of a task.
//!
//! Attempts are immutable once recorded. The failure traces of earlier
//! attempts are handed, by value, to the next generation request of the
//! same task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Why an attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The backend never produced a candidate (after backoff retries).
    Generation,
    /// Static checks or tests rejected the candidate.
    Validation,
    /// Generation or validation exceeded its time budget.
    Timeout,
    /// The candidate's interface is incompatible with its freeze record.
    Drift,
}

impl FailureKind {
    /// Whether the failure consumes the task for good.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FailureKind::Drift)
    }

    /// Whether the trace is useful as feedback for the next generation.
    pub fn is_feedback(&self) -> bool {
        matches!(self, FailureKind::Validation | FailureKind::Timeout)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Generation => write!(f, "generation"),
            FailureKind::Validation => write!(f, "validation"),
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::Drift => write!(f, "drift"),
        }
    }
}

/// Source location a finding points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub file: PathBuf,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.file.display())?;
        if let Some(line) = self.line {
            write!(f, ":{}", line)?;
            if let Some(column) = self.column {
                write!(f, ":{}", column)?;
            }
        }
        Ok(())
    }
}

/// One failing check: which check, what it said, and where.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub check: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

impl Finding {
    pub fn new(check: &str, message: &str) -> Self {
        Self {
            check: check.to_string(),
            message: message.to_string(),
            location: None,
        }
    }

    pub fn at(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }
}

impl std::fmt::Display for Finding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.location {
            Some(loc) => write!(f, "[{}] {}: {}", self.check, loc, self.message),
            None => write!(f, "[{}] {}", self.check, self.message),
        }
    }
}

/// Structured failure detail of a single attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureTrace {
    pub kind: FailureKind,
    pub summary: String,
    #[serde(default)]
    pub findings: Vec<Finding>,
}

impl FailureTrace {
    pub fn new(kind: FailureKind, summary: &str) -> Self {
        Self {
            kind,
            summary: summary.to_string(),
            findings: Vec::new(),
        }
    }

    pub fn with_findings(mut self, findings: Vec<Finding>) -> Self {
        self.findings = findings;
        self
    }

    /// Plain-text rendering used as generation feedback.
    pub fn render(&self) -> String {
        let mut out = format!("{} failure: {}", self.kind, self.summary);
        for finding in &self.findings {
            out.push_str("\n- ");
            out.push_str(&finding.to_string());
        }
        out
    }
}

/// Outcome of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "verdict", content = "kind")]
pub enum Verdict {
    Passed,
    Failed(FailureKind),
}

impl Verdict {
    pub fn passed(&self) -> bool {
        matches!(self, Verdict::Passed)
    }
}

/// Reference to a committed (or candidate) artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub path: PathBuf,
    /// SHA-256 of the artifact content.
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    /// 1-based position in the task's history.
    pub ordinal: u32,
    pub verdict: Verdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureTrace>,
    /// Digest of the interface fingerprint the oracle computed, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    /// Freeze version committed by this attempt (freeze tasks only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freeze_version: Option<u32>,
    pub recorded_at: DateTime<Utc>,
}

impl Attempt {
    pub fn passed(ordinal: u32) -> Self {
        Self {
            ordinal,
            verdict: Verdict::Passed,
            artifact: None,
            failure: None,
            fingerprint: None,
            freeze_version: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn failed(ordinal: u32, trace: FailureTrace) -> Self {
        Self {
            ordinal,
            verdict: Verdict::Failed(trace.kind),
            artifact: None,
            failure: Some(trace),
            fingerprint: None,
            freeze_version: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_artifact(mut self, artifact: ArtifactRef) -> Self {
        self.artifact = Some(artifact);
        self
    }

    pub fn with_fingerprint(mut self, digest: &str) -> Self {
        self.fingerprint = Some(digest.to_string());
        self
    }

    pub fn with_freeze_version(mut self, version: u32) -> Self {
        self.freeze_version = Some(version);
        self
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self.verdict {
            Verdict::Passed => None,
            Verdict::Failed(kind) => Some(kind),
        }
    }
}
