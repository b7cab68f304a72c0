//! Oracle: validation verdicts and interface fingerprints for candidates.
//!
//! The oracle is stateless per invocation. It never mutates the committed
//! workspace; the orchestrator decides what to do with a verdict.

mod command;

pub use command::{parse_output, CommandOracle};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::charter::ModuleSpec;
use crate::core::{FailureKind, FailureTrace, Finding, Location};
use crate::fingerprint::{signature_name, ApiFingerprint};
use crate::workspace::Artifact;
use crate::Result;

/// Outcome of validating one artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub passed: bool,
    pub static_findings: Vec<Finding>,
    pub test_failures: Vec<Finding>,
    pub fingerprint: ApiFingerprint,
    /// A check ran past its time budget.
    #[serde(default)]
    pub timed_out: bool,
}

impl Report {
    /// Build a report, deriving `passed` from the findings.
    pub fn new(
        static_findings: Vec<Finding>,
        test_failures: Vec<Finding>,
        fingerprint: ApiFingerprint,
    ) -> Self {
        let passed = static_findings.is_empty() && test_failures.is_empty();
        Self {
            passed,
            static_findings,
            test_failures,
            fingerprint,
            timed_out: false,
        }
    }

    pub fn passing(fingerprint: ApiFingerprint) -> Self {
        Self::new(Vec::new(), Vec::new(), fingerprint)
    }

    pub fn with_timeout(mut self) -> Self {
        self.timed_out = true;
        self.passed = false;
        self
    }

    pub fn findings(&self) -> impl Iterator<Item = &Finding> {
        self.static_findings.iter().chain(self.test_failures.iter())
    }

    /// Failure trace for a rejected artifact; `None` when it passed.
    pub fn failure_trace(&self) -> Option<FailureTrace> {
        if self.passed {
            return None;
        }
        let kind = if self.timed_out {
            FailureKind::Timeout
        } else {
            FailureKind::Validation
        };
        let summary = format!(
            "{} static finding(s), {} test failure(s)",
            self.static_findings.len(),
            self.test_failures.len()
        );
        Some(FailureTrace::new(kind, &summary).with_findings(self.findings().cloned().collect()))
    }
}

#[async_trait]
pub trait Oracle: Send + Sync {
    async fn validate(&self, module: &ModuleSpec, artifact: &Artifact) -> Result<Report>;

    /// Validation before an interface is frozen. Implementations with
    /// extra gates override this.
    async fn validate_freeze(&self, module: &ModuleSpec, artifact: &Artifact) -> Result<Report> {
        self.validate(module, artifact).await
    }
}

/// `interface` findings for every declared name missing from the surface.
pub fn interface_findings(
    module: &ModuleSpec,
    artifact: &Artifact,
    fingerprint: &ApiFingerprint,
) -> Vec<Finding> {
    let exposed = fingerprint.names();
    module
        .interface
        .iter()
        .filter_map(|declared| {
            let name = signature_name(declared)?;
            if exposed.contains(&name) {
                return None;
            }
            Some(
                Finding::new(
                    "interface",
                    &format!("declared `{}` is not part of the public surface", declared),
                )
                .at(Location {
                    file: artifact.path.clone(),
                    line: None,
                    column: None,
                }),
            )
        })
        .collect()
}
