//! Oracle that runs configured shell commands in a throwaway sandbox.

use async_trait::async_trait;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::Command;

use super::{interface_findings, Oracle, Report};
use crate::charter::{Language, ModuleSpec};
use crate::config::{OracleConfig, OracleStep};
use crate::core::{Finding, Location};
use crate::fingerprint::Fingerprinter;
use crate::util::blocking;
use crate::workspace::{Artifact, SKIP_DIRS};
use crate::{klog_debug, klog_trace, Error, Result};

/// `file:line[:col]: message`
static LOCATED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(?P<file>[^\s:][^:\n]*):(?P<line>\d+)(?::(?P<col>\d+))?:\s*(?P<msg>.+)$")
        .unwrap()
});

const MAX_FINDINGS_PER_STEP: usize = 50;
const TAIL_LINES: usize = 20;

/// Directories never copied into the sandbox.

/// Turn a failing step's output into findings.
///
/// Located lines become one finding each; otherwise the tail of the output
/// is reported as a single finding.
pub fn parse_output(check: &str, output: &str, exit_code: Option<i32>) -> Vec<Finding> {
    let located: Vec<Finding> = LOCATED_RE
        .captures_iter(output)
        .take(MAX_FINDINGS_PER_STEP)
        .map(|caps| {
            let location = Location {
                file: PathBuf::from(&caps["file"]),
                line: caps["line"].parse().ok(),
                column: caps.name("col").and_then(|c| c.as_str().parse().ok()),
            };
            Finding::new(check, caps["msg"].trim()).at(location)
        })
        .collect();
    if !located.is_empty() {
        return located;
    }

    let lines: Vec<&str> = output.lines().filter(|l| !l.trim().is_empty()).collect();
    let message = if lines.is_empty() {
        match exit_code {
            Some(code) => format!("exited with status {}", code),
            None => "terminated by signal".to_string(),
        }
    } else {
        lines[lines.len().saturating_sub(TAIL_LINES)..].join("\n")
    };
    vec![Finding::new(check, &message)]
}

enum StepOutcome {
    Passed,
    Failed(Vec<Finding>),
    TimedOut(Finding),
}

#[derive(Debug, Clone)]
pub struct CommandOracle {
    workspace_root: PathBuf,
    /// Extra directory names left out of the sandbox (the state dir).
    exclude: Vec<String>,
    fingerprinter: Fingerprinter,
    config: OracleConfig,
    step_timeout: Duration,
}

impl CommandOracle {
    pub fn new(
        workspace_root: impl Into<PathBuf>,
        language: Language,
        config: OracleConfig,
        step_timeout: Duration,
    ) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            exclude: Vec::new(),
            fingerprinter: Fingerprinter::new(language),
            config,
            step_timeout,
        }
    }

    pub fn excluding(mut self, dir_name: &str) -> Self {
        self.exclude.push(dir_name.to_string());
        self
    }

    async fn sandbox(&self, artifact: &Artifact) -> Result<TempDir> {
        let source = self.workspace_root.clone();
        let exclude = self.exclude.clone();
        let overlay_path = artifact.path.clone();
        let overlay = artifact.content.clone();
        blocking(move || {
            let sandbox = TempDir::new()?;
            if source.exists() {
                copy_tree(&source, sandbox.path(), &exclude)?;
            }
            let target = sandbox.path().join(&overlay_path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&target, overlay)?;
            Ok(sandbox)
        })
        .await
    }

    async fn run_step(
        &self,
        step: &OracleStep,
        module: &str,
        artifact: &Artifact,
        cwd: &Path,
    ) -> Result<StepOutcome> {
        let command = step.render(module, &artifact.path);
        klog_debug!("oracle step={} module={} $ {}", step.name, module, command);

        let output = match tokio::time::timeout(
            self.step_timeout,
            Command::new("sh")
                .arg("-c")
                .arg(&command)
                .current_dir(cwd)
                .kill_on_drop(true)
                .output(),
        )
        .await
        {
            Ok(output) => output.map_err(Error::Io)?,
            Err(_) => {
                klog_debug!("oracle step={} timed out", step.name);
                return Ok(StepOutcome::TimedOut(Finding::new(
                    &step.name,
                    &format!("timed out after {}s", self.step_timeout.as_secs()),
                )));
            }
        };

        if output.status.success() {
            klog_debug!("oracle step={} => OK", step.name);
            return Ok(StepOutcome::Passed);
        }

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        klog_debug!(
            "oracle step={} => FAIL (status {:?})",
            step.name,
            output.status.code()
        );
        klog_trace!("oracle step={} output:\n{}", step.name, text);
        Ok(StepOutcome::Failed(parse_output(
            &step.name,
            &text,
            output.status.code(),
        )))
    }

    async fn run(&self, module: &ModuleSpec, artifact: &Artifact, gates: bool) -> Result<Report> {
        let fingerprint = self.fingerprinter.fingerprint(&artifact.content);
        let mut static_findings = interface_findings(module, artifact, &fingerprint);
        let mut test_failures = Vec::new();
        let mut timed_out = false;

        let fail_fast = self.config.fail_fast;
        if fail_fast && !static_findings.is_empty() {
            return Ok(Report::new(static_findings, test_failures, fingerprint));
        }

        let sandbox = self.sandbox(artifact).await?;
        let mut plan: Vec<(&OracleStep, bool)> = self
            .config
            .static_steps
            .iter()
            .map(|s| (s, true))
            .collect();
        plan.extend(self.config.test_steps.iter().map(|s| (s, false)));
        if gates {
            plan.extend(self.config.freeze_gates.iter().map(|s| (s, false)));
        }

        for (step, is_static) in plan {
            let findings = match self
                .run_step(step, &module.name, artifact, sandbox.path())
                .await?
            {
                StepOutcome::Passed => continue,
                StepOutcome::Failed(findings) => findings,
                StepOutcome::TimedOut(finding) => {
                    timed_out = true;
                    vec![finding]
                }
            };
            if is_static {
                static_findings.extend(findings);
            } else {
                test_failures.extend(findings);
            }
            if fail_fast {
                break;
            }
        }

        let report = Report::new(static_findings, test_failures, fingerprint);
        Ok(if timed_out { report.with_timeout() } else { report })
    }
}

#[async_trait]
impl Oracle for CommandOracle {
    async fn validate(&self, module: &ModuleSpec, artifact: &Artifact) -> Result<Report> {
        self.run(module, artifact, false).await
    }

    async fn validate_freeze(&self, module: &ModuleSpec, artifact: &Artifact) -> Result<Report> {
        self.run(module, artifact, true).await
    }
}

fn copy_tree(from: &Path, to: &Path, exclude: &[String]) -> Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let name = entry.file_name();
        let name_str = name.to_string_lossy().into_owned();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            if SKIP_DIRS.contains(&name_str.as_str()) || exclude.contains(&name_str) {
                continue;
            }
            copy_tree(&entry.path(), &to.join(&name), exclude)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), to.join(&name))?;
        }
    }
    Ok(())
}
