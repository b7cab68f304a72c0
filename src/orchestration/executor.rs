//! Attempt execution: one generation-and-validation cycle of a task.
//!
//! An executor never changes task status. It returns the [`Attempt`] to
//! record, and the scheduler decides what the verdict means for the task.
//! `Err` is reserved for infrastructure failures (workspace or registry
//! persistence) that should stop the run.

use std::sync::Arc;
use std::time::Duration;

use crate::charter::{Language, ModuleSpec};
use crate::config::Config;
use crate::core::{
    Attempt, FailureKind, FailureTrace, Finding, TaskId, TaskKind,
};
use crate::error::GenerationError;
use crate::freeze::{CompatibilityPolicy, FreezeRegistry};
use crate::oracle::{Oracle, Report};
use crate::orchestration::backend::{CodeGenerator, FrozenInterface, GenerationRequest};
use crate::util::{backoff_delay, with_timeout};
use crate::workspace::{Artifact, Workspace};
use crate::{klog, klog_debug, klog_warn, Error, Result};

/// Time budgets and backend retry policy for attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorSettings {
    pub generation_timeout: Duration,
    pub oracle_timeout: Duration,
    /// Extra backend calls after the first one fails.
    pub backend_retries: u32,
    pub backoff_base: Duration,
}

impl ExecutorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            generation_timeout: config.generation_timeout(),
            oracle_timeout: config.oracle_timeout(),
            backend_retries: config.backend.backend_retries,
            backoff_base: config.backend.backoff_base(),
        }
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Snapshot of what an attempt needs to know about its task.
#[derive(Debug, Clone)]
pub struct AttemptInput {
    pub task: TaskId,
    pub module: ModuleSpec,
    pub ordinal: u32,
    pub deps: Vec<TaskId>,
    pub prior_failures: Vec<FailureTrace>,
}

pub struct AttemptExecutor {
    generator: Arc<dyn CodeGenerator>,
    oracle: Arc<dyn Oracle>,
    registry: Arc<FreezeRegistry>,
    workspace: Workspace,
    policy: &'static dyn CompatibilityPolicy,
    language: Language,
    settings: ExecutorSettings,
}

impl AttemptExecutor {
    pub fn new(
        generator: Arc<dyn CodeGenerator>,
        oracle: Arc<dyn Oracle>,
        registry: Arc<FreezeRegistry>,
        workspace: Workspace,
        policy: &'static dyn CompatibilityPolicy,
        language: Language,
    ) -> Self {
        Self {
            generator,
            oracle,
            registry,
            workspace,
            policy,
            language,
            settings: ExecutorSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: ExecutorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn registry(&self) -> &Arc<FreezeRegistry> {
        &self.registry
    }

    pub async fn execute(&self, input: AttemptInput) -> Result<Attempt> {
        klog_debug!("execute {} attempt={}", input.task, input.ordinal);
        match input.task.kind {
            TaskKind::Implement => self.implement(input).await,
            TaskKind::Freeze => self.freeze(input).await,
        }
    }

    async fn dependency_interfaces(&self, deps: &[TaskId]) -> Vec<FrozenInterface> {
        let mut interfaces = Vec::new();
        for dep in deps.iter().filter(|d| d.kind == TaskKind::Freeze) {
            if let Some(record) = self.registry.lookup(&dep.module).await {
                interfaces.push(FrozenInterface::from(&record));
            }
        }
        interfaces
    }

    /// Call the backend, retrying backend failures with exponential backoff.
    ///
    /// The outer `Err` is a timeout; the inner one is the last backend error.
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<std::result::Result<Artifact, GenerationError>> {
        let mut retry = 0;
        loop {
            let outcome = with_timeout(self.settings.generation_timeout, async {
                Ok(self.generator.generate(request).await)
            })
            .await?;
            match outcome {
                Ok(artifact) => return Ok(Ok(artifact)),
                Err(e) if retry < self.settings.backend_retries => {
                    let delay = backoff_delay(self.settings.backoff_base, retry);
                    klog_warn!(
                        "backend failed for {} ({}); retrying in {:?}",
                        request.task,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(e) => return Ok(Err(e)),
            }
        }
    }

    async fn check<F>(&self, validation: F) -> std::result::Result<Report, FailureTrace>
    where
        F: std::future::Future<Output = Result<Report>>,
    {
        match with_timeout(self.settings.oracle_timeout, validation).await {
            Ok(report) => Ok(report),
            Err(Error::Timeout(d)) => Err(FailureTrace::new(
                FailureKind::Timeout,
                &format!("validation timed out after {:?}", d),
            )),
            Err(e) => Err(FailureTrace::new(
                FailureKind::Validation,
                &format!("oracle error: {}", e),
            )),
        }
    }

    async fn implement(&self, input: AttemptInput) -> Result<Attempt> {
        let request = GenerationRequest {
            task: input.task.clone(),
            module: input.module.clone(),
            language: self.language,
            attempt: input.ordinal,
            dependency_interfaces: self.dependency_interfaces(&input.deps).await,
            prior_failures: input.prior_failures,
            workspace_files: self.workspace.source_files(self.language).await?,
        };
        klog_debug!(
            "{} attempt {} via {}",
            request.task,
            request.attempt,
            self.generator.model_name()
        );

        let artifact = match self.generate(&request).await {
            Ok(Ok(artifact)) => artifact,
            Ok(Err(e)) => {
                return Ok(Attempt::failed(
                    input.ordinal,
                    FailureTrace::new(FailureKind::Generation, &e.to_string()),
                ));
            }
            Err(Error::Timeout(d)) => {
                return Ok(Attempt::failed(
                    input.ordinal,
                    FailureTrace::new(
                        FailureKind::Timeout,
                        &format!("generation timed out after {:?}", d),
                    ),
                ));
            }
            Err(e) => return Err(e),
        };

        let report = match self.check(self.oracle.validate(&input.module, &artifact)).await {
            Ok(report) => report,
            Err(trace) => {
                return Ok(Attempt::failed(input.ordinal, trace).with_artifact(artifact.to_ref()));
            }
        };

        if let Some(trace) = report.failure_trace() {
            klog!(
                "{} attempt {} rejected: {}",
                input.task,
                input.ordinal,
                trace.summary
            );
            return Ok(Attempt::failed(input.ordinal, trace)
                .with_artifact(artifact.to_ref())
                .with_fingerprint(&report.fingerprint.digest));
        }

        let reference = self.workspace.commit(&artifact).await?;
        klog!(
            "{} attempt {} passed, committed {}",
            input.task,
            input.ordinal,
            reference.path.display()
        );
        Ok(Attempt::passed(input.ordinal)
            .with_artifact(reference)
            .with_fingerprint(&report.fingerprint.digest))
    }

    async fn freeze(&self, input: AttemptInput) -> Result<Attempt> {
        let module = &input.module;
        let Some(artifact) = self.workspace.load(&module.name, &module.path).await? else {
            return Ok(Attempt::failed(
                input.ordinal,
                FailureTrace::new(
                    FailureKind::Validation,
                    &format!("no committed artifact at {}", module.path.display()),
                ),
            ));
        };

        let report = match self.check(self.oracle.validate_freeze(module, &artifact)).await {
            Ok(report) => report,
            Err(trace) => {
                return Ok(Attempt::failed(input.ordinal, trace).with_artifact(artifact.to_ref()));
            }
        };
        if let Some(trace) = report.failure_trace() {
            return Ok(Attempt::failed(input.ordinal, trace)
                .with_artifact(artifact.to_ref())
                .with_fingerprint(&report.fingerprint.digest));
        }

        let fingerprint = &report.fingerprint;
        match self
            .registry
            .commit(&module.name, fingerprint, self.policy)
            .await
        {
            Ok(commit) => {
                self.registry
                    .keep_source(&module.name, &artifact.content)
                    .await?;
                klog!(
                    "{} frozen at v{} ({})",
                    module.name,
                    commit.record.version,
                    fingerprint.short()
                );
                Ok(Attempt::passed(input.ordinal)
                    .with_artifact(artifact.to_ref())
                    .with_fingerprint(&fingerprint.digest)
                    .with_freeze_version(commit.record.version))
            }
            Err(Error::Drift(drift)) => {
                let mut findings: Vec<Finding> = drift
                    .removed
                    .iter()
                    .map(|s| Finding::new("drift", &format!("removed `{}`", s)))
                    .collect();
                findings.extend(
                    drift
                        .added
                        .iter()
                        .map(|s| Finding::new("drift", &format!("added `{}`", s))),
                );
                let trace = FailureTrace::new(FailureKind::Drift, &drift.to_string())
                    .with_findings(findings);
                self.restore_frozen(module).await?;
                Ok(Attempt::failed(input.ordinal, trace)
                    .with_artifact(artifact.to_ref())
                    .with_fingerprint(&fingerprint.digest))
            }
            Err(e) => Err(e),
        }
    }

    /// Put the source `module` was last frozen from back into the workspace.
    async fn restore_frozen(&self, module: &ModuleSpec) -> Result<()> {
        match self.registry.frozen_source(&module.name).await? {
            Some(source) => {
                let previous = Artifact::new(&module.name, &module.path, source);
                self.workspace.commit(&previous).await?;
                klog_warn!(
                    "restored frozen source of {} at {}",
                    module.name,
                    module.path.display()
                );
            }
            None => klog_warn!(
                "no frozen source kept for {}; {} keeps the drifted candidate",
                module.name,
                module.path.display()
            ),
        }
        Ok(())
    }
}
