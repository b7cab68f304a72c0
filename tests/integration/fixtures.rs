//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A temporary project directory with a state dir
//! - A scripted code-generation backend that records every request
//! - An in-process oracle driven by markers in the candidate source
//! - Charter builders

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use kiln::charter::{Charter, Language, ModuleSpec};
use kiln::core::{Finding, TaskId};
use kiln::error::GenerationError;
use kiln::fingerprint::Fingerprinter;
use kiln::freeze::{CompatibilityRule, FreezeRegistry};
use kiln::oracle::{interface_findings, Oracle, Report};
use kiln::orchestration::{
    build_plan, AttemptExecutor, CodeGenerator, ExecutorSettings, GenerationRequest,
    Orchestrator,
};
use kiln::report::RunReport;
use kiln::store::{ResumeOptions, RunStore};
use kiln::workspace::{Artifact, Workspace};

/// Candidates containing this line fail their unit tests.
pub const FAILING_TEST: &str = "# FAILING TEST";

/// Python source defining one top-level function per signature.
pub fn python(signatures: &[&str]) -> String {
    signatures
        .iter()
        .map(|s| format!("def {}:\n    return None\n", s))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Like [`python`], but rejected by [`MarkerOracle`].
pub fn failing(signatures: &[&str]) -> String {
    format!("{}\n{}", FAILING_TEST, python(signatures))
}

pub fn module(name: &str, interface: &[&str], uses: &[&str]) -> ModuleSpec {
    ModuleSpec::new(name, format!("src/{}.py", name))
        .with_interface(interface.iter().copied())
        .using(uses.iter().copied())
}

pub fn charter(rule: CompatibilityRule, modules: Vec<ModuleSpec>) -> Charter {
    modules
        .into_iter()
        .fold(Charter::new("integration", rule), |c, m| c.with_module(m))
}

/// Backend replying from per-module scripts. The n-th request for a task
/// gets the n-th reply; the last reply repeats.
pub struct ScriptedBackend {
    scripts: Mutex<HashMap<String, Vec<String>>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn script(&self, module: &str, replies: Vec<String>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(module.to_string(), replies);
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_for(&self, task: &TaskId) -> Vec<GenerationRequest> {
        self.requests()
            .into_iter()
            .filter(|r| &r.task == task)
            .collect()
    }

    pub fn clear_requests(&self) {
        self.requests.lock().unwrap().clear();
    }
}

#[async_trait]
impl CodeGenerator for ScriptedBackend {
    async fn generate(&self, request: &GenerationRequest) -> Result<Artifact, GenerationError> {
        let nth = {
            let mut requests = self.requests.lock().unwrap();
            let nth = requests.iter().filter(|r| r.task == request.task).count();
            requests.push(request.clone());
            nth
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        let scripts = self.scripts.lock().unwrap();
        let script = scripts
            .get(&request.module.name)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                GenerationError::Malformed(format!("no script for {}", request.module.name))
            })?;
        let reply = script[nth.min(script.len() - 1)].clone();
        Ok(Artifact::new(
            &request.module.name,
            &request.module.path,
            reply,
        ))
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

/// Checks the declared interface and fails candidates carrying
/// [`FAILING_TEST`].
pub struct MarkerOracle;

#[async_trait]
impl Oracle for MarkerOracle {
    async fn validate(&self, module: &ModuleSpec, artifact: &Artifact) -> kiln::Result<Report> {
        let fingerprint = Fingerprinter::new(Language::Python).fingerprint(&artifact.content);
        let static_findings = interface_findings(module, artifact, &fingerprint);
        let mut test_failures = Vec::new();
        if artifact.content.contains(FAILING_TEST) {
            test_failures.push(Finding::new(
                "unit_test",
                &format!("test_{}: assert result == expected", module.name),
            ));
        }
        Ok(Report::new(static_findings, test_failures, fingerprint))
    }
}

/// A project directory shared by consecutive runs.
pub struct Project {
    pub dir: TempDir,
    pub backend: Arc<ScriptedBackend>,
}

impl Project {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp directory"),
            backend: Arc::new(ScriptedBackend::new()),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn state(&self) -> PathBuf {
        self.root().join(".kiln")
    }

    pub fn store(&self) -> RunStore {
        RunStore::open(&self.state()).expect("Failed to open run store")
    }

    /// Registry as a new process would see it.
    pub fn registry(&self) -> Arc<FreezeRegistry> {
        Arc::new(FreezeRegistry::open(&self.state()).expect("Failed to open registry"))
    }

    pub fn read(&self, relative: &str) -> Option<String> {
        std::fs::read_to_string(self.root().join(relative)).ok()
    }

    pub fn orchestrator(&self, charter: &Charter, workers: usize) -> Orchestrator {
        let executor = AttemptExecutor::new(
            Arc::clone(&self.backend) as Arc<dyn CodeGenerator>,
            Arc::new(MarkerOracle),
            self.registry(),
            Workspace::new(self.root()),
            charter.compatibility.policy(),
            charter.language,
        )
        .with_settings(ExecutorSettings {
            generation_timeout: Duration::from_secs(5),
            oracle_timeout: Duration::from_secs(5),
            backend_retries: 0,
            backoff_base: Duration::from_millis(1),
        });
        Orchestrator::new(Arc::new(executor), workers).with_store(self.store())
    }

    /// Plan, restore saved progress, and run to completion.
    pub async fn run(
        &self,
        charter: &Charter,
        options: ResumeOptions,
        max_retries: u32,
    ) -> RunReport {
        let mut dag = build_plan(charter).expect("Failed to plan charter");
        self.store()
            .prepare(&mut dag, &options)
            .expect("Failed to prepare plan");
        self.orchestrator(charter, 2)
            .run(dag, max_retries)
            .await
            .expect("Run failed")
    }

    pub async fn resume(&self, charter: &Charter, max_retries: u32) -> RunReport {
        self.run(charter, ResumeOptions::default(), max_retries).await
    }

    pub async fn fresh(&self, charter: &Charter, max_retries: u32) -> RunReport {
        let options = ResumeOptions {
            fresh: true,
            regenerate: Vec::new(),
        };
        self.run(charter, options, max_retries).await
    }
}
