use thiserror::Error;

use crate::core::TaskId;

/// Errors raised while turning a Charter into a task plan.
///
/// All of these are fatal: no task executes when planning fails.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("Charter declares no modules")]
    EmptyCharter,

    #[error("Module declared twice: {0}")]
    DuplicateModule(String),

    #[error("Module {module} uses undeclared module {dependency}")]
    UnknownDependency { module: String, dependency: String },

    #[error("Module dependency cycle: {}", modules.join(" -> "))]
    Cycle { modules: Vec<String> },
}

/// An incompatible change to an already-frozen interface.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error(
    "Interface drift in {module}: frozen v{frozen_version} ({frozen_digest}) vs candidate {candidate_digest}; removed [{}], added [{}]",
    removed.join(", "),
    added.join(", ")
)]
pub struct DriftError {
    pub module: String,
    pub frozen_version: u32,
    pub frozen_digest: String,
    pub candidate_digest: String,
    pub removed: Vec<String>,
    pub added: Vec<String>,
}

/// Failures of the code-generation backend itself, as opposed to a
/// candidate that was produced but failed validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Backend returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed backend response: {0}")]
    Malformed(String),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),

    #[error("{0}")]
    Drift(#[from] DriftError),

    #[error("Generation failure: {0}")]
    Generation(#[from] GenerationError),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Invalid transition for {task} from {from} to {to}")]
    InvalidTransition {
        task: TaskId,
        from: String,
        to: String,
    },

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Adding dependency from {from} to {to} would create a cycle")]
    CyclicDependency { from: TaskId, to: TaskId },

    #[error("Task already running: {0}")]
    TaskAlreadyRunning(TaskId),

    #[error("Worker pool is full (max: {max})")]
    WorkerPoolFull { max: usize },

    #[error("Charter error: {0}")]
    Charter(String),

    #[error("Config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
