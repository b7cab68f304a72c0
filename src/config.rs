use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{klog_debug, Error, Result};

pub const CONFIG_FILE: &str = "kiln.toml";

/// One shell command the oracle runs inside its sandbox.
///
/// `{path}` expands to the artifact path and `{module}` to the module name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OracleStep {
    pub name: String,
    pub command: String,
}

impl OracleStep {
    pub fn new(name: &str, command: &str) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
        }
    }

    pub fn render(&self, module: &str, path: &Path) -> String {
        self.command
            .replace("{path}", &path.to_string_lossy())
            .replace("{module}", module)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    pub static_steps: Vec<OracleStep>,
    pub test_steps: Vec<OracleStep>,
    /// Extra steps a module must pass before its interface is frozen.
    pub freeze_gates: Vec<OracleStep>,
    pub fail_fast: bool,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            static_steps: vec![OracleStep::new("syntax", "python3 -m py_compile {path}")],
            test_steps: vec![OracleStep::new("unit_test", "python3 -m pytest -q")],
            freeze_gates: Vec::new(),
            fail_fast: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub api_base: String,
    pub model: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub request_timeout_secs: u64,
    /// Retries of a failing backend call within one attempt.
    pub backend_retries: u32,
    pub backoff_base_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:8000/v1".to_string(),
            model: "Qwen/Qwen2.5-Coder-32B-Instruct".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            temperature: 0.2,
            max_tokens: 3000,
            request_timeout_secs: 180,
            backend_retries: 2,
            backoff_base_ms: 500,
        }
    }
}

impl BackendConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    /// Key from the configured variable, or a placeholder for local servers.
    pub fn api_key(&self) -> String {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
            .unwrap_or_else(|| "sk-local-placeholder".to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum attempts per task.
    pub max_retries: u32,
    pub workers: usize,
    pub generation_timeout_secs: u64,
    pub oracle_timeout_secs: u64,
    pub state_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub public_api_doc: PathBuf,
    pub backend: BackendConfig,
    pub oracle: OracleConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_retries: 3,
            workers: 4,
            generation_timeout_secs: 600,
            oracle_timeout_secs: 600,
            state_dir: PathBuf::from(".kiln"),
            workspace_root: PathBuf::from("."),
            public_api_doc: PathBuf::from("docs/PUBLIC_APIS.md"),
            backend: BackendConfig::default(),
            oracle: OracleConfig::default(),
        }
    }
}

impl Config {
    /// Load `path`, or `./kiln.toml` when no path is given.
    ///
    /// A missing default file yields the defaults; a missing explicit file
    /// is an error. Environment overrides are applied and the result is
    /// validated.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(CONFIG_FILE), false),
        };
        klog_debug!("Config::load path={}", path.display());

        let mut config = if path.exists() {
            Self::from_toml(&fs::read_to_string(&path)?)?
        } else if explicit {
            return Err(Error::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        } else {
            klog_debug!("Config file not found, using defaults");
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        klog_debug!(
            "Config loaded: max_retries={} workers={} state_dir={} model={}",
            config.max_retries,
            config.workers,
            config.state_dir.display(),
            config.backend.model
        );
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Apply `KILN_MAX_RETRIES`, `OPENAI_API_BASE` and `MODEL_NAME`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("KILN_MAX_RETRIES") {
            self.max_retries = value.trim().parse().map_err(|_| {
                Error::Config(format!("KILN_MAX_RETRIES is not a number: {}", value))
            })?;
        }
        if let Some(base) = lookup("OPENAI_API_BASE").filter(|v| !v.is_empty()) {
            self.backend.api_base = base;
        }
        if let Some(model) = lookup("MODEL_NAME").filter(|v| !v.is_empty()) {
            self.backend.model = model;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(Error::Config("max_retries must be at least 1".to_string()));
        }
        if self.workers == 0 {
            return Err(Error::Config("workers must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }

    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_secs(self.oracle_timeout_secs)
    }

    /// State directory, resolved against the workspace root.
    pub fn state_path(&self) -> PathBuf {
        self.workspace_root.join(&self.state_dir)
    }

    pub fn public_api_doc_path(&self) -> PathBuf {
        self.workspace_root.join(&self.public_api_doc)
    }

    pub fn fingerprint_path(&self) -> PathBuf {
        self.state_path().join("api_fingerprint.json")
    }
}
