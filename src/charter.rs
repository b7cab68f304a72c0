//! Charter: the declarative project description kiln builds from.
//!
//! A Charter lists the modules of a project, the public interface each one
//! must expose, which other modules it uses, and the test obligations it
//! carries. It is consumed read-only by the planner and the oracle.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::freeze::CompatibilityRule;
use crate::{klog_debug, Error, Result};

/// Source language of generated modules.
///
/// Selects how the fingerprinter discovers a module's public surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    #[default]
    Python,
    Rust,
}

impl Language {
    /// File extension of source files, without the dot.
    pub fn extension(&self) -> &'static str {
        match self {
            Language::Python => "py",
            Language::Rust => "rs",
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Language::Python => write!(f, "python"),
            Language::Rust => write!(f, "rust"),
        }
    }
}

/// One module declared by the Charter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSpec {
    pub name: String,
    /// File the module's source lives in, relative to the workspace root.
    pub path: PathBuf,
    #[serde(default)]
    pub description: String,
    /// Declared public interface, one signature per entry.
    ///
    /// Modules with an empty interface are implemented but never frozen.
    #[serde(default)]
    pub interface: Vec<String>,
    /// Names of modules whose interfaces this module consumes.
    #[serde(default)]
    pub uses: Vec<String>,
    /// Test obligations (e.g. "unit", "property").
    #[serde(default)]
    pub tests: Vec<String>,
}

impl ModuleSpec {
    pub fn new(name: &str, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            path: path.into(),
            description: String::new(),
            interface: Vec::new(),
            uses: Vec::new(),
            tests: Vec::new(),
        }
    }

    pub fn with_interface<I, S>(mut self, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interface = items.into_iter().map(Into::into).collect();
        self
    }

    pub fn using<I, S>(mut self, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.uses = modules.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// Whether this module gets a freeze task.
    pub fn has_interface(&self) -> bool {
        !self.interface.is_empty()
    }
}

/// The full project description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Charter {
    pub name: String,
    #[serde(default)]
    pub language: Language,
    /// Rule deciding whether a re-freeze is an update or drift.
    ///
    /// Required: there is no implied default.
    pub compatibility: CompatibilityRule,
    #[serde(default)]
    pub modules: Vec<ModuleSpec>,
}

impl Charter {
    pub fn new(name: &str, compatibility: CompatibilityRule) -> Self {
        Self {
            name: name.to_string(),
            language: Language::default(),
            compatibility,
            modules: Vec::new(),
        }
    }

    pub fn with_language(mut self, language: Language) -> Self {
        self.language = language;
        self
    }

    pub fn with_module(mut self, module: ModuleSpec) -> Self {
        self.modules.push(module);
        self
    }

    pub fn module(&self, name: &str) -> Option<&ModuleSpec> {
        self.modules.iter().find(|m| m.name == name)
    }

    /// Load a Charter from YAML (`.yaml`/`.yml`) or TOML (anything else).
    pub fn load(path: &Path) -> Result<Self> {
        klog_debug!("Charter::load path={}", path.display());
        if !path.exists() {
            return Err(Error::Charter(format!(
                "charter not found: {}",
                path.display()
            )));
        }
        let text = fs::read_to_string(path)?;
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        let charter = if is_yaml {
            Self::from_yaml(&text)?
        } else {
            Self::from_toml(&text)?
        };
        charter.validate()?;
        klog_debug!(
            "Charter loaded: name={} modules={} compatibility={}",
            charter.name,
            charter.modules.len(),
            charter.compatibility
        );
        Ok(charter)
    }

    /// Every module path must stay inside the workspace: relative, non-empty,
    /// and free of `..`.
    pub fn validate(&self) -> Result<()> {
        for module in &self.modules {
            let path = &module.path;
            let escapes = path.components().any(|c| {
                matches!(
                    c,
                    Component::ParentDir | Component::RootDir | Component::Prefix(_)
                )
            });
            if path.as_os_str().is_empty() || escapes {
                return Err(Error::Charter(format!(
                    "module {}: path {} must be relative to the workspace",
                    module.name,
                    path.display()
                )));
            }
        }
        Ok(())
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}
