//! Generated artifacts and the project workspace they are committed to.

use std::fs;
use std::path::{Path, PathBuf};

use crate::charter::Language;
use crate::core::ArtifactRef;
use crate::fingerprint::sha256_hex;
use crate::util::{blocking, write_atomic};
use crate::{klog_debug, Result};

/// Candidate (or committed) source for one module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub module: String,
    /// Relative to the workspace root.
    pub path: PathBuf,
    pub content: String,
}

impl Artifact {
    pub fn new(module: &str, path: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        Self {
            module: module.to_string(),
            path: path.into(),
            content: content.into(),
        }
    }

    pub fn digest(&self) -> String {
        sha256_hex(self.content.as_bytes())
    }

    pub fn to_ref(&self) -> ArtifactRef {
        ArtifactRef {
            path: self.path.clone(),
            digest: self.digest(),
        }
    }
}

/// Build and tooling directories that are never part of the project.
pub const SKIP_DIRS: &[&str] = &[".git", "target", "node_modules", "__pycache__", ".venv"];

/// The directory generated modules are written into.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, relative: &Path) -> PathBuf {
        self.root.join(relative)
    }

    /// Replace the module's file with the artifact content atomically.
    pub async fn commit(&self, artifact: &Artifact) -> Result<ArtifactRef> {
        let target = self.resolve(&artifact.path);
        let content = artifact.content.clone();
        klog_debug!(
            "Workspace::commit module={} path={}",
            artifact.module,
            target.display()
        );
        blocking(move || write_atomic(&target, content.as_bytes())).await?;
        Ok(artifact.to_ref())
    }

    /// The committed artifact of a module, if its file exists.
    pub async fn load(&self, module: &str, relative: &Path) -> Result<Option<Artifact>> {
        let target = self.resolve(relative);
        let content = blocking(move || {
            if !target.exists() {
                return Ok(None);
            }
            Ok(Some(std::fs::read_to_string(&target)?))
        })
        .await?;
        Ok(content.map(|c| Artifact::new(module, relative, c)))
    }

    /// Source files of `language` under the root, relative and sorted.
    /// Hidden directories are skipped.
    pub async fn source_files(&self, language: Language) -> Result<Vec<PathBuf>> {
        let root = self.root.clone();
        blocking(move || {
            let mut files = Vec::new();
            collect_sources(&root, &root, language.extension(), &mut files)?;
            files.sort();
            Ok(files)
        })
        .await
    }
}

fn collect_sources(root: &Path, dir: &Path, extension: &str, files: &mut Vec<PathBuf>) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            if name.starts_with('.') || SKIP_DIRS.contains(&name.as_ref()) {
                continue;
            }
            collect_sources(root, &path, extension, files)?;
        } else if file_type.is_file() && path.extension().is_some_and(|e| e == extension) {
            if let Ok(relative) = path.strip_prefix(root) {
                files.push(relative.to_path_buf());
            }
        }
    }
    Ok(())
}
