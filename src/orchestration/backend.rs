//! Code-generation backend.
//!
//! The orchestrator only sees [`CodeGenerator`]. Backend failures are
//! reported as [`GenerationError`], never as a failed validation.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::charter::{Language, ModuleSpec};
use crate::config::BackendConfig;
use crate::core::{FailureTrace, TaskId};
use crate::error::GenerationError;
use crate::freeze::FreezeRecord;
use crate::workspace::Artifact;
use crate::util::{append_line, blocking};
use crate::{klog_debug, klog_warn};

/// Frozen interface of a dependency, as shown to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrozenInterface {
    pub module: String,
    pub version: u32,
    pub digest: String,
    pub signatures: Vec<String>,
}

impl From<&FreezeRecord> for FrozenInterface {
    fn from(record: &FreezeRecord) -> Self {
        Self {
            module: record.module.clone(),
            version: record.version,
            digest: record.fingerprint.digest.clone(),
            signatures: record.fingerprint.signatures.iter().cloned().collect(),
        }
    }
}

/// Everything the backend gets to produce one candidate.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub task: TaskId,
    pub module: ModuleSpec,
    pub language: Language,
    /// 1-based ordinal of the attempt being made.
    pub attempt: u32,
    pub dependency_interfaces: Vec<FrozenInterface>,
    /// Failure traces of earlier attempts, oldest first.
    pub prior_failures: Vec<FailureTrace>,
    /// Source files already in the workspace, relative to its root.
    pub workspace_files: Vec<PathBuf>,
}

#[async_trait]
pub trait CodeGenerator: Send + Sync {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> std::result::Result<Artifact, GenerationError>;

    /// Get the model name for logging
    fn model_name(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    fn new(role: &str, content: String) -> Self {
        Self {
            role: role.to_string(),
            content,
        }
    }
}

fn fence(language: Language) -> (&'static str, &'static str) {
    match language {
        Language::Python => ("python", "#"),
        Language::Rust => ("rust", "//"),
    }
}

/// System and user messages for one generation request.
pub fn render_prompt(request: &GenerationRequest) -> Vec<ChatMessage> {
    let module = &request.module;
    let path = module.path.display();
    let (lang, comment) = fence(request.language);

    let system = ChatMessage::new(
        "system",
        "You are a contract-first software engineer. Obey the Charter strictly. \
         Prefer minimal, type-safe, testable code. Modify ONLY the target module."
            .to_string(),
    );

    let mut user = format!("Task: implement the module `{}` ({}).\n", module.name, path);
    if !module.description.is_empty() {
        user.push_str(&format!("\nDescription:\n{}\n", module.description));
    }
    if !module.interface.is_empty() {
        user.push_str("\nRequired public interface:\n");
        for signature in &module.interface {
            user.push_str(&format!("- {}\n", signature));
        }
    }
    if !module.tests.is_empty() {
        user.push_str(&format!(
            "\nTest obligations: {}\n",
            module.tests.join(", ")
        ));
    }
    if !request.workspace_files.is_empty() {
        user.push_str("\nFiles present:\n");
        for file in &request.workspace_files {
            user.push_str(&format!("- {}\n", file.display()));
        }
    }
    if !request.dependency_interfaces.is_empty() {
        user.push_str("\nFrozen interfaces you may use (do not assume anything else):\n");
        for dep in &request.dependency_interfaces {
            user.push_str(&format!("\n## {} (v{})\n", dep.module, dep.version));
            for signature in &dep.signatures {
                user.push_str(&format!("- {}\n", signature));
            }
        }
    }
    for (i, failure) in request.prior_failures.iter().enumerate() {
        user.push_str(&format!(
            "\nPrevious attempt failed ({} of {}). Here is the failure trace:\n```\n{}\n```\n",
            i + 1,
            request.prior_failures.len(),
            failure.render()
        ));
    }
    if !request.prior_failures.is_empty() {
        user.push_str("Fix the root cause.\n");
    }
    user.push_str(&format!(
        "\nOutput requirements:\n\
         1) Provide the full file content for `{path}` only.\n\
         2) No commentary before or after the code block.\n\
         \nReturn exactly:\n```{lang}\n{comment} {path}\n<file content>\n```\n"
    ));

    vec![system, ChatMessage::new("user", user)]
}

/// File content from a fenced block headed by `module_path`.
pub fn extract_code_block(language: Language, module_path: &str, reply: &str) -> Option<String> {
    let (lang, comment) = fence(language);
    let pattern = format!(
        r"(?s)```{}\s*{}\s*{}[ \t]*\n(.*?)```",
        lang,
        regex::escape(comment),
        regex::escape(module_path)
    );
    let re = Regex::new(&pattern).ok()?;
    let body = re.captures(reply)?.get(1)?.as_str().trim_start_matches('\n');
    if body.trim().is_empty() {
        return None;
    }
    let mut content = body.to_string();
    if !content.ends_with('\n') {
        content.push('\n');
    }
    Some(content)
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// Client for OpenAI-compatible chat completion servers (vLLM, gateways).
pub struct OpenAiCompatible {
    config: BackendConfig,
    api_key: String,
    client: reqwest::Client,
    reply_dir: Option<PathBuf>,
}

impl OpenAiCompatible {
    pub fn new(config: BackendConfig) -> crate::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        let api_key = config.api_key();
        Ok(Self {
            config,
            api_key,
            client,
            reply_dir: None,
        })
    }

    /// Keep every raw reply under `dir`, one file per task attempt.
    pub fn with_reply_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.reply_dir = Some(dir.into());
        self
    }

    /// `<kind>.<module>.<attempt>.md`; replies to retried calls within one
    /// attempt are appended.
    pub fn reply_path(dir: &Path, request: &GenerationRequest) -> PathBuf {
        dir.join(format!(
            "{}.{}.{}.md",
            request.task.kind, request.task.module, request.attempt
        ))
    }

    async fn save_reply(&self, request: &GenerationRequest, content: &str) {
        let Some(dir) = self.reply_dir.as_deref() else {
            return;
        };
        let path = Self::reply_path(dir, request);
        let entry = format!(
            "<!-- {} model={} -->\n{}",
            chrono::Utc::now().to_rfc3339(),
            self.config.model,
            content
        );
        let target = path.clone();
        if let Err(e) = blocking(move || append_line(&target, &entry)).await {
            klog_warn!("could not save reply to {}: {}", path.display(), e);
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.api_base.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl CodeGenerator for OpenAiCompatible {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> std::result::Result<Artifact, GenerationError> {
        let body = serde_json::json!({
            "model": self.config.model,
            "messages": render_prompt(request),
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
        });
        klog_debug!(
            "backend request task={} attempt={} model={}",
            request.task,
            request.attempt,
            self.config.model
        );

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerationError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let payload: ChatResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::Malformed(e.to_string()))?;
        let content = payload
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| GenerationError::Malformed("response has no message content".into()))?;
        self.save_reply(request, &content).await;
        if crate::log::is_debug() {
            klog_debug!("backend response for {}:\n{}", request.task, content);
        }

        let path = request.module.path.to_string_lossy();
        let code = extract_code_block(request.language, &path, &content).ok_or_else(|| {
            GenerationError::Malformed(format!("no code block headed by {}", path))
        })?;

        Ok(Artifact::new(&request.module.name, &request.module.path, code))
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}
