//! Tools the native agent loop can hand to a model.
//!
//! Every tool implements [`Tool`]; a [`ToolRegistry`] owns a set of them,
//! exposes their [`ToolDefinition`]s, and runs calls. Failures never escape
//! the registry: they come back as a [`ToolResult`] with `is_error` set so
//! the model can see what went wrong and try again.

pub mod bash;
pub mod fs;
pub mod search;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tp_core::config::AgentLoopConfig;
use tp_core::paths::resolve_within;
use tp_core::types::ToolKind;
use tracing::debug;

use crate::provider::ToolDefinition;

// ---------------------------------------------------------------------------
// Error / result
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("path is outside the working directory: {0}")]
    PathEscape(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ToolError>;

/// What the model sees after a tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    pub content: String,
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

impl ToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: text.into(),
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: message.into(),
            is_error: true,
        }
    }
}

// ---------------------------------------------------------------------------
// ToolContext
// ---------------------------------------------------------------------------

/// Per-session execution settings shared by all tools.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Working root; every path argument must resolve inside it.
    pub cwd: PathBuf,
    pub max_read_bytes: usize,
    pub max_output_chars: usize,
    pub bash_timeout: Duration,
}

impl ToolContext {
    pub fn new(cwd: impl Into<PathBuf>, config: &AgentLoopConfig) -> Self {
        Self {
            cwd: cwd.into(),
            max_read_bytes: config.max_read_bytes,
            max_output_chars: config.max_tool_output_chars,
            bash_timeout: Duration::from_secs(config.bash_timeout_secs),
        }
    }

    /// Resolve a path argument against the working root.
    pub fn resolve(&self, requested: &str) -> Result<PathBuf> {
        resolve_within(&self.cwd, requested)
            .ok_or_else(|| ToolError::PathEscape(requested.to_string()))
    }

    /// Path relative to the working root for display, absolute otherwise.
    pub fn display(&self, path: &Path) -> String {
        path.strip_prefix(&self.cwd)
            .unwrap_or(path)
            .display()
            .to_string()
    }
}

// ---------------------------------------------------------------------------
// Tool trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema of the arguments object.
    fn parameters(&self) -> Value;

    fn kind(&self) -> ToolKind {
        ToolKind::Other
    }

    /// Short human-readable label for a call, shown in `tool_call` updates.
    fn title(&self, _args: &Value) -> String {
        self.name().to_string()
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult>;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }
}

/// Required string argument.
pub fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::InvalidArguments(format!("missing required parameter: {key}")))
}

pub fn optional_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

pub fn optional_u64(args: &Value, key: &str) -> Option<u64> {
    args.get(key).and_then(Value::as_u64)
}

/// Cut `text` to at most `max_chars` characters, saying how much was dropped.
pub fn truncate_output(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        None => text.to_string(),
        Some((cut, _)) => {
            let dropped = text[cut..].chars().count();
            format!(
                "{}\n... [output truncated: {dropped} more characters]",
                &text[..cut]
            )
        }
    }
}

// ---------------------------------------------------------------------------
// ToolRegistry
// ---------------------------------------------------------------------------

/// Ordered set of tools, unique by name.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool, replacing any existing tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.retain(|t| t.name() != tool.name());
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition()).collect()
    }

    pub fn kind_of(&self, name: &str) -> ToolKind {
        self.get(name).map_or(ToolKind::Other, |t| t.kind())
    }

    pub fn title_of(&self, name: &str, args: &Value) -> String {
        self.get(name)
            .map_or_else(|| name.to_string(), |t| t.title(args))
    }

    /// Run a call. Errors are folded into the result and output is
    /// truncated to the context's limit.
    pub async fn execute(&self, name: &str, args: Value, ctx: &ToolContext) -> ToolResult {
        let outcome = match self.get(name) {
            Some(tool) => tool.execute(args, ctx).await,
            None => Err(ToolError::UnknownTool(name.to_string())),
        };
        let mut result = match outcome {
            Ok(result) => result,
            Err(e) => {
                debug!(tool = name, error = %e, "tool call failed");
                ToolResult::error(e.to_string())
            }
        };
        result.content = truncate_output(&result.content, ctx.max_output_chars);
        result
    }
}

/// The coding tool set: files, search, shell.
pub fn coding_tools() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(fs::ReadFileTool));
    registry.register(Arc::new(fs::WriteFileTool));
    registry.register(Arc::new(fs::EditFileTool));
    registry.register(Arc::new(fs::ListDirectoryTool));
    registry.register(Arc::new(search::GlobTool));
    registry.register(Arc::new(search::GrepTool));
    registry.register(Arc::new(bash::BashTool));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(dir: &Path) -> ToolContext {
        ToolContext::new(dir, &AgentLoopConfig::default())
    }

    #[test]
    fn coding_tools_are_all_registered() {
        let registry = coding_tools();
        assert_eq!(
            registry.names(),
            vec![
                "read_file",
                "write_file",
                "edit_file",
                "list_directory",
                "glob",
                "grep",
                "bash"
            ]
        );
        for def in registry.definitions() {
            assert_eq!(def.parameters["type"], "object", "{}", def.name);
            assert!(!def.description.is_empty());
        }
        assert_eq!(registry.kind_of("bash"), ToolKind::Execute);
        assert_eq!(registry.kind_of("nope"), ToolKind::Other);
    }

    #[test]
    fn register_replaces_same_name() {
        let mut registry = coding_tools();
        let before = registry.len();
        registry.register(Arc::new(bash::BashTool));
        assert_eq!(registry.len(), before);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_output("short", 10), "short");
        let out = truncate_output("ééééé", 2);
        assert!(out.starts_with("éé\n"));
        assert!(out.contains("3 more characters"));
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_result() {
        let dir = tempfile::tempdir().unwrap();
        let result = coding_tools()
            .execute("teleport", json!({}), &ctx(dir.path()))
            .await;
        assert!(result.is_error);
        assert!(result.content.contains("unknown tool"));
    }

    #[tokio::test]
    async fn output_is_truncated_by_registry() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big.txt"), "x".repeat(500)).unwrap();
        let mut ctx = ctx(dir.path());
        ctx.max_output_chars = 50;
        let result = coding_tools()
            .execute("read_file", json!({"path": "big.txt"}), &ctx)
            .await;
        assert!(!result.is_error);
        assert!(result.content.contains("[output truncated"));
    }

    #[test]
    fn resolve_rejects_escapes() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        assert!(ctx.resolve("src/main.rs").is_ok());
        assert!(matches!(
            ctx.resolve("../outside"),
            Err(ToolError::PathEscape(_))
        ));
    }
}
