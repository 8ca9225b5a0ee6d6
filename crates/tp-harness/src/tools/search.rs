use std::path::{Path, PathBuf};

use async_trait::async_trait;
use regex::RegexBuilder;
use serde_json::{json, Value};
use tp_core::paths::resolve_within;
use tp_core::types::ToolKind;
use walkdir::WalkDir;

use super::{optional_str, optional_u64, required_str, Result, Tool, ToolContext, ToolError, ToolResult};

const MAX_GLOB_RESULTS: usize = 500;
const DEFAULT_HEAD_LIMIT: usize = 200;

/// Hidden entries and build output are skipped when walking.
fn is_ignored(entry: &walkdir::DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with('.') || name == "target" || name == "node_modules")
}

// ---------------------------------------------------------------------------
// glob
// ---------------------------------------------------------------------------

pub struct GlobTool;

#[async_trait]
impl Tool for GlobTool {
    fn name(&self) -> &str {
        "glob"
    }

    fn description(&self) -> &str {
        "Find files by glob pattern, e.g. '**/*.rs' or 'src/*.toml'."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "required": ["pattern"],
            "properties": {
                "pattern": {"type": "string", "description": "Glob pattern relative to path"},
                "path": {"type": "string", "description": "Directory to search (default: working directory)"}
            }
        })
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Search
    }

    fn title(&self, args: &Value) -> String {
        format!("Glob {}", optional_str(args, "pattern").unwrap_or_default())
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult> {
        let pattern = required_str(&args, "pattern")?;
        if Path::new(pattern).is_absolute() {
            return Err(ToolError::InvalidArguments(
                "pattern must be relative to path".into(),
            ));
        }
        let base = ctx.resolve(optional_str(&args, "path").unwrap_or("."))?;
        let full = base.join(pattern).to_string_lossy().into_owned();
        let root = ctx.cwd.clone();

        let matches = tokio::task::spawn_blocking(move || -> Result<Vec<PathBuf>> {
            let paths = glob::glob(&full)
                .map_err(|e| ToolError::InvalidArguments(format!("invalid glob: {e}")))?;
            let mut out: Vec<PathBuf> = paths
                .flatten()
                .filter(|p| resolve_within(&root, p).is_some())
                .collect();
            out.sort();
            Ok(out)
        })
        .await
        .map_err(|e| ToolError::Failed(format!("glob task failed: {e}")))??;

        if matches.is_empty() {
            return Ok(ToolResult::text("no files matched"));
        }
        let total = matches.len();
        let mut lines: Vec<String> = matches
            .iter()
            .take(MAX_GLOB_RESULTS)
            .map(|p| ctx.display(p))
            .collect();
        if total > MAX_GLOB_RESULTS {
            lines.push(format!("... and {} more", total - MAX_GLOB_RESULTS));
        }
        Ok(ToolResult::text(lines.join("\n")))
    }
}

// ---------------------------------------------------------------------------
// grep
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Content,
    FilesWithMatches,
    Count,
}

impl OutputMode {
    fn parse(value: Option<&str>) -> Result<Self> {
        match value.unwrap_or("files_with_matches") {
            "content" => Ok(OutputMode::Content),
            "files_with_matches" => Ok(OutputMode::FilesWithMatches),
            "count" => Ok(OutputMode::Count),
            other => Err(ToolError::InvalidArguments(format!(
                "unknown output_mode: {other}"
            ))),
        }
    }
}

struct FileMatches {
    path: PathBuf,
    lines: Vec<(usize, String)>,
}

/// Regex search over file contents.
pub struct GrepTool;

#[async_trait]
impl Tool for GrepTool {
    fn name(&self) -> &str {
        "grep"
    }

    fn description(&self) -> &str {
        "Search file contents with a regular expression. Hidden directories and \
         build output are skipped."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "required": ["pattern"],
            "properties": {
                "pattern": {"type": "string", "description": "Regular expression"},
                "path": {"type": "string", "description": "File or directory to search (default: working directory)"},
                "glob": {"type": "string", "description": "Only search file names matching this glob, e.g. '*.rs'"},
                "case_insensitive": {"type": "boolean"},
                "output_mode": {
                    "type": "string",
                    "enum": ["content", "files_with_matches", "count"],
                    "description": "default: files_with_matches"
                },
                "head_limit": {"type": "integer", "minimum": 1, "description": "Maximum output lines"}
            }
        })
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Search
    }

    fn title(&self, args: &Value) -> String {
        format!("Grep {}", optional_str(args, "pattern").unwrap_or_default())
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult> {
        let pattern = required_str(&args, "pattern")?;
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(
                args.get("case_insensitive")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            )
            .build()
            .map_err(|e| ToolError::InvalidArguments(format!("invalid regex: {e}")))?;
        let file_filter = optional_str(&args, "glob")
            .map(glob::Pattern::new)
            .transpose()
            .map_err(|e| ToolError::InvalidArguments(format!("invalid glob: {e}")))?;
        let mode = OutputMode::parse(optional_str(&args, "output_mode"))?;
        let head_limit = optional_u64(&args, "head_limit")
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_HEAD_LIMIT);
        let root = ctx.resolve(optional_str(&args, "path").unwrap_or("."))?;
        let max_bytes = ctx.max_read_bytes as u64;

        let found = tokio::task::spawn_blocking(move || {
            let mut found = Vec::new();
            let walker = WalkDir::new(&root)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|e| !is_ignored(e));
            for entry in walker.flatten() {
                if !entry.file_type().is_file() {
                    continue;
                }
                if let Some(filter) = &file_filter {
                    if !filter.matches(&entry.file_name().to_string_lossy()) {
                        continue;
                    }
                }
                if entry.metadata().map_or(true, |m| m.len() > max_bytes) {
                    continue;
                }
                // unreadable or binary
                let Ok(text) = std::fs::read_to_string(entry.path()) else {
                    continue;
                };
                let lines: Vec<(usize, String)> = text
                    .lines()
                    .enumerate()
                    .filter(|(_, line)| regex.is_match(line))
                    .map(|(i, line)| (i + 1, line.to_string()))
                    .collect();
                if !lines.is_empty() {
                    found.push(FileMatches {
                        path: entry.into_path(),
                        lines,
                    });
                }
            }
            found
        })
        .await
        .map_err(|e| ToolError::Failed(format!("grep task failed: {e}")))?;

        if found.is_empty() {
            return Ok(ToolResult::text("no matches"));
        }
        let output: Vec<String> = match mode {
            OutputMode::FilesWithMatches => found.iter().map(|f| ctx.display(&f.path)).collect(),
            OutputMode::Count => found
                .iter()
                .map(|f| format!("{}:{}", ctx.display(&f.path), f.lines.len()))
                .collect(),
            OutputMode::Content => found
                .iter()
                .flat_map(|f| {
                    let shown = ctx.display(&f.path);
                    f.lines
                        .iter()
                        .map(move |(n, line)| format!("{shown}:{n}:{line}"))
                })
                .collect(),
        };
        let total = output.len();
        let mut lines: Vec<String> = output.into_iter().take(head_limit).collect();
        if total > head_limit {
            lines.push(format!("... and {} more", total - head_limit));
        }
        Ok(ToolResult::text(lines.join("\n")))
    }
}
