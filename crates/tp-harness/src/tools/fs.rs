use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tp_core::types::ToolKind;

use super::{optional_str, optional_u64, required_str, Result, Tool, ToolContext, ToolError, ToolResult};

fn path_title(verb: &str, args: &Value) -> String {
    match optional_str(args, "path") {
        Some(path) => format!("{verb} {path}"),
        None => verb.to_string(),
    }
}

fn numbered(first_line: usize, lines: &[String]) -> String {
    lines
        .iter()
        .enumerate()
        .map(|(i, line)| format!("{:>6}\t{line}", first_line + i))
        .collect::<Vec<_>>()
        .join("\n")
}

// ---------------------------------------------------------------------------
// read_file
// ---------------------------------------------------------------------------

/// Reads a UTF-8 file with line numbers. Files over the size cap are only
/// readable in windows (`offset`/`limit`).
pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file from the working directory. Lines are numbered from 1. \
         Use offset and limit to page through large files."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "required": ["path"],
            "properties": {
                "path": {"type": "string", "description": "File path, relative to the working directory"},
                "offset": {"type": "integer", "minimum": 1, "description": "First line to read (1-based)"},
                "limit": {"type": "integer", "minimum": 1, "description": "Maximum number of lines"}
            }
        })
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Read
    }

    fn title(&self, args: &Value) -> String {
        path_title("Read", args)
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult> {
        let requested = required_str(&args, "path")?;
        let path = ctx.resolve(requested)?;
        let offset = optional_u64(&args, "offset").unwrap_or(1).max(1) as usize;
        let limit = optional_u64(&args, "limit").map(|l| l as usize);

        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| ToolError::Failed(format!("cannot read {requested}: {e}")))?;
        if meta.is_dir() {
            return Err(ToolError::Failed(format!(
                "{requested} is a directory; use list_directory"
            )));
        }
        if limit.is_none() && meta.len() > ctx.max_read_bytes as u64 {
            return Err(ToolError::Failed(format!(
                "{requested} is {} bytes, over the {} byte read limit; pass offset and limit",
                meta.len(),
                ctx.max_read_bytes
            )));
        }

        let file = tokio::fs::File::open(&path).await?;
        let mut reader = BufReader::new(file);
        let mut raw = Vec::new();
        let mut window = Vec::new();
        let mut number = 0usize;
        let mut bytes = 0usize;
        loop {
            let (consumed, overflow) =
                next_line_capped(&mut reader, &mut raw, ctx.max_read_bytes).await?;
            if consumed == 0 {
                break;
            }
            number += 1;
            if number < offset {
                continue;
            }
            if limit.is_some_and(|l| window.len() >= l) {
                break;
            }
            if overflow {
                if window.is_empty() {
                    return Err(ToolError::Failed(format!(
                        "line {number} of {requested} is over the {} byte read limit",
                        ctx.max_read_bytes
                    )));
                }
                break;
            }
            let line = String::from_utf8(std::mem::take(&mut raw))
                .map_err(|_| ToolError::Failed(format!("{requested} is not valid UTF-8 text")))?;
            bytes += line.len() + 1;
            if bytes > ctx.max_read_bytes {
                break;
            }
            window.push(line);
        }

        if window.is_empty() {
            return Ok(ToolResult::text(if number == 0 {
                format!("{requested} is empty")
            } else {
                format!("{requested} has {number} lines; nothing at offset {offset}")
            }));
        }
        Ok(ToolResult::text(numbered(offset, &window)))
    }
}

/// Read one line into `buf` without its terminator, keeping at most `cap`
/// bytes. Returns the bytes consumed (0 at end of file) and whether the line
/// was cut short.
async fn next_line_capped<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    cap: usize,
) -> std::io::Result<(usize, bool)>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let mut consumed = 0;
    let mut overflow = false;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            break;
        }
        let (take, used, done) = match available.iter().position(|&b| b == b'\n') {
            Some(i) => (i, i + 1, true),
            None => (available.len(), available.len(), false),
        };
        let room = cap.saturating_sub(buf.len());
        if take > room {
            overflow = true;
        }
        buf.extend_from_slice(&available[..take.min(room)]);
        reader.consume(used);
        consumed += used;
        if done {
            break;
        }
    }
    if !overflow && buf.last() == Some(&b'\r') {
        buf.pop();
    }
    Ok((consumed, overflow))
}

// ---------------------------------------------------------------------------
// write_file
// ---------------------------------------------------------------------------

pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Create or overwrite a file in the working directory. Parent directories are created."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "required": ["path", "content"],
            "properties": {
                "path": {"type": "string", "description": "File path, relative to the working directory"},
                "content": {"type": "string", "description": "Full new file contents"}
            }
        })
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Edit
    }

    fn title(&self, args: &Value) -> String {
        path_title("Write", args)
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult> {
        let requested = required_str(&args, "path")?;
        let content = required_str(&args, "content")?;
        let path = ctx.resolve(requested)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;
        Ok(ToolResult::text(format!(
            "wrote {} bytes to {}",
            content.len(),
            ctx.display(&path)
        )))
    }
}

// ---------------------------------------------------------------------------
// edit_file
// ---------------------------------------------------------------------------

/// Exact string replacement. `old_string` must match exactly once unless
/// `replace_all` is set.
pub struct EditFileTool;

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Replace an exact string in a file. old_string must occur exactly once; \
         include more surrounding context or set replace_all otherwise."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "required": ["path", "old_string", "new_string"],
            "properties": {
                "path": {"type": "string"},
                "old_string": {"type": "string", "description": "Exact text to replace"},
                "new_string": {"type": "string", "description": "Replacement text"},
                "replace_all": {"type": "boolean", "description": "Replace every occurrence (default false)"}
            }
        })
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Edit
    }

    fn title(&self, args: &Value) -> String {
        path_title("Edit", args)
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult> {
        let requested = required_str(&args, "path")?;
        let old = required_str(&args, "old_string")?;
        let new = required_str(&args, "new_string")?;
        let replace_all = args
            .get("replace_all")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        if old.is_empty() {
            return Err(ToolError::InvalidArguments(
                "old_string must not be empty".into(),
            ));
        }
        if old == new {
            return Err(ToolError::InvalidArguments(
                "old_string and new_string must differ".into(),
            ));
        }

        let path = ctx.resolve(requested)?;
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ToolError::Failed(format!("cannot read {requested}: {e}")))?;

        let count = content.matches(old).count();
        let updated = match (count, replace_all) {
            (0, _) => {
                return Err(ToolError::Failed(format!(
                    "old_string not found in {requested}"
                )))
            }
            (1, _) => content.replacen(old, new, 1),
            (_, true) => content.replace(old, new),
            (n, false) => {
                return Err(ToolError::Failed(format!(
                    "old_string occurs {n} times in {requested}; add context or set replace_all"
                )))
            }
        };
        tokio::fs::write(&path, updated).await?;
        Ok(ToolResult::text(format!(
            "replaced {count} occurrence(s) in {}",
            ctx.display(&path)
        )))
    }
}

// ---------------------------------------------------------------------------
// list_directory
// ---------------------------------------------------------------------------

pub struct ListDirectoryTool;

#[async_trait]
impl Tool for ListDirectoryTool {
    fn name(&self) -> &str {
        "list_directory"
    }

    fn description(&self) -> &str {
        "List the entries of a directory. Directories end with '/'."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Directory, relative to the working directory (default '.')"}
            }
        })
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Search
    }

    fn title(&self, args: &Value) -> String {
        path_title("List", args)
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult> {
        let requested = optional_str(&args, "path").unwrap_or(".");
        let path = ctx.resolve(requested)?;
        let mut dir = tokio::fs::read_dir(&path)
            .await
            .map_err(|e| ToolError::Failed(format!("cannot list {requested}: {e}")))?;

        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().await.is_ok_and(|t| t.is_dir()) {
                name.push('/');
            }
            entries.push(name);
        }
        entries.sort();
        if entries.is_empty() {
            return Ok(ToolResult::text(format!("{requested} is empty")));
        }
        Ok(ToolResult::text(entries.join("\n")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tp_core::config::AgentLoopConfig;

    fn ctx(dir: &std::path::Path) -> ToolContext {
        ToolContext::new(dir, &AgentLoopConfig::default())
    }

    #[tokio::test]
    async fn read_numbers_lines_and_pages() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "one\ntwo\nthree\nfour\n").unwrap();

        let all = ReadFileTool
            .execute(json!({"path": "a.txt"}), &ctx(dir.path()))
            .await
            .unwrap();
        assert!(all.content.contains("     1\tone"));
        assert!(all.content.contains("     4\tfour"));

        let page = ReadFileTool
            .execute(json!({"path": "a.txt", "offset": 2, "limit": 2}), &ctx(dir.path()))
            .await
            .unwrap();
        assert_eq!(page.content, "     2\ttwo\n     3\tthree");
    }

    #[tokio::test]
    async fn read_refuses_oversized_file_without_window() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big.txt"), "line\n".repeat(100)).unwrap();
        let mut ctx = ctx(dir.path());
        ctx.max_read_bytes = 64;

        let err = ReadFileTool
            .execute(json!({"path": "big.txt"}), &ctx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("read limit"));

        let window = ReadFileTool
            .execute(json!({"path": "big.txt", "limit": 3}), &ctx)
            .await
            .unwrap();
        assert_eq!(window.content.lines().count(), 3);
    }

    #[tokio::test]
    async fn read_window_refuses_a_line_over_the_cap() {
        let dir = tempfile::tempdir().unwrap();
        let mut body = "short\n".to_string();
        body.push_str(&"x".repeat(10_000));
        body.push_str("\ntail\n");
        std::fs::write(dir.path().join("wide.txt"), body).unwrap();
        let mut ctx = ctx(dir.path());
        ctx.max_read_bytes = 64;

        let err = ReadFileTool
            .execute(json!({"path": "wide.txt", "offset": 2, "limit": 1}), &ctx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("line 2"));

        // Lines before the wide one are still readable, and it stops the window.
        let head = ReadFileTool
            .execute(json!({"path": "wide.txt", "limit": 5}), &ctx)
            .await
            .unwrap();
        assert_eq!(head.content, "     1\tshort");

        // Lines after it are reachable by offset.
        let tail = ReadFileTool
            .execute(json!({"path": "wide.txt", "offset": 3, "limit": 1}), &ctx)
            .await
            .unwrap();
        assert_eq!(tail.content, "     3\ttail");
    }

    #[tokio::test]
    async fn capped_reader_strips_crlf() {
        let mut reader = BufReader::new(&b"a\r\nbc"[..]);
        let mut buf = Vec::new();
        assert_eq!(next_line_capped(&mut reader, &mut buf, 10).await.unwrap(), (3, false));
        assert_eq!(buf, b"a");
        assert_eq!(next_line_capped(&mut reader, &mut buf, 1).await.unwrap(), (2, true));
        assert_eq!(buf, b"b");
        assert_eq!(next_line_capped(&mut reader, &mut buf, 10).await.unwrap().0, 0);
    }

    #[tokio::test]
    async fn read_rejects_paths_outside_root() {
        let dir = tempfile::tempdir().unwrap();
        let err = ReadFileTool
            .execute(json!({"path": "../../etc/passwd"}), &ctx(dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::PathEscape(_)));
    }

    #[tokio::test]
    async fn write_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let result = WriteFileTool
            .execute(
                json!({"path": "deep/nested/file.txt", "content": "hi"}),
                &ctx(dir.path()),
            )
            .await
            .unwrap();
        assert!(result.content.contains("wrote 2 bytes"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("deep/nested/file.txt")).unwrap(),
            "hi"
        );
    }

    #[tokio::test]
    async fn edit_requires_a_unique_match() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f.rs");
        std::fs::write(&file, "let a = 1;\nlet b = 1;\n").unwrap();
        let ctx = ctx(dir.path());

        let err = EditFileTool
            .execute(
                json!({"path": "f.rs", "old_string": "= 1", "new_string": "= 2"}),
                &ctx,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("occurs 2 times"));

        EditFileTool
            .execute(
                json!({"path": "f.rs", "old_string": "let a = 1", "new_string": "let a = 2"}),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(&file).unwrap(),
            "let a = 2;\nlet b = 1;\n"
        );

        EditFileTool
            .execute(
                json!({"path": "f.rs", "old_string": "let", "new_string": "const", "replace_all": true}),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(&file).unwrap(),
            "const a = 2;\nconst b = 1;\n"
        );

        let missing = EditFileTool
            .execute(
                json!({"path": "f.rs", "old_string": "nothing", "new_string": "x"}),
                &ctx,
            )
            .await
            .unwrap_err();
        assert!(missing.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn list_directory_marks_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "").unwrap();
        let out = ListDirectoryTool
            .execute(json!({}), &ctx(dir.path()))
            .await
            .unwrap();
        assert_eq!(out.content, "Cargo.toml\nsrc/");
    }
}
