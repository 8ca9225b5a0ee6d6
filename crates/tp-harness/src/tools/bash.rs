use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tp_core::types::ToolKind;
use tracing::{debug, warn};

use super::{optional_u64, required_str, Result, Tool, ToolContext, ToolError, ToolResult};

const MAX_TIMEOUT_MS: u64 = 600_000;

/// How long to keep reading pipes after the shell exits. Background
/// descendants may hold them open indefinitely.
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Runs `sh -c <command>` in the working directory.
///
/// A non-zero exit is reported in the output, not as a tool error; the model
/// decides what a failing command means. The shell runs in its own process
/// group, and the whole group is killed when the call ends for any reason.
pub struct BashTool;

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Run a shell command in the working directory and return its stdout, stderr and exit code."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "required": ["command"],
            "properties": {
                "command": {"type": "string"},
                "timeout_ms": {"type": "integer", "minimum": 1, "maximum": MAX_TIMEOUT_MS}
            }
        })
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Execute
    }

    fn title(&self, args: &Value) -> String {
        match args.get("command").and_then(Value::as_str) {
            Some(command) => format!("Run `{command}`"),
            None => "Run command".to_string(),
        }
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult> {
        let command = required_str(&args, "command")?;
        let timeout = optional_u64(&args, "timeout_ms")
            .map(|ms| Duration::from_millis(ms.clamp(1, MAX_TIMEOUT_MS)))
            .unwrap_or(ctx.bash_timeout);

        debug!(command, cwd = %ctx.cwd.display(), "running shell command");
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&ctx.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolError::Failed(format!("failed to start shell: {e}")))?;

        // Dropped on every exit path, including cancellation of this future.
        let group = child.id().map(GroupKill);
        let stdout = child.stdout.take().map(read_pipe);
        let stderr = child.stderr.take().map(read_pipe);

        let status = tokio::time::timeout(timeout, child.wait())
            .await
            .map_err(|_| ToolError::Timeout(timeout))??;
        // Background jobs left by the shell die here, which closes their
        // copies of the pipes.
        drop(group);
        let stdout = drain(stdout).await;
        let stderr = drain(stderr).await;

        let stdout = String::from_utf8_lossy(&stdout);
        let stderr = String::from_utf8_lossy(&stderr);
        let mut text = stdout.trim_end().to_string();
        if !stderr.trim().is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str("[stderr]\n");
            text.push_str(stderr.trim_end());
        }
        match status.code() {
            Some(0) => {}
            Some(code) => text.push_str(&format!("\n[exit code {code}]")),
            None => text.push_str("\n[terminated by signal]"),
        }
        if text.trim().is_empty() {
            text = "(no output)".to_string();
        }
        Ok(ToolResult::text(text))
    }
}

/// SIGKILLs the process group led by the shell when dropped.
struct GroupKill(u32);

impl Drop for GroupKill {
    fn drop(&mut self) {
        let rc = unsafe { libc::kill(-(self.0 as libc::pid_t), libc::SIGKILL) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            // ESRCH: the group is already gone.
            if err.raw_os_error() != Some(libc::ESRCH) {
                warn!(pgid = self.0, error = %err, "failed to kill shell process group");
            }
        } else {
            debug!(pgid = self.0, "killed shell process group");
        }
    }
}

fn read_pipe<R>(mut pipe: R) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Err(e) = pipe.read_to_end(&mut buf).await {
            debug!(error = %e, "shell pipe read failed");
        }
        buf
    })
}

async fn drain(reader: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    let Some(mut handle) = reader else {
        return Vec::new();
    };
    match tokio::time::timeout(PIPE_DRAIN_TIMEOUT, &mut handle).await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) => {
            debug!(error = %e, "shell pipe reader failed");
            Vec::new()
        }
        Err(_) => {
            handle.abort();
            Vec::new()
        }
    }
}
