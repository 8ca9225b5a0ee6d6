use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStdin, Command};
use tp_core::config::ProviderKind;
use tp_core::notification::{notify, ContentBlock, SessionNotification, SessionUpdate};
use tp_core::types::{StopReason, TokenUsage, ToolCallStatus, ToolKind};
use tracing::{debug, info, warn};

use crate::client::ClientHandler;
use crate::error::{ProcessError, Result};
use crate::rpc::RpcConnection;

/// Time an agent gets to exit after SIGTERM before it is killed.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(3);

/// ACP protocol version we speak.
pub const ACP_PROTOCOL_VERSION: u64 = 1;

/// What a finished prompt reports back.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptOutcome {
    pub stop_reason: StopReason,
    pub usage: Option<TokenUsage>,
}

/// One live connection to an agent provider, whatever its wire protocol.
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    /// Short label for logs (`acp`, `claude_code`, `tcp`).
    fn kind(&self) -> &'static str;

    /// OS process id, when the provider is a child of ours.
    fn pid(&self) -> Option<u32>;

    /// Create the provider-side session and return its id.
    async fn new_session(&self, cwd: &Path) -> Result<String>;

    async fn set_mode(&self, provider_session_id: &str, mode_id: &str) -> Result<()>;

    async fn prompt(&self, provider_session_id: &str, text: &str) -> Result<PromptOutcome>;

    async fn cancel(&self, provider_session_id: &str) -> Result<()>;

    /// Graceful terminate: SIGTERM, then SIGKILL after [`TERMINATE_GRACE`].
    async fn shutdown(&self);
}

/// Everything needed to bring up a provider for one caller session.
pub struct SpawnOptions {
    pub cwd: PathBuf,
    pub extra_args: Vec<String>,
    pub extra_env: HashMap<String, String>,
    pub handler: Arc<ClientHandler>,
}

/// Build and handshake the adapter for a provider kind.
pub async fn adapter_for(
    provider: &ProviderKind,
    options: SpawnOptions,
) -> Result<Box<dyn ProtocolAdapter>> {
    match provider {
        ProviderKind::Acp { command, args, env } => {
            let adapter = AcpAdapter::spawn(command, args, env, options).await?;
            Ok(Box::new(adapter))
        }
        ProviderKind::ClaudeCode { command, args, env } => {
            let adapter = ClaudeCodeAdapter::spawn(command, args, env, options).await?;
            Ok(Box::new(adapter))
        }
        ProviderKind::Tcp { address } => {
            let adapter = AcpAdapter::connect(address, options.handler).await?;
            Ok(Box::new(adapter))
        }
    }
}

// ---------------------------------------------------------------------------
// Child process plumbing
// ---------------------------------------------------------------------------

struct AgentChild {
    child: tokio::sync::Mutex<Child>,
    pid: Option<u32>,
}

impl AgentChild {
    fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        options: &SpawnOptions,
    ) -> Result<(Self, ChildStdin, tokio::process::ChildStdout)> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .args(&options.extra_args)
            .envs(env)
            .envs(&options.extra_env)
            .current_dir(&options.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| ProcessError::SpawnFailure {
            command: command.to_string(),
            reason: if e.kind() == std::io::ErrorKind::NotFound {
                "command not found; is it installed and on PATH?".to_string()
            } else {
                e.to_string()
            },
        })?;

        let missing = |pipe: &str| ProcessError::SpawnFailure {
            command: command.to_string(),
            reason: format!("no {pipe} pipe"),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        if let Some(stderr) = child.stderr.take() {
            let label = command.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(agent = %label, "stderr: {}", line);
                }
            });
        }

        let pid = child.id();
        info!(command, ?args, pid, cwd = %options.cwd.display(), "agent process spawned");
        Ok((
            Self {
                child: tokio::sync::Mutex::new(child),
                pid,
            },
            stdin,
            stdout,
        ))
    }

    async fn terminate(&self) {
        let mut child = self.child.lock().await;
        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }
        if let Some(pid) = self.pid {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
        match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
            Ok(Ok(status)) => debug!(pid = self.pid, %status, "agent process exited"),
            Ok(Err(e)) => warn!(pid = self.pid, error = %e, "waiting on agent process failed"),
            Err(_) => {
                warn!(pid = self.pid, "agent ignored SIGTERM; killing");
                if let Err(e) = child.kill().await {
                    warn!(pid = self.pid, error = %e, "kill failed");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ACP (stdio or TCP)
// ---------------------------------------------------------------------------

/// Agent Client Protocol: newline-delimited JSON-RPC, over a child's stdio or
/// a TCP stream.
pub struct AcpAdapter {
    rpc: Arc<RpcConnection>,
    child: Option<AgentChild>,
    kind: &'static str,
}

impl AcpAdapter {
    pub async fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        options: SpawnOptions,
    ) -> Result<Self> {
        let (child, stdin, stdout) = AgentChild::spawn(command, args, env, &options)?;
        let rpc = RpcConnection::start(command, stdout, stdin, options.handler);
        let adapter = Self {
            rpc,
            child: Some(child),
            kind: "acp",
        };
        if let Err(e) = adapter.initialize(command).await {
            adapter.shutdown().await;
            return Err(e);
        }
        Ok(adapter)
    }

    pub async fn connect(address: &str, handler: Arc<ClientHandler>) -> Result<Self> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| ProcessError::SpawnFailure {
                command: address.to_string(),
                reason: e.to_string(),
            })?;
        let (read, write) = stream.into_split();
        info!(address, "connected to agent");
        let rpc = RpcConnection::start(address, read, write, handler);
        let adapter = Self {
            rpc,
            child: None,
            kind: "tcp",
        };
        if let Err(e) = adapter.initialize(address).await {
            adapter.shutdown().await;
            return Err(e);
        }
        Ok(adapter)
    }

    async fn initialize(&self, label: &str) -> Result<()> {
        let params = json!({
            "protocolVersion": ACP_PROTOCOL_VERSION,
            "clientCapabilities": {
                "fs": { "readTextFile": true, "writeTextFile": true },
                "terminal": true,
            },
            "clientInfo": { "name": "troupe", "version": env!("CARGO_PKG_VERSION") },
        });
        let result = self.rpc.request("initialize", params).await.map_err(|e| match e {
            ProcessError::ProcessExitedUnexpectedly(_) => ProcessError::SpawnFailure {
                command: label.to_string(),
                reason: "exited during initialize".to_string(),
            },
            other => ProcessError::ProtocolError(format!("initialize failed: {other}")),
        })?;
        if !result.is_object() {
            return Err(ProcessError::ProtocolError(format!(
                "initialize returned {result}"
            )));
        }
        debug!(agent = label, protocol = %result["protocolVersion"], "agent initialized");
        Ok(())
    }
}

#[async_trait]
impl ProtocolAdapter for AcpAdapter {
    fn kind(&self) -> &'static str {
        self.kind
    }

    fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.pid)
    }

    async fn new_session(&self, cwd: &Path) -> Result<String> {
        let result = self
            .rpc
            .request(
                "session/new",
                json!({ "cwd": cwd.display().to_string(), "mcpServers": [] }),
            )
            .await?;
        result
            .get("sessionId")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                ProcessError::ProtocolError(format!("session/new returned no sessionId: {result}"))
            })
    }

    async fn set_mode(&self, provider_session_id: &str, mode_id: &str) -> Result<()> {
        self.rpc
            .request(
                "session/set_mode",
                json!({ "sessionId": provider_session_id, "modeId": mode_id }),
            )
            .await?;
        Ok(())
    }

    async fn prompt(&self, provider_session_id: &str, text: &str) -> Result<PromptOutcome> {
        let result = self
            .rpc
            .request(
                "session/prompt",
                json!({
                    "sessionId": provider_session_id,
                    "prompt": [ContentBlock::text(text)],
                }),
            )
            .await?;
        let stop_reason = result
            .get("stopReason")
            .and_then(Value::as_str)
            .map(StopReason::from_wire)
            .ok_or_else(|| {
                ProcessError::ProtocolError(format!("session/prompt returned no stopReason: {result}"))
            })?;
        let usage = result.get("usage").and_then(|u| {
            Some(TokenUsage {
                input_tokens: u.get("inputTokens")?.as_u64()?,
                output_tokens: u.get("outputTokens")?.as_u64()?,
            })
        });
        Ok(PromptOutcome { stop_reason, usage })
    }

    async fn cancel(&self, provider_session_id: &str) -> Result<()> {
        self.rpc
            .notify("session/cancel", json!({ "sessionId": provider_session_id }))
    }

    async fn shutdown(&self) {
        self.rpc.close();
        if let Some(child) = &self.child {
            child.terminate().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Claude Code (stream-json)
// ---------------------------------------------------------------------------

/// Claude Code in `--input-format stream-json --output-format stream-json`
/// mode. Each stdout line is one JSON message; the adapter turns them into
/// session updates and ends a prompt on the `result` message.
pub struct ClaudeCodeAdapter {
    child: AgentChild,
    stdin: tokio::sync::Mutex<ChildStdin>,
    provider_session_id: Arc<Mutex<String>>,
    turns: flume::Receiver<PromptOutcome>,
    turn_lock: tokio::sync::Mutex<()>,
    label: String,
}

impl ClaudeCodeAdapter {
    pub async fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        options: SpawnOptions,
    ) -> Result<Self> {
        let provider_session_id = uuid::Uuid::new_v4().to_string();
        let mut args = args.to_vec();
        args.push("--session-id".to_string());
        args.push(provider_session_id.clone());

        let (child, stdin, stdout) = AgentChild::spawn(command, &args, env, &options)?;
        let provider_session_id = Arc::new(Mutex::new(provider_session_id));
        let (turn_tx, turns) = flume::unbounded();

        let handler = options.handler;
        let session_ref = Arc::clone(&provider_session_id);
        let label = command.to_string();
        let reader_label = label.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim();
                if !line.starts_with('{') {
                    continue;
                }
                let message: Value = match serde_json::from_str(line) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(agent = %reader_label, error = %e, "malformed stream-json line");
                        continue;
                    }
                };
                let translated = translate_stream_message(handler.session_id(), &message);
                if let Some(id) = translated.provider_session_id {
                    *session_ref.lock().unwrap_or_else(|e| e.into_inner()) = id;
                }
                for n in translated.notifications {
                    notify(handler.sink(), n);
                }
                if let Some(outcome) = translated.turn_end {
                    let _ = turn_tx.send(outcome);
                }
            }
            debug!(agent = %reader_label, "stream-json output closed");
        });

        Ok(Self {
            child,
            stdin: tokio::sync::Mutex::new(stdin),
            provider_session_id,
            turns,
            turn_lock: tokio::sync::Mutex::new(()),
            label,
        })
    }

    async fn write_message(&self, message: Value) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        let line = format!("{message}\n");
        stdin.write_all(line.as_bytes()).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::BrokenPipe {
                ProcessError::ProcessExitedUnexpectedly(self.label.clone())
            } else {
                ProcessError::Io(e)
            }
        })?;
        stdin.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl ProtocolAdapter for ClaudeCodeAdapter {
    fn kind(&self) -> &'static str {
        "claude_code"
    }

    fn pid(&self) -> Option<u32> {
        self.child.pid
    }

    async fn new_session(&self, _cwd: &Path) -> Result<String> {
        Ok(self
            .provider_session_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }

    async fn set_mode(&self, _provider_session_id: &str, mode_id: &str) -> Result<()> {
        debug!(agent = %self.label, mode_id, "mode switching not supported; ignoring");
        Ok(())
    }

    async fn prompt(&self, _provider_session_id: &str, text: &str) -> Result<PromptOutcome> {
        let _turn = self.turn_lock.lock().await;
        // Results of a cancelled turn that arrived after we stopped waiting.
        while self.turns.try_recv().is_ok() {}

        self.write_message(json!({
            "type": "user",
            "message": {
                "role": "user",
                "content": [{ "type": "text", "text": text }],
            },
        }))
        .await?;

        self.turns
            .recv_async()
            .await
            .map_err(|_| ProcessError::ProcessExitedUnexpectedly(self.label.clone()))
    }

    async fn cancel(&self, _provider_session_id: &str) -> Result<()> {
        self.write_message(json!({
            "type": "control_request",
            "request_id": uuid::Uuid::new_v4().to_string(),
            "request": { "subtype": "interrupt" },
        }))
        .await
    }

    async fn shutdown(&self) {
        self.child.terminate().await;
    }
}

/// What one stream-json message turns into.
#[derive(Debug, Default)]
pub struct Translated {
    pub notifications: Vec<SessionNotification>,
    pub turn_end: Option<PromptOutcome>,
    pub provider_session_id: Option<String>,
}

/// Map a stream-json message to session updates addressed to `session_id`.
pub fn translate_stream_message(session_id: &str, message: &Value) -> Translated {
    let mut out = Translated::default();
    let update = |u: SessionUpdate| SessionNotification::new(session_id, u);

    match message.get("type").and_then(Value::as_str) {
        Some("system") => {
            if message.get("subtype").and_then(Value::as_str) == Some("init") {
                out.provider_session_id = message
                    .get("session_id")
                    .and_then(Value::as_str)
                    .map(str::to_string);
            }
        }
        Some("assistant") => {
            for block in content_blocks(message) {
                match block.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(text) = block.get("text").and_then(Value::as_str) {
                            out.notifications.push(update(SessionUpdate::AgentMessageChunk {
                                content: ContentBlock::text(text),
                            }));
                        }
                    }
                    Some("thinking") => {
                        if let Some(text) = block.get("thinking").and_then(Value::as_str) {
                            out.notifications.push(update(SessionUpdate::AgentThoughtChunk {
                                content: ContentBlock::text(text),
                            }));
                        }
                    }
                    Some("tool_use") => {
                        let name = block.get("name").and_then(Value::as_str).unwrap_or("tool");
                        out.notifications.push(update(SessionUpdate::ToolCall {
                            tool_call_id: block
                                .get("id")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            title: name.to_string(),
                            kind: tool_kind(name),
                            status: ToolCallStatus::Pending,
                            raw_input: block.get("input").cloned(),
                        }));
                    }
                    _ => {}
                }
            }
        }
        Some("user") => {
            for block in content_blocks(message) {
                if block.get("type").and_then(Value::as_str) != Some("tool_result") {
                    continue;
                }
                let failed = block
                    .get("is_error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                out.notifications.push(update(SessionUpdate::ToolCallUpdate {
                    tool_call_id: block
                        .get("tool_use_id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    status: if failed {
                        ToolCallStatus::Failed
                    } else {
                        ToolCallStatus::Completed
                    },
                    content: tool_result_text(block)
                        .map(ContentBlock::text)
                        .into_iter()
                        .collect(),
                }));
            }
        }
        Some("result") => {
            let subtype = message
                .get("subtype")
                .and_then(Value::as_str)
                .unwrap_or("success");
            let is_error = message
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let stop_reason = match StopReason::from_wire(subtype) {
                StopReason::EndTurn if is_error => StopReason::Error,
                other => other,
            };
            let usage = message.get("usage").map(|u| TokenUsage {
                input_tokens: u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
                output_tokens: u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0),
            });
            out.turn_end = Some(PromptOutcome { stop_reason, usage });
        }
        _ => {}
    }
    out
}

fn content_blocks(message: &Value) -> impl Iterator<Item = &Value> {
    message
        .pointer("/message/content")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

fn tool_result_text(block: &Value) -> Option<String> {
    match block.get("content")? {
        Value::String(s) => Some(s.clone()),
        Value::Array(parts) => Some(
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
        ),
        _ => None,
    }
}

fn tool_kind(name: &str) -> ToolKind {
    match name {
        "Read" | "NotebookRead" => ToolKind::Read,
        "Edit" | "MultiEdit" | "Write" | "NotebookEdit" => ToolKind::Edit,
        "Glob" | "Grep" | "LS" | "WebSearch" => ToolKind::Search,
        "Bash" => ToolKind::Execute,
        "TodoWrite" => ToolKind::Think,
        _ => ToolKind::Other,
    }
}
