use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::watch;
use tp_core::config::TerminalConfig;
use tp_core::notification::{notify, NotificationSink, SessionNotification, SessionUpdate};
use tracing::{debug, info, warn};

/// Exit code reported for a process that was terminated by a signal.
pub const SIGNAL_EXIT_CODE: i32 = 128;
/// Exit code reported when the command could not be started.
pub const SPAWN_ERROR_EXIT_CODE: i32 = 1;
/// Exit code reported for terminals that are unknown or already released.
pub const UNKNOWN_EXIT_CODE: i32 = -1;

const READ_CHUNK: usize = 8 * 1024;

/// After the process exits, how long to wait for output already in flight.
const EXIT_DRAIN: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("terminal not found: {0}")]
    NotFound(String),

    #[error("terminal signal failed: {0}")]
    Signal(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TerminalError>;

// ---------------------------------------------------------------------------
// Parameters and results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVariable {
    pub name: String,
    pub value: String,
}

/// Arguments of `terminal/create`.
///
/// With no `args`, `command` is handed to `sh -c` so callers can pass a full
/// shell line.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalCreateParams {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: Vec<EnvVariable>,
    #[serde(default)]
    pub output_byte_limit: Option<usize>,
}

impl TerminalCreateParams {
    pub fn shell(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    fn display_command(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalOutput {
    pub output: String,
    pub truncated: bool,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalInfo {
    pub terminal_id: String,
    pub session_id: String,
    pub command: String,
    pub exit_code: Option<i32>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// ManagedTerminal
// ---------------------------------------------------------------------------

struct OutputBuffer {
    text: String,
    limit: Option<usize>,
    truncated: bool,
}

impl OutputBuffer {
    fn new(limit: Option<usize>) -> Self {
        Self {
            text: String::new(),
            limit,
            truncated: false,
        }
    }

    fn push(&mut self, chunk: &str) {
        self.text.push_str(chunk);
        if let Some(limit) = self.limit {
            if self.text.len() > limit {
                let mut cut = self.text.len() - limit;
                while !self.text.is_char_boundary(cut) {
                    cut += 1;
                }
                self.text.drain(..cut);
                self.truncated = true;
            }
        }
    }
}

struct ManagedTerminal {
    id: String,
    session_id: String,
    command: String,
    created_at: DateTime<Utc>,
    pid: Option<u32>,
    output: Mutex<OutputBuffer>,
    exit: watch::Receiver<Option<i32>>,
}

impl ManagedTerminal {
    fn exit_code(&self) -> Option<i32> {
        *self.exit.borrow()
    }

    fn append(&self, chunk: &str) {
        self.output
            .lock()
            .unwrap_or_else(|e| {
                warn!("terminal output lock was poisoned, recovering");
                e.into_inner()
            })
            .push(chunk);
    }

    fn snapshot(&self) -> TerminalOutput {
        let buffer = self.output.lock().unwrap_or_else(|e| {
            warn!("terminal output lock was poisoned, recovering");
            e.into_inner()
        });
        TerminalOutput {
            output: buffer.text.clone(),
            truncated: buffer.truncated,
            exit_code: self.exit_code(),
        }
    }

    fn signal(&self, signal: libc::c_int) -> std::io::Result<()> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        // Children are spawned as process-group leaders, so signal the group.
        let rc = unsafe { libc::kill(-(pid as libc::pid_t), signal) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            Ok(())
        } else {
            Err(err)
        }
    }
}

// ---------------------------------------------------------------------------
// TerminalSupervisor
// ---------------------------------------------------------------------------

/// Owns every terminal sub-process spawned on behalf of an agent session.
///
/// Output from stdout and stderr is merged into one buffer per terminal and
/// streamed to the session's sink as `terminal_output` updates. No other
/// component signals these processes.
#[derive(Clone)]
pub struct TerminalSupervisor {
    terminals: Arc<DashMap<String, Arc<ManagedTerminal>>>,
    kill_grace: Duration,
    default_output_limit: Option<usize>,
}

impl TerminalSupervisor {
    pub fn new(config: &TerminalConfig) -> Self {
        Self {
            terminals: Arc::new(DashMap::new()),
            kill_grace: Duration::from_millis(config.kill_grace_ms),
            default_output_limit: config.output_byte_limit,
        }
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Spawn a terminal for `session_id` and return its id.
    ///
    /// A command that fails to start still yields a terminal: it is reported
    /// as exited with code 1 and the error text as its output.
    pub fn create(
        &self,
        params: TerminalCreateParams,
        session_id: &str,
        sink: NotificationSink,
    ) -> String {
        let terminal_id = format!("term-{}", uuid::Uuid::new_v4());
        let shown = params.display_command();
        let limit = params.output_byte_limit.or(self.default_output_limit);

        notify(
            &sink,
            SessionNotification::new(
                session_id,
                SessionUpdate::TerminalCreated {
                    terminal_id: terminal_id.clone(),
                    command: shown.clone(),
                },
            ),
        );

        let (exit_tx, exit_rx) = watch::channel(None);
        let mut command = build_command(&params);
        let spawned = command.spawn();

        let pid = spawned.as_ref().ok().and_then(|child| child.id());
        let terminal = Arc::new(ManagedTerminal {
            id: terminal_id.clone(),
            session_id: session_id.to_string(),
            command: shown.clone(),
            created_at: Utc::now(),
            pid,
            output: Mutex::new(OutputBuffer::new(limit)),
            exit: exit_rx,
        });
        self.terminals.insert(terminal_id.clone(), Arc::clone(&terminal));

        match spawned {
            Ok(mut child) => {
                info!(terminal_id = %terminal_id, session_id, command = %shown, pid, "terminal spawned");
                let (chunk_tx, chunk_rx) = flume::unbounded::<String>();
                if let Some(stdout) = child.stdout.take() {
                    tokio::spawn(pump(stdout, chunk_tx.clone()));
                }
                if let Some(stderr) = child.stderr.take() {
                    tokio::spawn(pump(stderr, chunk_tx.clone()));
                }
                drop(chunk_tx);

                let session_id = session_id.to_string();
                tokio::spawn(async move {
                    // The exit is tied to the process itself; descendants may
                    // keep the pipes open long after it is gone.
                    let status = loop {
                        tokio::select! {
                            status = child.wait() => break status,
                            chunk = chunk_rx.recv_async() => match chunk {
                                Ok(chunk) => forward(&terminal, &sink, &session_id, chunk),
                                Err(_) => break child.wait().await,
                            },
                        }
                    };
                    while let Ok(Ok(chunk)) =
                        tokio::time::timeout(EXIT_DRAIN, chunk_rx.recv_async()).await
                    {
                        forward(&terminal, &sink, &session_id, chunk);
                    }
                    let code = match status {
                        Ok(status) => status.code().unwrap_or(SIGNAL_EXIT_CODE),
                        Err(e) => {
                            warn!(terminal_id = %terminal.id, error = %e, "waiting on terminal failed");
                            SIGNAL_EXIT_CODE
                        }
                    };
                    finish(&terminal, &exit_tx, &sink, code);
                    // Late output from surviving descendants.
                    while let Ok(chunk) = chunk_rx.recv_async().await {
                        forward(&terminal, &sink, &session_id, chunk);
                    }
                });
            }
            Err(e) => {
                warn!(terminal_id = %terminal_id, command = %shown, error = %e, "terminal spawn failed");
                let message = format!("failed to start `{shown}`: {e}\n");
                terminal.append(&message);
                notify(
                    &sink,
                    SessionNotification::new(
                        session_id,
                        SessionUpdate::TerminalOutput {
                            terminal_id: terminal_id.clone(),
                            data: message,
                        },
                    ),
                );
                finish(&terminal, &exit_tx, &sink, SPAWN_ERROR_EXIT_CODE);
            }
        }

        terminal_id
    }

    /// Everything captured so far; empty for unknown terminals.
    pub fn get_output(&self, terminal_id: &str) -> TerminalOutput {
        self.get(terminal_id)
            .map(|t| t.snapshot())
            .unwrap_or_default()
    }

    /// Resolve with the exit code, suspending only the caller until the
    /// process exits. Unknown terminals resolve to -1.
    pub async fn wait_for_exit(&self, terminal_id: &str) -> i32 {
        let Some(terminal) = self.get(terminal_id) else {
            return UNKNOWN_EXIT_CODE;
        };
        let mut exit = terminal.exit.clone();
        drop(terminal);
        let code = match exit.wait_for(|code| code.is_some()).await {
            Ok(code) => (*code).unwrap_or(UNKNOWN_EXIT_CODE),
            Err(_) => UNKNOWN_EXIT_CODE,
        };
        code
    }

    /// SIGTERM now, SIGKILL after the grace period if still running.
    pub fn kill(&self, terminal_id: &str) -> Result<()> {
        let terminal = self
            .get(terminal_id)
            .ok_or_else(|| TerminalError::NotFound(terminal_id.to_string()))?;
        self.terminate(terminal)
    }

    fn terminate(&self, terminal: Arc<ManagedTerminal>) -> Result<()> {
        if terminal.exit_code().is_some() {
            debug!(terminal_id = %terminal.id, "kill on exited terminal ignored");
            return Ok(());
        }
        terminal.signal(libc::SIGTERM)?;
        debug!(terminal_id = %terminal.id, "sent SIGTERM");

        let grace = self.kill_grace;
        tokio::spawn(async move {
            let mut exit = terminal.exit.clone();
            let exited = matches!(
                tokio::time::timeout(grace, exit.wait_for(|c| c.is_some())).await,
                Ok(Ok(_))
            );
            if !exited {
                warn!(terminal_id = %terminal.id, "terminal ignored SIGTERM; sending SIGKILL");
                if let Err(e) = terminal.signal(libc::SIGKILL) {
                    warn!(terminal_id = %terminal.id, error = %e, "SIGKILL failed");
                }
            }
        });
        Ok(())
    }

    /// Kill if running and forget the terminal. Descendants that outlived an
    /// exited terminal are killed with it.
    pub fn release(&self, terminal_id: &str) {
        if let Some((_, terminal)) = self.terminals.remove(terminal_id) {
            if terminal.exit_code().is_some() {
                if let Err(e) = terminal.signal(libc::SIGKILL) {
                    debug!(terminal_id, error = %e, "reaping leftover process group failed");
                }
            } else if let Err(e) = self.terminate(terminal) {
                warn!(terminal_id, error = %e, "kill during release failed");
            }
            debug!(terminal_id, "terminal released");
        }
    }

    /// Release every terminal created for `session_id`.
    pub fn release_session(&self, session_id: &str) -> usize {
        let ids: Vec<String> = self
            .terminals
            .iter()
            .filter(|entry| entry.value().session_id == session_id)
            .map(|entry| entry.key().clone())
            .collect();
        for id in &ids {
            self.release(id);
        }
        ids.len()
    }

    /// Release everything (shutdown).
    pub fn release_all(&self) {
        let ids: Vec<String> = self.terminals.iter().map(|e| e.key().clone()).collect();
        for id in &ids {
            self.release(id);
        }
    }

    pub fn list(&self, session_id: Option<&str>) -> Vec<TerminalInfo> {
        let mut out: Vec<TerminalInfo> = self
            .terminals
            .iter()
            .filter(|e| session_id.is_none_or(|s| e.value().session_id == s))
            .map(|e| {
                let t = e.value();
                TerminalInfo {
                    terminal_id: t.id.clone(),
                    session_id: t.session_id.clone(),
                    command: t.command.clone(),
                    exit_code: t.exit_code(),
                    created_at: t.created_at,
                }
            })
            .collect();
        out.sort_by_key(|t| t.created_at);
        out
    }

    /// Session that created the terminal, if it is still tracked.
    pub fn owner(&self, terminal_id: &str) -> Option<String> {
        self.get(terminal_id).map(|t| t.session_id.clone())
    }

    fn get(&self, terminal_id: &str) -> Option<Arc<ManagedTerminal>> {
        self.terminals.get(terminal_id).map(|e| Arc::clone(e.value()))
    }
}

fn build_command(params: &TerminalCreateParams) -> Command {
    let mut command = if params.args.is_empty() {
        let mut sh = Command::new("sh");
        sh.arg("-c").arg(&params.command);
        sh
    } else {
        let mut direct = Command::new(&params.command);
        direct.args(&params.args);
        direct
    };
    if let Some(cwd) = &params.cwd {
        command.current_dir(cwd);
    }
    let env: HashMap<&str, &str> = params
        .env
        .iter()
        .map(|v| (v.name.as_str(), v.value.as_str()))
        .collect();
    command
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);
    command
}

fn forward(terminal: &ManagedTerminal, sink: &NotificationSink, session_id: &str, chunk: String) {
    terminal.append(&chunk);
    notify(
        sink,
        SessionNotification::new(
            session_id,
            SessionUpdate::TerminalOutput {
                terminal_id: terminal.id.clone(),
                data: chunk,
            },
        ),
    );
}

fn finish(
    terminal: &ManagedTerminal,
    exit_tx: &watch::Sender<Option<i32>>,
    sink: &NotificationSink,
    code: i32,
) {
    exit_tx.send_replace(Some(code));
    info!(terminal_id = %terminal.id, exit_code = code, "terminal exited");
    notify(
        sink,
        SessionNotification::new(
            &terminal.session_id,
            SessionUpdate::TerminalExited {
                terminal_id: terminal.id.clone(),
                exit_code: code,
            },
        ),
    );
}

/// Forward a pipe as UTF-8 chunks, holding back split multi-byte sequences.
async fn pump<R>(mut reader: R, tx: flume::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    let mut carry: Vec<u8> = Vec::new();
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "terminal pipe read failed");
                break;
            }
        };
        carry.extend_from_slice(&buf[..n]);
        let text = decode_prefix(&mut carry);
        if !text.is_empty() && tx.send(text).is_err() {
            return;
        }
    }
    if !carry.is_empty() {
        let _ = tx.send(String::from_utf8_lossy(&carry).into_owned());
    }
}

fn decode_prefix(carry: &mut Vec<u8>) -> String {
    match std::str::from_utf8(carry) {
        Ok(s) => {
            let text = s.to_string();
            carry.clear();
            text
        }
        Err(e) if e.error_len().is_none() => {
            // Incomplete sequence at the end; keep it for the next read.
            let valid = e.valid_up_to();
            let text = String::from_utf8_lossy(&carry[..valid]).into_owned();
            carry.drain(..valid);
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(carry).into_owned();
            carry.clear();
            text
        }
    }
}
