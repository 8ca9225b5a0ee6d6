//! Requests an agent makes back into the client: file access, permission
//! prompts and terminals.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tp_core::notification::{notify, NotificationSink, SessionNotification, SESSION_UPDATE_METHOD};
use tp_core::paths::resolve_within;
use tracing::{debug, info, warn};

use crate::rpc::{IncomingHandler, JsonRpcError};
use crate::terminal::{TerminalCreateParams, TerminalSupervisor};

/// Serves one agent session. Notifications are re-addressed to the caller's
/// session id before they reach the sink.
pub struct ClientHandler {
    session_id: String,
    cwd: PathBuf,
    sink: NotificationSink,
    terminals: TerminalSupervisor,
    max_read_bytes: usize,
}

impl ClientHandler {
    pub fn new(
        session_id: impl Into<String>,
        cwd: impl Into<PathBuf>,
        sink: NotificationSink,
        terminals: TerminalSupervisor,
        max_read_bytes: usize,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            cwd: cwd.into(),
            sink,
            terminals,
            max_read_bytes,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Forward a provider `update` object under our session id.
    pub fn forward_update(&self, update: Value) {
        notify(
            &self.sink,
            SessionNotification::from_raw(&self.session_id, update),
        );
    }

    pub fn sink(&self) -> &NotificationSink {
        &self.sink
    }

    fn contained(&self, path: &str) -> Result<PathBuf, JsonRpcError> {
        resolve_within(&self.cwd, path).ok_or_else(|| {
            warn!(session_id = %self.session_id, path, "agent path outside working directory");
            JsonRpcError::invalid_params(format!("path is outside the session directory: {path}"))
        })
    }

    /// Terminals may only be touched by the session that created them.
    fn owned_terminal(&self, params: &Value) -> Result<String, JsonRpcError> {
        let terminal_id = params
            .get("terminalId")
            .and_then(Value::as_str)
            .ok_or_else(|| JsonRpcError::invalid_params("missing terminalId"))?;
        match self.terminals.owner(terminal_id) {
            Some(owner) if owner == self.session_id => Ok(terminal_id.to_string()),
            Some(_) => Err(JsonRpcError::invalid_params(format!(
                "terminal {terminal_id} belongs to another session"
            ))),
            None => Err(JsonRpcError::invalid_params(format!(
                "unknown terminal: {terminal_id}"
            ))),
        }
    }

    async fn read_text_file(&self, params: Value) -> Result<Value, JsonRpcError> {
        let req: ReadTextFile = parse(params)?;
        let path = self.contained(&req.path)?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| JsonRpcError::internal(format!("{}: {e}", req.path)))?;
        if metadata.len() as usize > self.max_read_bytes && req.limit.is_none() {
            return Err(JsonRpcError::invalid_params(format!(
                "{} is {} bytes; pass line/limit to read part of it",
                req.path,
                metadata.len()
            )));
        }
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| JsonRpcError::internal(format!("{}: {e}", req.path)))?;
        Ok(json!({ "content": slice_lines(&content, req.line, req.limit) }))
    }

    async fn write_text_file(&self, params: Value) -> Result<Value, JsonRpcError> {
        let req: WriteTextFile = parse(params)?;
        let path = self.contained(&req.path)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| JsonRpcError::internal(e.to_string()))?;
        }
        tokio::fs::write(&path, req.content.as_bytes())
            .await
            .map_err(|e| JsonRpcError::internal(format!("{}: {e}", req.path)))?;
        debug!(session_id = %self.session_id, path = %path.display(), "agent wrote file");
        Ok(Value::Null)
    }

    fn request_permission(&self, params: Value) -> Result<Value, JsonRpcError> {
        let options = params
            .get("options")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let chosen = options
            .iter()
            .find(|o| {
                o.get("kind")
                    .and_then(Value::as_str)
                    .is_some_and(|k| k.starts_with("allow"))
            })
            .or_else(|| options.first())
            .and_then(|o| o.get("optionId"))
            .cloned();

        let title = params
            .pointer("/toolCall/title")
            .and_then(Value::as_str)
            .unwrap_or("tool call");
        match chosen {
            Some(option_id) => {
                info!(session_id = %self.session_id, title, option = %option_id, "permission granted");
                Ok(json!({ "outcome": { "outcome": "selected", "optionId": option_id } }))
            }
            None => Ok(json!({ "outcome": { "outcome": "cancelled" } })),
        }
    }

    fn create_terminal(&self, params: Value) -> Result<Value, JsonRpcError> {
        let mut req: TerminalCreateParams = parse(params)?;
        let cwd = match req.cwd.take() {
            Some(cwd) => self.contained(&cwd.to_string_lossy())?,
            None => self.cwd.clone(),
        };
        req.cwd = Some(cwd);
        let terminal_id = self
            .terminals
            .create(req, &self.session_id, self.sink.clone());
        Ok(json!({ "terminalId": terminal_id }))
    }
}

#[async_trait]
impl IncomingHandler for ClientHandler {
    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, JsonRpcError> {
        debug!(session_id = %self.session_id, method, "agent request");
        match method {
            "fs/read_text_file" => self.read_text_file(params).await,
            "fs/write_text_file" => self.write_text_file(params).await,
            "session/request_permission" => self.request_permission(params),
            "terminal/create" => self.create_terminal(params),
            "terminal/output" => {
                let id = self.owned_terminal(&params)?;
                let out = self.terminals.get_output(&id);
                let exit_status = out
                    .exit_code
                    .map(|code| json!({ "exitCode": code, "signal": null }));
                Ok(json!({
                    "output": out.output,
                    "truncated": out.truncated,
                    "exitStatus": exit_status,
                }))
            }
            "terminal/wait_for_exit" => {
                let id = self.owned_terminal(&params)?;
                let code = self.terminals.wait_for_exit(&id).await;
                Ok(json!({ "exitCode": code, "signal": null }))
            }
            "terminal/kill" => {
                let id = self.owned_terminal(&params)?;
                self.terminals
                    .kill(&id)
                    .map_err(|e| JsonRpcError::internal(e.to_string()))?;
                Ok(Value::Null)
            }
            "terminal/release" => {
                let id = self.owned_terminal(&params)?;
                self.terminals.release(&id);
                Ok(Value::Null)
            }
            other => Err(JsonRpcError::method_not_found(other)),
        }
    }

    async fn handle_notification(&self, method: &str, params: Value) {
        if method != SESSION_UPDATE_METHOD {
            debug!(session_id = %self.session_id, method, "ignoring agent notification");
            return;
        }
        match params.get("update") {
            Some(update) => self.forward_update(update.clone()),
            None => warn!(session_id = %self.session_id, "session/update without update"),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadTextFile {
    path: String,
    /// 1-based first line.
    #[serde(default)]
    line: Option<usize>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct WriteTextFile {
    path: String,
    content: String,
}

fn parse<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, JsonRpcError> {
    serde_json::from_value(params).map_err(|e| JsonRpcError::invalid_params(e.to_string()))
}

fn slice_lines(content: &str, line: Option<usize>, limit: Option<usize>) -> String {
    if line.is_none() && limit.is_none() {
        return content.to_string();
    }
    let start = line.unwrap_or(1).saturating_sub(1);
    let lines = content.split_inclusive('\n').skip(start);
    match limit {
        Some(limit) => lines.take(limit).collect(),
        None => lines.collect(),
    }
}
