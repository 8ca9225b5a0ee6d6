use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinSet;
use tp_core::config::Config;
use tp_core::notification::{notify, NotificationSink, SessionNotification, SessionUpdate};
use tracing::{debug, info, warn};

use crate::adapter::{adapter_for, PromptOutcome, ProtocolAdapter, SpawnOptions};
use crate::client::ClientHandler;
use crate::error::{ProcessError, Result};
use crate::terminal::TerminalSupervisor;

/// Arguments of [`ProcessSupervisor::create_session`].
#[derive(Debug, Clone)]
pub struct CreateSessionRequest {
    pub session_id: String,
    pub cwd: PathBuf,
    pub preset_id: String,
    pub initial_mode: Option<String>,
    pub extra_args: Vec<String>,
    pub extra_env: HashMap<String, String>,
}

impl CreateSessionRequest {
    pub fn new(
        session_id: impl Into<String>,
        cwd: impl Into<PathBuf>,
        preset_id: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            cwd: cwd.into(),
            preset_id: preset_id.into(),
            initial_mode: None,
            extra_args: Vec::new(),
            extra_env: HashMap::new(),
        }
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.initial_mode = Some(mode.into());
        self
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.extra_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_env.insert(key.into(), value.into());
        self
    }
}

/// Bookkeeping for one agent session, as returned by lookups.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedProcess {
    pub session_id: String,
    pub provider_session_id: String,
    pub preset_id: String,
    pub provider_kind: &'static str,
    pub pid: Option<u32>,
    pub cwd: PathBuf,
    pub created_at: DateTime<Utc>,
}

struct SessionEntry {
    info: ManagedProcess,
    adapter: Arc<dyn ProtocolAdapter>,
    sink: NotificationSink,
}

/// Owns every agent process and connection, one per caller session id.
///
/// Nothing else may kill or reconfigure these processes. Spawn and handshake
/// failures are returned to the caller as-is; nothing is retried here.
#[derive(Clone)]
pub struct ProcessSupervisor {
    config: Arc<Config>,
    terminals: TerminalSupervisor,
    sessions: Arc<DashMap<String, SessionEntry>>,
}

impl ProcessSupervisor {
    pub fn new(config: Arc<Config>, terminals: TerminalSupervisor) -> Self {
        Self {
            config,
            terminals,
            sessions: Arc::new(DashMap::new()),
        }
    }

    /// Spawn or connect the preset's provider, handshake, open a provider
    /// session and apply the initial mode. Returns the provider session id.
    ///
    /// Calling this again for a live session id replaces it; the earlier
    /// process is terminated.
    pub async fn create_session(
        &self,
        request: CreateSessionRequest,
        sink: NotificationSink,
    ) -> Result<String> {
        let preset = self
            .config
            .preset(&request.preset_id)
            .ok_or_else(|| ProcessError::UnknownPreset(request.preset_id.clone()))?;

        let handler = Arc::new(ClientHandler::new(
            request.session_id.clone(),
            request.cwd.clone(),
            sink.clone(),
            self.terminals.clone(),
            self.config.agent_loop.max_read_bytes,
        ));
        let adapter: Arc<dyn ProtocolAdapter> = adapter_for(
            &preset.provider,
            SpawnOptions {
                cwd: request.cwd.clone(),
                extra_args: request.extra_args.clone(),
                extra_env: request.extra_env.clone(),
                handler,
            },
        )
        .await?
        .into();

        let provider_session_id = match adapter.new_session(&request.cwd).await {
            Ok(id) => id,
            Err(e) => {
                warn!(session_id = %request.session_id, preset = %preset.id, error = %e, "session/new failed");
                adapter.shutdown().await;
                return Err(match e {
                    ProcessError::Remote { .. } => ProcessError::ProtocolError(e.to_string()),
                    other => other,
                });
            }
        };

        if let Some(mode) = &request.initial_mode {
            if let Err(e) = adapter.set_mode(&provider_session_id, mode).await {
                warn!(session_id = %request.session_id, mode = %mode, error = %e, "initial mode not applied");
            }
        }

        let entry = SessionEntry {
            info: ManagedProcess {
                session_id: request.session_id.clone(),
                provider_session_id: provider_session_id.clone(),
                preset_id: preset.id.clone(),
                provider_kind: adapter.kind(),
                pid: adapter.pid(),
                cwd: request.cwd.clone(),
                created_at: Utc::now(),
            },
            adapter,
            sink,
        };
        if let Some(previous) = self.sessions.insert(request.session_id.clone(), entry) {
            warn!(session_id = %request.session_id, "session recreated; terminating previous agent");
            previous.adapter.shutdown().await;
        }

        info!(
            session_id = %request.session_id,
            preset = %preset.id,
            provider = preset.provider.label(),
            %provider_session_id,
            "agent session created"
        );
        Ok(provider_session_id)
    }

    /// Send a user prompt and wait for the turn to end. Emits a final
    /// `turn_complete` to the session's sink.
    pub async fn prompt(&self, session_id: &str, text: &str) -> Result<PromptOutcome> {
        let (adapter, provider_session_id, sink) = self.handle(session_id)?;
        let outcome = adapter.prompt(&provider_session_id, text).await?;
        notify(
            &sink,
            SessionNotification::new(
                session_id,
                SessionUpdate::TurnComplete {
                    stop_reason: outcome.stop_reason,
                    usage: outcome.usage,
                    step_count: None,
                },
            ),
        );
        Ok(outcome)
    }

    pub async fn cancel(&self, session_id: &str) -> Result<()> {
        let (adapter, provider_session_id, _) = self.handle(session_id)?;
        debug!(session_id, "cancelling agent turn");
        adapter.cancel(&provider_session_id).await
    }

    /// Best effort: failures (including unsupported modes) are logged only.
    pub async fn set_session_mode(&self, session_id: &str, mode_id: &str) {
        let Ok((adapter, provider_session_id, _)) = self.handle(session_id) else {
            debug!(session_id, "set_session_mode on unknown session");
            return;
        };
        match adapter.set_mode(&provider_session_id, mode_id).await {
            Ok(()) => debug!(session_id, mode_id, "session mode set"),
            Err(e) => warn!(session_id, mode_id, error = %e, "session mode not applied"),
        }
    }

    pub fn get_process(&self, session_id: &str) -> Option<ManagedProcess> {
        self.sessions.get(session_id).map(|e| e.info.clone())
    }

    pub fn get_provider_session_id(&self, session_id: &str) -> Option<String> {
        self.sessions
            .get(session_id)
            .map(|e| e.info.provider_session_id.clone())
    }

    pub fn get_preset_id(&self, session_id: &str) -> Option<String> {
        self.sessions.get(session_id).map(|e| e.info.preset_id.clone())
    }

    pub fn is_claude_code_session(&self, session_id: &str) -> bool {
        self.sessions
            .get(session_id)
            .is_some_and(|e| e.info.provider_kind == "claude_code")
    }

    pub fn list_sessions(&self) -> Vec<ManagedProcess> {
        let mut all: Vec<ManagedProcess> =
            self.sessions.iter().map(|e| e.info.clone()).collect();
        all.sort_by_key(|p| p.created_at);
        all
    }

    /// Terminate the session's agent and forget it. Unknown ids are ignored.
    pub async fn kill_session(&self, session_id: &str) {
        let Some((_, entry)) = self.sessions.remove(session_id) else {
            return;
        };
        entry.adapter.shutdown().await;
        info!(session_id, pid = entry.info.pid, "agent session killed");
    }

    /// Terminate everything (shutdown).
    pub async fn kill_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let mut set = JoinSet::new();
        for id in ids {
            if let Some((_, entry)) = self.sessions.remove(&id) {
                set.spawn(async move { entry.adapter.shutdown().await });
            }
        }
        let count = set.len();
        while set.join_next().await.is_some() {}
        if count > 0 {
            info!(count, "all agent sessions killed");
        }
    }

    fn handle(
        &self,
        session_id: &str,
    ) -> Result<(Arc<dyn ProtocolAdapter>, String, NotificationSink)> {
        let entry = self
            .sessions
            .get(session_id)
            .ok_or_else(|| ProcessError::SessionNotFound(session_id.to_string()))?;
        Ok((
            Arc::clone(&entry.adapter),
            entry.info.provider_session_id.clone(),
            entry.sink.clone(),
        ))
    }
}
