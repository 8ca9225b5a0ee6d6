//! The application context: every long-lived component, built once.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::watch;
use tp_bridge::event_bus::EventBus;
use tp_bridge::protocol::{AgentEvent, AgentEventType};
use tp_core::config::Config;
use tp_core::notification::{notify, NotificationSink, SessionNotification, SessionUpdate};
use tp_core::types::AgentStatus;
use tp_harness::provider::{LlmProvider, StubProvider};
use tp_harness::shutdown::{DrainResult, ShutdownSignal, SupervisedTasks};
use tp_session::adapter::PromptOutcome;
use tp_session::process::{CreateSessionRequest, ProcessSupervisor};
use tp_session::terminal::TerminalSupervisor;
use tp_session::ProcessError;
use tracing::{debug, info, warn};

use crate::agent_loop::{AgentLoopConfig, AgentLoopEngine, AgentLoopError};
use crate::agent_tools::AgentIdentity;
use crate::config_resolver::{
    ConfigRequest, ConfigResolver, ResolveError, ResolvedAgentConfig, ResolvedConfigRegistry,
};
use crate::store::{AgentStore, InMemoryAgentStore};

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Loop(#[from] AgentLoopError),

    #[error(transparent)]
    Process(#[from] ProcessError),
}

pub type Result<T> = std::result::Result<T, ContextError>;

/// Builds the model caller for a resolved session config.
pub trait ProviderFactory: Send + Sync {
    fn create(&self, config: &ResolvedAgentConfig) -> Arc<dyn LlmProvider>;
}

/// Hands out [`StubProvider`]s; used until a concrete model client is
/// installed.
pub struct StubProviderFactory;

impl ProviderFactory for StubProviderFactory {
    fn create(&self, config: &ResolvedAgentConfig) -> Arc<dyn LlmProvider> {
        Arc::new(StubProvider::new(config.provider.clone()))
    }
}

/// What a caller supplies to start a native (in-process) agent session.
#[derive(Debug, Clone)]
pub struct NativeSessionRequest {
    pub session_id: String,
    pub cwd: PathBuf,
    pub config: ConfigRequest,
    pub agent: Option<AgentIdentity>,
}

impl NativeSessionRequest {
    pub fn new(session_id: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            session_id: session_id.into(),
            cwd: cwd.into(),
            config: ConfigRequest::default(),
            agent: None,
        }
    }

    pub fn with_config(mut self, config: ConfigRequest) -> Self {
        self.config = config;
        self
    }

    pub fn with_agent(mut self, identity: AgentIdentity) -> Self {
        self.agent = Some(identity);
        self
    }
}

/// How long a finished subprocess turn waits for its transcript to catch up.
const TRANSCRIPT_SETTLE: Duration = Duration::from_secs(1);

/// An agent identity bound to the session that does its work.
#[derive(Debug, Clone)]
struct AgentBinding {
    session_id: String,
    identity: AgentIdentity,
}

/// Bus-facing state of a subprocess agent session.
#[derive(Clone)]
struct ProcessAgent {
    identity: AgentIdentity,
    /// Message text of the current turn.
    transcript: Arc<Mutex<String>>,
    /// Count of `turn_complete` updates forwarded so far.
    turns: watch::Receiver<u64>,
}

/// Shared handles to every component. Construct once at startup and pass
/// by reference (or in an `Arc`) to whatever needs it.
pub struct AppContext {
    pub config: Arc<Config>,
    pub bus: EventBus,
    pub terminals: TerminalSupervisor,
    pub processes: ProcessSupervisor,
    pub agent_loop: AgentLoopEngine,
    pub configs: ResolvedConfigRegistry,
    pub store: Arc<dyn AgentStore>,
    pub tasks: SupervisedTasks,
    providers: Arc<dyn ProviderFactory>,
    /// Keyed by agent id.
    agents: DashMap<String, AgentBinding>,
    /// Keyed by session id.
    process_agents: DashMap<String, ProcessAgent>,
}

impl AppContext {
    pub fn new(
        config: Config,
        store: Arc<dyn AgentStore>,
        providers: Arc<dyn ProviderFactory>,
    ) -> Self {
        let config = Arc::new(config);
        let bus = EventBus::new();
        let terminals = TerminalSupervisor::new(&config.terminal);
        let processes = ProcessSupervisor::new(Arc::clone(&config), terminals.clone());
        let agent_loop = AgentLoopEngine::new(bus.clone(), Arc::clone(&store));
        let configs = ResolvedConfigRegistry::new(ConfigResolver::new(&config));
        Self {
            config,
            bus,
            terminals,
            processes,
            agent_loop,
            configs,
            store,
            tasks: SupervisedTasks::new(ShutdownSignal::new()),
            providers,
            agents: DashMap::new(),
            process_agents: DashMap::new(),
        }
    }

    /// In-memory store and stub providers.
    pub fn in_memory(config: Config) -> Self {
        Self::new(
            config,
            Arc::new(InMemoryAgentStore::new()),
            Arc::new(StubProviderFactory),
        )
    }

    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        self.tasks.shutdown()
    }

    /// Start a subprocess agent session. Returns the provider's session id.
    ///
    /// With an identity, turns driven through [`prompt_process`] are
    /// published on the bus like native turns, and tasks assigned to the
    /// agent are routed to this session by the dispatcher.
    ///
    /// [`prompt_process`]: AppContext::prompt_process
    pub async fn start_process_session(
        &self,
        request: CreateSessionRequest,
        sink: NotificationSink,
        agent: Option<AgentIdentity>,
    ) -> Result<String> {
        let session_id = request.session_id.clone();
        let Some(identity) = agent else {
            return Ok(self.processes.create_session(request, sink).await?);
        };

        let (inner_tx, inner_rx) = flume::unbounded();
        let transcript = Arc::new(Mutex::new(String::new()));
        let (turns_tx, turns_rx) = watch::channel(0);
        tokio::spawn(record_transcript(
            inner_rx,
            sink,
            Arc::clone(&transcript),
            turns_tx,
        ));
        let provider_session_id = self.processes.create_session(request, inner_tx).await?;

        self.bind(&session_id, &identity);
        self.process_agents.insert(
            session_id,
            ProcessAgent {
                identity,
                transcript,
                turns: turns_rx,
            },
        );
        Ok(provider_session_id)
    }

    /// Prompt a subprocess session and wait for its turn to end. For agent
    /// sessions the turn is bracketed by `AGENT_ACTIVATED` and
    /// `AGENT_COMPLETED`/`AGENT_FAILED`, and the agent's status is recorded.
    pub async fn prompt_process(&self, session_id: &str, text: &str) -> Result<PromptOutcome> {
        let agent = self.process_agents.get(session_id).map(|a| a.value().clone());
        let Some(agent) = agent else {
            return Ok(self.processes.prompt(session_id, text).await?);
        };

        lock(&agent.transcript).clear();
        let mut turns = agent.turns.clone();
        let before = *turns.borrow();
        self.publish(
            &agent.identity,
            AgentEventType::AgentActivated,
            AgentStatus::Active,
            json!({ "sessionId": session_id }),
        )
        .await;

        let result = self.processes.prompt(session_id, text).await;
        if result.is_ok() {
            // turn_complete trails the turn's messages through the forwarder.
            let _ = tokio::time::timeout(TRANSCRIPT_SETTLE, turns.wait_for(|n| *n > before)).await;
        }
        let summary = std::mem::take(&mut *lock(&agent.transcript));
        let (event_type, status, data) = match &result {
            Ok(outcome) if !outcome.stop_reason.is_failure() => (
                AgentEventType::AgentCompleted,
                AgentStatus::Completed,
                json!({ "sessionId": session_id, "stopReason": outcome.stop_reason, "summary": summary }),
            ),
            Ok(outcome) => (
                AgentEventType::AgentFailed,
                AgentStatus::Failed,
                json!({ "sessionId": session_id, "stopReason": outcome.stop_reason, "summary": summary }),
            ),
            Err(e) => (
                AgentEventType::AgentFailed,
                AgentStatus::Failed,
                json!({ "sessionId": session_id, "error": e.to_string(), "summary": summary }),
            ),
        };
        self.publish(&agent.identity, event_type, status, data).await;
        Ok(result?)
    }

    /// Route every `TASK_ASSIGNED` event whose target has a session to that
    /// session as a prompt. Runs as a supervised task until shutdown.
    pub fn spawn_dispatcher(self: &Arc<Self>) {
        let ctx = Arc::clone(self);
        let events = self.bus.tap();
        self.tasks.spawn("task-dispatcher", move |signal| async move {
            loop {
                tokio::select! {
                    _ = signal.wait() => return Ok::<(), String>(()),
                    event = events.recv_async() => {
                        let Ok(event) = event else {
                            return Ok(());
                        };
                        if event.event_type == AgentEventType::TaskAssigned {
                            ctx.dispatch(&event).await;
                        }
                    }
                }
            }
        });
    }

    async fn dispatch(self: &Arc<Self>, event: &AgentEvent) {
        let Some(target) = event.target_agent_id() else {
            return;
        };
        let Some(binding) = self.agents.get(target).map(|b| b.value().clone()) else {
            debug!(target, "task assigned to an agent without a session");
            return;
        };
        let task = event
            .data
            .get("task")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        debug!(
            agent_id = %binding.identity.agent_id,
            session_id = %binding.session_id,
            from = %event.agent_id,
            "dispatching assigned task"
        );

        if self.process_agents.contains_key(&binding.session_id) {
            let ctx = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = ctx.prompt_process(&binding.session_id, &task).await {
                    warn!(session_id = %binding.session_id, error = %e, "assigned task failed");
                }
            });
            return;
        }
        if let Err(e) = self.agent_loop.prompt(&binding.session_id, task) {
            warn!(session_id = %binding.session_id, error = %e, "assigned task not started");
            // Anyone waiting on this agent would otherwise wait out its timeout.
            self.publish(
                &binding.identity,
                AgentEventType::AgentFailed,
                AgentStatus::Failed,
                json!({ "sessionId": binding.session_id, "error": e.to_string() }),
            )
            .await;
        }
    }

    fn bind(&self, session_id: &str, identity: &AgentIdentity) {
        self.agents.insert(
            identity.agent_id.clone(),
            AgentBinding {
                session_id: session_id.to_string(),
                identity: identity.clone(),
            },
        );
    }

    async fn publish(
        &self,
        identity: &AgentIdentity,
        event_type: AgentEventType,
        status: AgentStatus,
        data: Value,
    ) {
        if let Err(e) = self
            .store
            .update_status(&identity.workspace_id, &identity.agent_id, status)
            .await
        {
            debug!(agent_id = %identity.agent_id, error = %e, "agent status not recorded");
        }
        self.bus.emit(
            AgentEvent::new(event_type, &identity.agent_id, &identity.agent_name)
                .with_workspace(&identity.workspace_id)
                .with_data(data),
        );
    }

    /// Resolve the session's config once and open a loop session with it.
    pub fn start_native_session(&self, request: NativeSessionRequest) -> Result<ResolvedAgentConfig> {
        if self.agent_loop.state(&request.session_id).is_some() {
            return Err(AgentLoopError::SessionExists(request.session_id).into());
        }
        let resolved = self.configs.resolve_once(&request.session_id, &request.config)?;
        let provider = self.providers.create(&resolved);

        let mut loop_config = AgentLoopConfig::new(provider, &request.cwd, &self.config.agent_loop)
            .with_max_steps(resolved.max_turns);
        if let Some(prompt) = &resolved.system_prompt {
            loop_config = loop_config.with_system_prompt(prompt.clone());
        }
        if let Some(identity) = &request.agent {
            loop_config = loop_config.with_agent(identity.clone());
        }
        self.agent_loop.create_session(&request.session_id, loop_config)?;
        if let Some(identity) = &request.agent {
            self.bind(&request.session_id, identity);
        }
        Ok(resolved)
    }

    /// Tear down everything owned by a session, whichever kind it is.
    pub async fn end_session(&self, session_id: &str) {
        self.processes.kill_session(session_id).await;
        let released = self.terminals.release_session(session_id);
        let closed = self.agent_loop.close_session(session_id);
        self.configs.forget(session_id);
        self.process_agents.remove(session_id);
        self.agents.retain(|_, binding| binding.session_id != session_id);
        info!(session_id, terminals_released = released, loop_closed = closed, "session ended");
    }

    /// Stop all sessions and wait up to `timeout` for background tasks.
    pub async fn shutdown(&self, timeout: Duration) -> DrainResult {
        info!("shutting down");
        self.shutdown_signal().trigger();
        self.processes.kill_all().await;
        self.terminals.release_all();
        let closed = self.agent_loop.close_all();
        self.process_agents.clear();
        self.agents.clear();
        info!(loop_sessions = closed, "sessions stopped");
        self.tasks.drain(timeout).await
    }
}

/// Forward a subprocess session's updates to the caller's sink, keeping the
/// current turn's message text and counting finished turns.
async fn record_transcript(
    updates: flume::Receiver<SessionNotification>,
    sink: NotificationSink,
    transcript: Arc<Mutex<String>>,
    turns: watch::Sender<u64>,
) {
    while let Ok(notification) = updates.recv_async().await {
        let finished = match notification.known() {
            Some(SessionUpdate::AgentMessageChunk { content }) => {
                lock(&transcript).push_str(content.as_text());
                false
            }
            Some(SessionUpdate::TurnComplete { .. }) => true,
            _ => false,
        };
        notify(&sink, notification);
        if finished {
            turns.send_modify(|n| *n += 1);
        }
    }
}

fn lock(transcript: &Mutex<String>) -> std::sync::MutexGuard<'_, String> {
    transcript.lock().unwrap_or_else(|e| {
        warn!("transcript lock was poisoned, recovering");
        e.into_inner()
    })
}
