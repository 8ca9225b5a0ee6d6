//! In-process agent loop.
//!
//! A turn starts with a user prompt and alternates model steps with tool
//! calls until the model answers without requesting tools, a limit is hit,
//! the provider fails, or the caller cancels. Progress is streamed as
//! `session/update` notifications in causal order:
//!
//! ```text
//! agent_thought_chunk? agent_message_chunk? (tool_call tool_call_update)* ... turn_complete
//! ```
//!
//! Conversation history belongs to the session and survives across turns;
//! the [`AgentLoopState`] is fresh for every turn.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tp_bridge::event_bus::EventBus;
use tp_bridge::protocol::{AgentEvent, AgentEventType};
use tp_core::notification::{notify, ContentBlock, NotificationSink, SessionNotification, SessionUpdate};
use tp_core::types::{AgentStatus, StopReason, TokenUsage, ToolCallStatus};
use tp_harness::provider::{LlmProvider, Message, ToolCall};
use tp_harness::tools::{coding_tools, ToolContext, ToolRegistry, ToolResult};
use tracing::{debug, info, warn};

use crate::agent_tools::{register_agent_tools, AgentIdentity, AgentToolsContext};
use crate::state_machine::{AgentLoopState, LoopEvent, LoopSnapshot, LoopState, StateMachineError};
use crate::store::AgentStore;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum AgentLoopError {
    #[error("loop session not found: {0}")]
    SessionNotFound(String),

    #[error("loop session already exists: {0}")]
    SessionExists(String),

    /// A turn is already running for this session.
    #[error("loop session {0} is busy")]
    Busy(String),

    #[error(transparent)]
    StateMachine(#[from] StateMachineError),

    #[error("turn task failed: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, AgentLoopError>;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Everything one loop session needs.
pub struct AgentLoopConfig {
    pub provider: Arc<dyn LlmProvider>,
    pub tools: ToolContext,
    pub system_prompt: Option<String>,
    pub max_steps: u32,
    pub total_timeout: Duration,
    /// When set, the agent-management tools are available and turn
    /// boundaries are published on the event bus under this identity.
    pub agent: Option<AgentIdentity>,
}

impl AgentLoopConfig {
    /// Limits and tool bounds come from the `[agent_loop]` config section.
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        cwd: impl Into<std::path::PathBuf>,
        settings: &tp_core::config::AgentLoopConfig,
    ) -> Self {
        Self {
            provider,
            tools: ToolContext::new(cwd, settings),
            system_prompt: None,
            max_steps: settings.max_steps,
            total_timeout: Duration::from_secs(settings.total_timeout_secs),
            agent: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_total_timeout(mut self, timeout: Duration) -> Self {
        self.total_timeout = timeout;
        self
    }

    pub fn with_agent(mut self, identity: AgentIdentity) -> Self {
        self.agent = Some(identity);
        self
    }
}

// ---------------------------------------------------------------------------
// Turn results
// ---------------------------------------------------------------------------

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnOutcome {
    pub stop_reason: StopReason,
    pub usage: Option<TokenUsage>,
    pub step_count: u32,
    /// Text of the last assistant message, empty if there was none.
    pub final_text: String,
    pub state: LoopState,
}

/// Handle to a running turn.
pub struct PromptHandle {
    pub session_id: String,
    /// Closed once `turn_complete` has been sent.
    pub updates: flume::Receiver<SessionNotification>,
    join: JoinHandle<TurnOutcome>,
}

impl PromptHandle {
    pub async fn outcome(self) -> Result<TurnOutcome> {
        self.join
            .await
            .map_err(|e| AgentLoopError::Internal(e.to_string()))
    }

    /// Wait for the turn, then return every notification it produced.
    pub async fn collect(self) -> Result<(Vec<SessionNotification>, TurnOutcome)> {
        let updates = self.updates.clone();
        let outcome = self.outcome().await?;
        Ok((updates.drain().collect(), outcome))
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

enum Control {
    Cancel,
}

struct LoopSession {
    id: String,
    config: AgentLoopConfig,
    tools: ToolRegistry,
    bus: EventBus,
    store: Arc<dyn AgentStore>,
    history: tokio::sync::Mutex<Vec<Message>>,
    state: Mutex<AgentLoopState>,
    control: Mutex<Option<flume::Sender<Control>>>,
    busy: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!("agent loop lock poisoned; recovering");
        poisoned.into_inner()
    })
}

impl LoopSession {
    fn transition(&self, event: LoopEvent) -> std::result::Result<LoopState, StateMachineError> {
        lock(&self.state).transition(event)
    }

    fn update(&self, sink: &NotificationSink, update: SessionUpdate) {
        notify(sink, SessionNotification::new(&self.id, update));
    }

    /// Stop reason for a breached limit, if any.
    fn limit_breach(&self) -> Option<(StopReason, String)> {
        let state = lock(&self.state);
        let message = state.check_limits()?;
        let reason = if state.step_count() >= state.max_steps() {
            StopReason::MaxSteps
        } else {
            StopReason::Timeout
        };
        Some((reason, message))
    }

    async fn publish_turn_start(&self) {
        let Some(identity) = &self.config.agent else {
            return;
        };
        self.set_status(identity, AgentStatus::Active).await;
        self.bus.emit(
            AgentEvent::new(AgentEventType::AgentActivated, &identity.agent_id, &identity.agent_name)
                .with_workspace(&identity.workspace_id)
                .with_data(json!({ "sessionId": self.id })),
        );
    }

    async fn publish_turn_end(&self, outcome: &TurnOutcome) {
        let Some(identity) = &self.config.agent else {
            return;
        };
        let (event_type, status) = if outcome.state == LoopState::Done {
            (AgentEventType::AgentCompleted, AgentStatus::Completed)
        } else {
            (AgentEventType::AgentFailed, AgentStatus::Failed)
        };
        self.set_status(identity, status).await;
        self.bus.emit(
            AgentEvent::new(event_type, &identity.agent_id, &identity.agent_name)
                .with_workspace(&identity.workspace_id)
                .with_data(json!({
                    "sessionId": self.id,
                    "stopReason": outcome.stop_reason,
                    "summary": outcome.final_text,
                    "stepCount": outcome.step_count,
                })),
        );
    }

    async fn set_status(&self, identity: &AgentIdentity, status: AgentStatus) {
        if let Err(e) = self
            .store
            .update_status(&identity.workspace_id, &identity.agent_id, status)
            .await
        {
            debug!(agent_id = %identity.agent_id, error = %e, "agent status not recorded");
        }
    }
}

/// Clears the in-flight marker even if the turn task panics.
struct TurnGuard(Arc<LoopSession>);

impl Drop for TurnGuard {
    fn drop(&mut self) {
        lock(&self.0.control).take();
        self.0.busy.store(false, Ordering::SeqCst);
    }
}

fn cancel_requested(control: &flume::Receiver<Control>) -> bool {
    matches!(
        control.try_recv(),
        Ok(Control::Cancel) | Err(flume::TryRecvError::Disconnected)
    )
}

async fn run_turn(
    session: Arc<LoopSession>,
    prompt: String,
    sink: NotificationSink,
    control: flume::Receiver<Control>,
) -> TurnOutcome {
    let guard = TurnGuard(Arc::clone(&session));
    let mut history = session.history.lock().await;
    if history.is_empty() {
        if let Some(system) = &session.config.system_prompt {
            history.push(Message::system(system.clone()));
        }
    }
    history.push(Message::user(prompt));
    session.publish_turn_start().await;

    let definitions = session.tools.definitions();
    let mut usage: Option<TokenUsage> = None;
    let mut final_text = String::new();

    let stop_reason = loop {
        if cancel_requested(&control) {
            break StopReason::Cancelled;
        }
        if let Some((reason, message)) = session.limit_breach() {
            warn!(session_id = %session.id, %message, "turn limit reached");
            break reason;
        }
        if let Err(e) = session.transition(LoopEvent::Step) {
            warn!(session_id = %session.id, error = %e, "step refused");
            break StopReason::MaxSteps;
        }

        let remaining = lock(&session.state).remaining();
        let call = session.config.provider.chat(&history, &definitions);
        // Dropping `call` on cancel abandons the request at its next await.
        let response = tokio::select! {
            biased;
            _ = control.recv_async() => break StopReason::Cancelled,
            result = tokio::time::timeout(remaining, call) => result,
        };
        let response = match response {
            Err(_) => {
                warn!(session_id = %session.id, "model call exceeded the turn time limit");
                break StopReason::Timeout;
            }
            Ok(Err(e)) => {
                warn!(session_id = %session.id, provider = session.config.provider.name(), error = %e, "model call failed");
                session.update(&sink, SessionUpdate::Error { message: e.to_string() });
                break StopReason::Error;
            }
            Ok(Ok(response)) => response,
        };

        if let Some(step_usage) = &response.usage {
            usage.get_or_insert_with(TokenUsage::default).add(step_usage);
        }
        if let Some(thinking) = response.thinking.as_deref().filter(|t| !t.is_empty()) {
            session.update(
                &sink,
                SessionUpdate::AgentThoughtChunk { content: ContentBlock::text(thinking) },
            );
        }
        let content = response.content.unwrap_or_default();
        if !content.is_empty() {
            session.update(
                &sink,
                SessionUpdate::AgentMessageChunk { content: ContentBlock::text(content.clone()) },
            );
            final_text = content.clone();
        }

        if response.tool_calls.is_empty() {
            history.push(Message::assistant(content));
            break StopReason::EndTurn;
        }

        history.push(Message::assistant_with_tools(content, response.tool_calls.clone()));
        let cancelled =
            run_tool_calls(&session, &response.tool_calls, &sink, &control, &mut history).await;
        if cancelled {
            break StopReason::Cancelled;
        }
    };

    let event = if stop_reason == StopReason::EndTurn {
        LoopEvent::Finish
    } else {
        LoopEvent::Fail
    };
    let state = session.transition(event).unwrap_or_else(|e| {
        warn!(session_id = %session.id, error = %e, "final transition refused");
        LoopState::Failed
    });
    let step_count = lock(&session.state).step_count();
    drop(history);

    let outcome = TurnOutcome {
        stop_reason,
        usage,
        step_count,
        final_text,
        state,
    };
    info!(
        session_id = %session.id,
        stop_reason = %outcome.stop_reason,
        steps = step_count,
        "turn finished"
    );
    session.publish_turn_end(&outcome).await;

    // The session accepts a new prompt before the caller sees turn_complete.
    drop(guard);
    session.update(
        &sink,
        SessionUpdate::TurnComplete {
            stop_reason: outcome.stop_reason,
            usage: outcome.usage,
            step_count: Some(step_count),
        },
    );
    outcome
}

/// Execute the calls of one step in order. Returns true if the turn was
/// cancelled; every call still gets a result message so the history stays
/// well-formed.
async fn run_tool_calls(
    session: &LoopSession,
    calls: &[ToolCall],
    sink: &NotificationSink,
    control: &flume::Receiver<Control>,
    history: &mut Vec<Message>,
) -> bool {
    let mut cancelled = false;
    for call in calls {
        if cancelled {
            history.push(Message::tool_result(call, "error: cancelled before execution"));
            continue;
        }

        let args = call.parsed_arguments();
        let title = match &args {
            Ok(args) => session.tools.title_of(&call.name, args),
            Err(_) => call.name.clone(),
        };
        session.update(
            sink,
            SessionUpdate::ToolCall {
                tool_call_id: call.id.clone(),
                title,
                kind: session.tools.kind_of(&call.name),
                status: ToolCallStatus::Pending,
                raw_input: args.as_ref().ok().cloned(),
            },
        );

        let result = match args {
            Err(e) => ToolResult::error(format!("arguments are not valid JSON: {e}")),
            Ok(args) => {
                tokio::select! {
                    biased;
                    _ = control.recv_async() => {
                        cancelled = true;
                        ToolResult::error("cancelled")
                    }
                    result = session.tools.execute(&call.name, args, &session.config.tools) => result,
                }
            }
        };
        debug!(session_id = %session.id, tool = %call.name, is_error = result.is_error, "tool call finished");

        session.update(
            sink,
            SessionUpdate::ToolCallUpdate {
                tool_call_id: call.id.clone(),
                status: if result.is_error {
                    ToolCallStatus::Failed
                } else {
                    ToolCallStatus::Completed
                },
                content: vec![ContentBlock::text(result.content.clone())],
            },
        );
        let content = if result.is_error {
            format!("error: {}", result.content)
        } else {
            result.content
        };
        history.push(Message::tool_result(call, content));
    }
    cancelled
}

// ---------------------------------------------------------------------------
// AgentLoopEngine
// ---------------------------------------------------------------------------

/// Owns every native loop session.
pub struct AgentLoopEngine {
    bus: EventBus,
    store: Arc<dyn AgentStore>,
    sessions: DashMap<String, Arc<LoopSession>>,
}

impl AgentLoopEngine {
    pub fn new(bus: EventBus, store: Arc<dyn AgentStore>) -> Self {
        Self {
            bus,
            store,
            sessions: DashMap::new(),
        }
    }

    pub fn create_session(&self, session_id: impl Into<String>, config: AgentLoopConfig) -> Result<()> {
        let session_id = session_id.into();
        let mut tools = coding_tools();
        if let Some(identity) = &config.agent {
            let mut ctx =
                AgentToolsContext::new(self.bus.clone(), Arc::clone(&self.store), identity.clone());
            ctx.delegate_timeout = config.total_timeout;
            register_agent_tools(&mut tools, ctx);
        }

        let session = Arc::new(LoopSession {
            id: session_id.clone(),
            state: Mutex::new(AgentLoopState::new(config.max_steps, config.total_timeout)),
            config,
            tools,
            bus: self.bus.clone(),
            store: Arc::clone(&self.store),
            history: tokio::sync::Mutex::new(Vec::new()),
            control: Mutex::new(None),
            busy: AtomicBool::new(false),
        });

        match self.sessions.entry(session_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(AgentLoopError::SessionExists(session_id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                info!(
                    session_id = %session_id,
                    provider = session.config.provider.name(),
                    tools = session.tools.len(),
                    max_steps = session.config.max_steps,
                    "loop session created"
                );
                slot.insert(session);
                Ok(())
            }
        }
    }

    fn session(&self, session_id: &str) -> Result<Arc<LoopSession>> {
        self.sessions
            .get(session_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| AgentLoopError::SessionNotFound(session_id.to_string()))
    }

    /// Start a turn. Must be called from within a tokio runtime.
    pub fn prompt(&self, session_id: &str, text: impl Into<String>) -> Result<PromptHandle> {
        let session = self.session(session_id)?;
        let mut state = AgentLoopState::new(session.config.max_steps, session.config.total_timeout);
        state.transition(LoopEvent::Start)?;

        if session
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AgentLoopError::Busy(session_id.to_string()));
        }
        *lock(&session.state) = state;
        let (control_tx, control_rx) = flume::bounded(1);
        *lock(&session.control) = Some(control_tx);

        let (tx, rx) = flume::unbounded();
        debug!(session_id, "turn started");
        let join = tokio::spawn(run_turn(session, text.into(), tx, control_rx));
        Ok(PromptHandle {
            session_id: session_id.to_string(),
            updates: rx,
            join,
        })
    }

    /// Ask the in-flight turn to stop. Returns false when nothing is running.
    pub fn cancel(&self, session_id: &str) -> Result<bool> {
        let session = self.session(session_id)?;
        let control = lock(&session.control);
        let Some(tx) = control.as_ref() else {
            return Ok(false);
        };
        // A full channel means a cancel is already queued.
        let _ = tx.try_send(Control::Cancel);
        info!(session_id, "turn cancellation requested");
        Ok(true)
    }

    /// Forget a session, cancelling its turn and dropping its bus
    /// registrations. Returns whether the session existed.
    pub fn close_session(&self, session_id: &str) -> bool {
        let Some((_, session)) = self.sessions.remove(session_id) else {
            return false;
        };
        // Disconnecting the control channel cancels a running turn.
        lock(&session.control).take();
        if let Some(identity) = &session.config.agent {
            self.bus.remove_agent(&identity.agent_id);
        }
        info!(session_id, "loop session closed");
        true
    }

    pub fn close_all(&self) -> usize {
        let ids = self.list_sessions();
        ids.iter().filter(|id| self.close_session(id)).count()
    }

    pub fn state(&self, session_id: &str) -> Option<LoopSnapshot> {
        self.sessions
            .get(session_id)
            .map(|s| lock(&s.state).snapshot())
    }

    pub fn is_busy(&self, session_id: &str) -> bool {
        self.sessions
            .get(session_id)
            .is_some_and(|s| s.busy.load(Ordering::SeqCst))
    }

    pub fn list_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn tool_names(&self, session_id: &str) -> Option<Vec<String>> {
        self.sessions
            .get(session_id)
            .map(|s| s.tools.names().into_iter().map(str::to_string).collect())
    }
}
