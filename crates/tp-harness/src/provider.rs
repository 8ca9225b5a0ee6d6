//! Model-caller abstraction for the native agent loop.
//!
//! The loop only ever talks to an [`LlmProvider`]: hand it the conversation
//! so far plus the tool definitions, get back text, optional reasoning, and
//! zero or more tool calls. Concrete wire protocols (Anthropic, OpenAI, ...)
//! live outside this workspace.
//!
//! ```rust,no_run
//! use tp_harness::provider::{LlmProvider, Message, ProviderError};
//!
//! async fn ask(provider: &dyn LlmProvider) -> Result<String, ProviderError> {
//!     let response = provider.chat(&[Message::user("Hello")], &[]).await?;
//!     Ok(response.content.unwrap_or_default())
//! }
//! ```

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tp_core::types::TokenUsage;
use tracing::warn;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors a model call can fail with. None of them are retried by the loop.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Missing credentials or no concrete implementation installed.
    #[error("provider not configured: {0}")]
    NotConfigured(String),

    #[error("api error: {0}")]
    Api(String),

    #[error("rate limited – retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("request timed out")]
    Timeout,

    #[error("{0}")]
    Other(String),
}

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    /// Result of a tool call, linked through `tool_call_id`.
    Tool,
}

/// One entry of a conversation.
///
/// Assistant messages that requested tools carry those calls in
/// `tool_calls`; each result comes back as a [`Role::Tool`] message with the
/// matching `tool_call_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            name: None,
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    /// Assistant turn that asked for tools.
    pub fn assistant_with_tools(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::plain(Role::Assistant, content)
        }
    }

    pub fn tool_result(call: &ToolCall, content: impl Into<String>) -> Self {
        Self {
            name: Some(call.name.clone()),
            tool_call_id: Some(call.id.clone()),
            ..Self::plain(Role::Tool, content)
        }
    }
}

// ---------------------------------------------------------------------------
// Tool definition / call
// ---------------------------------------------------------------------------

/// A tool the model may call; `parameters` is a JSON Schema object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-generated id, echoed back in the tool result.
    pub id: String,
    pub name: String,
    /// JSON-encoded arguments.
    pub arguments: String,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.to_string(),
        }
    }

    /// Arguments as JSON. An empty string is treated as `{}`.
    pub fn parsed_arguments(&self) -> Result<serde_json::Value, serde_json::Error> {
        if self.arguments.trim().is_empty() {
            return Ok(serde_json::json!({}));
        }
        serde_json::from_str(&self.arguments)
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub content: Option<String>,
    /// Reasoning text, for providers that expose it.
    #[serde(default)]
    pub thinking: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub model: String,
    pub usage: Option<TokenUsage>,
}

impl Response {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::default()
        }
    }

    pub fn with_thinking(mut self, thinking: impl Into<String>) -> Self {
        self.thinking = Some(thinking.into());
        self
    }

    pub fn with_usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.usage = Some(TokenUsage {
            input_tokens,
            output_tokens,
        });
        self
    }

    /// A response without tool calls ends the turn.
    pub fn is_final(&self) -> bool {
        self.tool_calls.is_empty()
    }
}

// ---------------------------------------------------------------------------
// LlmProvider trait
// ---------------------------------------------------------------------------

/// Anything that can run one model step.
///
/// Implementations must be cancel-safe: the agent loop drops the returned
/// future when a turn is cancelled.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<Response, ProviderError>;

    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// StubProvider – returns an error for every call.
// ---------------------------------------------------------------------------

/// Placeholder used when no concrete provider is installed.
#[derive(Debug, Clone)]
pub struct StubProvider {
    provider_name: String,
}

impl StubProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            provider_name: name.into(),
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for StubProvider {
    async fn chat(
        &self,
        _messages: &[Message],
        _tools: &[ToolDefinition],
    ) -> Result<Response, ProviderError> {
        Err(ProviderError::NotConfigured(format!(
            "{} provider is not configured – install a concrete implementation",
            self.provider_name
        )))
    }

    fn name(&self) -> &str {
        &self.provider_name
    }
}

// ---------------------------------------------------------------------------
// ScriptedProvider – replays queued responses.
// ---------------------------------------------------------------------------

struct Step {
    delay: Duration,
    result: Result<Response, ProviderError>,
}

#[derive(Default)]
struct Script {
    steps: VecDeque<Step>,
    fallback: Option<Response>,
    requests: Vec<Vec<Message>>,
}

/// Deterministic provider for tests and demos.
///
/// Queued steps are consumed in order; once the queue is empty the fallback
/// response (if any) is returned forever, otherwise the call fails.
pub struct ScriptedProvider {
    provider_name: String,
    script: Mutex<Script>,
}

impl ScriptedProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            provider_name: name.into(),
            script: Mutex::new(Script::default()),
        }
    }

    /// Provider that answers every call with `response`.
    pub fn repeating(name: impl Into<String>, response: Response) -> Self {
        let provider = Self::new(name);
        provider.lock().fallback = Some(response);
        provider
    }

    pub fn push_response(&self, response: Response) -> &Self {
        self.push_step(Duration::ZERO, Ok(response))
    }

    pub fn push_delayed(&self, delay: Duration, response: Response) -> &Self {
        self.push_step(delay, Ok(response))
    }

    pub fn push_error(&self, error: ProviderError) -> &Self {
        self.push_step(Duration::ZERO, Err(error))
    }

    /// Number of `chat` calls seen so far.
    pub fn call_count(&self) -> usize {
        self.lock().requests.len()
    }

    /// Conversation passed to the most recent call.
    pub fn last_request(&self) -> Option<Vec<Message>> {
        self.lock().requests.last().cloned()
    }

    fn push_step(&self, delay: Duration, result: Result<Response, ProviderError>) -> &Self {
        self.lock().steps.push_back(Step { delay, result });
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|e| {
            warn!("scripted provider mutex was poisoned, recovering");
            e.into_inner()
        })
    }
}

#[async_trait::async_trait]
impl LlmProvider for ScriptedProvider {
    async fn chat(
        &self,
        messages: &[Message],
        _tools: &[ToolDefinition],
    ) -> Result<Response, ProviderError> {
        let step = {
            let mut script = self.lock();
            script.requests.push(messages.to_vec());
            match script.steps.pop_front() {
                Some(step) => step,
                None => match &script.fallback {
                    Some(response) => Step {
                        delay: Duration::ZERO,
                        result: Ok(response.clone()),
                    },
                    None => {
                        return Err(ProviderError::Other(format!(
                            "{}: script exhausted",
                            self.provider_name
                        )))
                    }
                },
            }
        };
        if !step.delay.is_zero() {
            tokio::time::sleep(step.delay).await;
        }
        step.result
    }

    fn name(&self) -> &str {
        &self.provider_name
    }
}
