//! The `session/update` envelope shared by every notification producer.
//!
//! On the wire a notification looks like:
//!
//! ```json
//! {"jsonrpc":"2.0","method":"session/update",
//!  "params":{"sessionId":"s1","update":{"sessionUpdate":"terminal_output", ...}}}
//! ```
//!
//! Producers hand [`SessionNotification`]s (the `params` object) to a
//! [`NotificationSink`]; the transport wraps them with
//! [`SessionNotification::to_envelope`] when it forwards them to a client.

use serde::{Deserialize, Serialize};

use crate::types::{StopReason, TokenUsage, ToolCallStatus, ToolKind};

/// JSON-RPC method name carried by every notification.
pub const SESSION_UPDATE_METHOD: &str = "session/update";

/// Receiving end is owned by whoever forwards notifications to the client.
pub type NotificationSink = flume::Sender<SessionNotification>;

// ---------------------------------------------------------------------------
// Content
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn as_text(&self) -> &str {
        match self {
            ContentBlock::Text { text } => text,
        }
    }
}

// ---------------------------------------------------------------------------
// SessionUpdate
// ---------------------------------------------------------------------------

/// Every update kind produced inside this workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "sessionUpdate",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum SessionUpdate {
    TerminalCreated {
        terminal_id: String,
        command: String,
    },
    TerminalOutput {
        terminal_id: String,
        data: String,
    },
    TerminalExited {
        terminal_id: String,
        exit_code: i32,
    },
    ToolCall {
        tool_call_id: String,
        title: String,
        kind: ToolKind,
        status: ToolCallStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        raw_input: Option<serde_json::Value>,
    },
    ToolCallUpdate {
        tool_call_id: String,
        status: ToolCallStatus,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        content: Vec<ContentBlock>,
    },
    AgentMessageChunk {
        content: ContentBlock,
    },
    AgentThoughtChunk {
        content: ContentBlock,
    },
    TurnComplete {
        stop_reason: StopReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step_count: Option<u32>,
    },
    Error {
        message: String,
    },
}

impl SessionUpdate {
    /// The `sessionUpdate` discriminator as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionUpdate::TerminalCreated { .. } => "terminal_created",
            SessionUpdate::TerminalOutput { .. } => "terminal_output",
            SessionUpdate::TerminalExited { .. } => "terminal_exited",
            SessionUpdate::ToolCall { .. } => "tool_call",
            SessionUpdate::ToolCallUpdate { .. } => "tool_call_update",
            SessionUpdate::AgentMessageChunk { .. } => "agent_message_chunk",
            SessionUpdate::AgentThoughtChunk { .. } => "agent_thought_chunk",
            SessionUpdate::TurnComplete { .. } => "turn_complete",
            SessionUpdate::Error { .. } => "error",
        }
    }
}

/// An update is either one of ours or one forwarded verbatim from an agent
/// provider (plans, command lists, and whatever else a provider invents).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UpdateBody {
    Known(SessionUpdate),
    Passthrough(serde_json::Value),
}

// ---------------------------------------------------------------------------
// SessionNotification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionNotification {
    pub session_id: String,
    pub update: UpdateBody,
}

impl SessionNotification {
    pub fn new(session_id: impl Into<String>, update: SessionUpdate) -> Self {
        Self {
            session_id: session_id.into(),
            update: UpdateBody::Known(update),
        }
    }

    /// Wrap a provider-supplied `update` object, keeping it typed when it
    /// happens to match one of our own kinds.
    pub fn from_raw(session_id: impl Into<String>, update: serde_json::Value) -> Self {
        let update = match serde_json::from_value::<SessionUpdate>(update.clone()) {
            Ok(known) => UpdateBody::Known(known),
            Err(_) => UpdateBody::Passthrough(update),
        };
        Self {
            session_id: session_id.into(),
            update,
        }
    }

    /// The `sessionUpdate` discriminator, if present.
    pub fn kind(&self) -> Option<&str> {
        match &self.update {
            UpdateBody::Known(update) => Some(update.kind()),
            UpdateBody::Passthrough(value) => value.get("sessionUpdate").and_then(|v| v.as_str()),
        }
    }

    pub fn known(&self) -> Option<&SessionUpdate> {
        match &self.update {
            UpdateBody::Known(update) => Some(update),
            UpdateBody::Passthrough(_) => None,
        }
    }

    /// Full JSON-RPC notification object.
    pub fn to_envelope(&self) -> serde_json::Value {
        serde_json::json!({
            "jsonrpc": "2.0",
            "method": SESSION_UPDATE_METHOD,
            "params": self,
        })
    }
}

/// Send to a sink without caring whether the receiver is still around.
///
/// Producers never fail because a consumer went away.
pub fn notify(sink: &NotificationSink, notification: SessionNotification) {
    if sink.send(notification).is_err() {
        tracing::trace!("notification sink closed; dropping update");
    }
}
