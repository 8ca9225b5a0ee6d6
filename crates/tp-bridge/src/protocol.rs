use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kinds of coordination events exchanged between agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentEventType {
    AgentCreated,
    AgentActivated,
    AgentCompleted,
    AgentFailed,
    AgentStatusChanged,
    TaskAssigned,
    TaskCompleted,
    MessageSent,
    ReportSubmitted,
}

impl AgentEventType {
    pub const ALL: [AgentEventType; 9] = [
        AgentEventType::AgentCreated,
        AgentEventType::AgentActivated,
        AgentEventType::AgentCompleted,
        AgentEventType::AgentFailed,
        AgentEventType::AgentStatusChanged,
        AgentEventType::TaskAssigned,
        AgentEventType::TaskCompleted,
        AgentEventType::MessageSent,
        AgentEventType::ReportSubmitted,
    ];

    /// Event kinds that count as "this agent is done" for wait groups.
    pub fn completion_kinds() -> Vec<AgentEventType> {
        vec![
            AgentEventType::ReportSubmitted,
            AgentEventType::AgentCompleted,
            AgentEventType::AgentFailed,
        ]
    }
}

impl fmt::Display for AgentEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AgentEventType::AgentCreated => "AGENT_CREATED",
            AgentEventType::AgentActivated => "AGENT_ACTIVATED",
            AgentEventType::AgentCompleted => "AGENT_COMPLETED",
            AgentEventType::AgentFailed => "AGENT_FAILED",
            AgentEventType::AgentStatusChanged => "AGENT_STATUS_CHANGED",
            AgentEventType::TaskAssigned => "TASK_ASSIGNED",
            AgentEventType::TaskCompleted => "TASK_COMPLETED",
            AgentEventType::MessageSent => "MESSAGE_SENT",
            AgentEventType::ReportSubmitted => "REPORT_SUBMITTED",
        };
        f.write_str(label)
    }
}

/// A single coordination event. `agent_id` is always the agent the event is
/// *about* (the reporter, the newly created agent, the message sender).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEvent {
    #[serde(rename = "type")]
    pub event_type: AgentEventType,
    pub agent_id: String,
    pub agent_name: String,
    pub workspace_id: String,
    #[serde(default)]
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl AgentEvent {
    pub fn new(
        event_type: AgentEventType,
        agent_id: impl Into<String>,
        agent_name: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            agent_id: agent_id.into(),
            agent_name: agent_name.into(),
            workspace_id: String::new(),
            data: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn with_workspace(mut self, workspace_id: impl Into<String>) -> Self {
        self.workspace_id = workspace_id.into();
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Target agent for directed events (`TASK_ASSIGNED`, `MESSAGE_SENT`).
    pub fn target_agent_id(&self) -> Option<&str> {
        self.data.get("targetAgentId").and_then(|v| v.as_str())
    }
}
