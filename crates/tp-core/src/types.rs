use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// AgentRole
// ---------------------------------------------------------------------------

/// The part an agent plays inside a multi-agent workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    /// Plans work and fans it out to other agents.
    Coordinator,
    /// Writes code for a delegated task.
    Implementer,
    /// Reviews and verifies an implementer's report.
    Verifier,
    /// A single agent working directly with the user.
    Developer,
}

impl AgentRole {
    /// Upper-case key used in environment overrides (`TROUPE_<KEY>_MODEL`).
    pub fn env_key(&self) -> &'static str {
        match self {
            AgentRole::Coordinator => "COORDINATOR",
            AgentRole::Implementer => "IMPLEMENTER",
            AgentRole::Verifier => "VERIFIER",
            AgentRole::Developer => "DEVELOPER",
        }
    }

    /// Default turn ceiling for an agent of this role.
    pub fn default_max_turns(&self) -> u32 {
        match self {
            AgentRole::Coordinator => 100,
            AgentRole::Implementer => 50,
            AgentRole::Verifier => 30,
            AgentRole::Developer => 50,
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AgentRole::Coordinator => "coordinator",
            AgentRole::Implementer => "implementer",
            AgentRole::Verifier => "verifier",
            AgentRole::Developer => "developer",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// ModelTier
// ---------------------------------------------------------------------------

/// Provider-independent model size class. Mapped to a concrete model id per
/// provider through `[model_tiers.<provider>]` in the config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Fast,
    Balanced,
    Smart,
}

// ---------------------------------------------------------------------------
// AgentStatus / AgentRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Pending,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl AgentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentStatus::Completed | AgentStatus::Failed | AgentStatus::Cancelled
        )
    }
}

/// An agent as seen by the persistence collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    pub role: AgentRole,
    pub status: AgentStatus,
    pub parent_id: Option<String>,
    pub specialist_id: Option<String>,
    pub model: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentRecord {
    pub fn new(
        workspace_id: impl Into<String>,
        name: impl Into<String>,
        role: AgentRole,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workspace_id: workspace_id.into(),
            name: name.into(),
            role,
            status: AgentStatus::Pending,
            parent_id: None,
            specialist_id: None,
            model: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Turn results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Why a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    MaxSteps,
    Timeout,
    Refusal,
    Cancelled,
    Error,
}

impl StopReason {
    /// `true` for stop reasons that leave the turn in the failed state.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            StopReason::MaxSteps | StopReason::Timeout | StopReason::Cancelled | StopReason::Error
        )
    }

    /// Parse the stop reason strings used on the wire by agent providers.
    pub fn from_wire(value: &str) -> Self {
        match value {
            "end_turn" | "endTurn" | "success" | "stop" => StopReason::EndTurn,
            "max_tokens" | "maxTokens" | "length" => StopReason::MaxTokens,
            "max_turn_requests" | "max_steps" | "error_max_turns" => StopReason::MaxSteps,
            "timeout" => StopReason::Timeout,
            "refusal" => StopReason::Refusal,
            "cancelled" | "canceled" => StopReason::Cancelled,
            _ => StopReason::Error,
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StopReason::EndTurn => "end_turn",
            StopReason::MaxTokens => "max_tokens",
            StopReason::MaxSteps => "max_steps",
            StopReason::Timeout => "timeout",
            StopReason::Refusal => "refusal",
            StopReason::Cancelled => "cancelled",
            StopReason::Error => "error",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// Tool call vocabulary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Coarse category of a tool call, used by UIs to pick an icon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Read,
    Edit,
    Search,
    Execute,
    Think,
    Other,
}
