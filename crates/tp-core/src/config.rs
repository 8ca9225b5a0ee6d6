use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::{AgentRole, ModelTier};

/// Top-level configuration loaded from `~/.troupe/config.toml`.
///
/// Every section is optional; missing sections fall back to defaults and
/// built-in presets/specialists are always available.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub agent_loop: AgentLoopConfig,
    #[serde(default)]
    pub terminal: TerminalConfig,
    #[serde(default)]
    pub presets: Vec<PresetConfig>,
    #[serde(default)]
    pub specialists: Vec<SpecialistConfig>,
    /// provider name -> tier -> model id. Merged over [`default_model_tiers`].
    #[serde(default)]
    pub model_tiers: BTreeMap<String, BTreeMap<ModelTier, String>>,
}

impl Config {
    /// Load config from `~/.troupe/config.toml`, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        tracing::debug!(path = %path.display(), presets = cfg.presets.len(), "config loaded");
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.agent_loop.validate()?;
        self.terminal.validate()?;

        let mut ids = BTreeSet::new();
        for preset in &self.presets {
            preset.validate()?;
            if !ids.insert(preset.id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "presets contains duplicate id '{}'",
                    preset.id
                )));
            }
        }

        let mut ids = BTreeSet::new();
        for specialist in &self.specialists {
            if specialist.id.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "specialists entries must have a non-empty id".to_string(),
                ));
            }
            if !ids.insert(specialist.id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "specialists contains duplicate id '{}'",
                    specialist.id
                )));
            }
        }
        Ok(())
    }

    /// Look up a preset, preferring user-defined entries over built-ins.
    pub fn preset(&self, id: &str) -> Option<PresetConfig> {
        self.presets
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .or_else(|| builtin_presets().into_iter().find(|p| p.id == id))
    }

    /// Every specialist, user-defined entries shadowing built-ins of the same id.
    pub fn all_specialists(&self) -> Vec<SpecialistConfig> {
        let mut out = self.specialists.clone();
        for builtin in builtin_specialists() {
            if !out.iter().any(|s| s.id == builtin.id) {
                out.push(builtin);
            }
        }
        out
    }

    /// Tier table with user overrides merged over the defaults.
    pub fn tier_table(&self) -> BTreeMap<String, BTreeMap<ModelTier, String>> {
        let mut table = default_model_tiers();
        for (provider, tiers) in &self.model_tiers {
            let entry = table.entry(provider.clone()).or_default();
            for (tier, model) in tiers {
                entry.insert(*tier, model.clone());
            }
        }
        table
    }

    fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".troupe")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_logs: bool,
    /// Provider used for tier lookups when neither the caller nor the
    /// specialist names one.
    #[serde(default = "default_provider")]
    pub default_provider: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
            default_provider: default_provider(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}
fn default_provider() -> String {
    "anthropic".into()
}

/// Ceilings for the native agent loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLoopConfig {
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    #[serde(default = "default_total_timeout_secs")]
    pub total_timeout_secs: u64,
    /// Largest file `read_file` will return, in bytes.
    #[serde(default = "default_max_read_bytes")]
    pub max_read_bytes: usize,
    /// Tool output is truncated to this many characters before it reaches the model.
    #[serde(default = "default_max_tool_output_chars")]
    pub max_tool_output_chars: usize,
    #[serde(default = "default_bash_timeout_secs")]
    pub bash_timeout_secs: u64,
}

impl Default for AgentLoopConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            total_timeout_secs: default_total_timeout_secs(),
            max_read_bytes: default_max_read_bytes(),
            max_tool_output_chars: default_max_tool_output_chars(),
            bash_timeout_secs: default_bash_timeout_secs(),
        }
    }
}

impl AgentLoopConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_steps == 0 {
            return Err(ConfigError::Validation(
                "agent_loop.max_steps must be greater than zero".to_string(),
            ));
        }
        if self.total_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "agent_loop.total_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.max_read_bytes == 0 || self.max_tool_output_chars == 0 {
            return Err(ConfigError::Validation(
                "agent_loop read/output caps must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_max_steps() -> u32 {
    50
}
fn default_total_timeout_secs() -> u64 {
    600
}
fn default_max_read_bytes() -> usize {
    256 * 1024
}
fn default_max_tool_output_chars() -> usize {
    30_000
}
fn default_bash_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalConfig {
    /// Time between SIGTERM and SIGKILL.
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
    /// Default cap on buffered output per terminal (oldest bytes dropped).
    #[serde(default)]
    pub output_byte_limit: Option<usize>,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            kill_grace_ms: default_kill_grace_ms(),
            output_byte_limit: None,
        }
    }
}

impl TerminalConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kill_grace_ms > 60_000 {
            return Err(ConfigError::Validation(
                "terminal.kill_grace_ms must be at most 60000".to_string(),
            ));
        }
        if self.output_byte_limit == Some(0) {
            return Err(ConfigError::Validation(
                "terminal.output_byte_limit must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_kill_grace_ms() -> u64 {
    3_000
}

// ---------------------------------------------------------------------------
// Presets
// ---------------------------------------------------------------------------

/// How to reach an agent provider. Each kind carries exactly the fields it needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderKind {
    /// Subprocess speaking the Agent Client Protocol over stdio.
    Acp {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// Subprocess speaking Claude Code's stream-json protocol over stdio.
    ClaudeCode {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// Already-running agent reachable over TCP, newline-delimited JSON-RPC.
    Tcp { address: String },
}

impl ProviderKind {
    pub fn label(&self) -> &'static str {
        match self {
            ProviderKind::Acp { .. } => "acp",
            ProviderKind::ClaudeCode { .. } => "claude_code",
            ProviderKind::Tcp { .. } => "tcp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresetConfig {
    pub id: String,
    #[serde(flatten)]
    pub provider: ProviderKind,
}

impl PresetConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::Validation(
                "presets entries must have a non-empty id".to_string(),
            ));
        }
        let empty = match &self.provider {
            ProviderKind::Acp { command, .. } | ProviderKind::ClaudeCode { command, .. } => {
                command.trim().is_empty()
            }
            ProviderKind::Tcp { address } => address.trim().is_empty(),
        };
        if empty {
            return Err(ConfigError::Validation(format!(
                "preset '{}' must name a command or address",
                self.id
            )));
        }
        Ok(())
    }
}

/// Presets that exist without any configuration.
pub fn builtin_presets() -> Vec<PresetConfig> {
    let acp = |id: &str, command: &str, args: &[&str]| PresetConfig {
        id: id.to_string(),
        provider: ProviderKind::Acp {
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: HashMap::new(),
        },
    };
    vec![
        acp("opencode", "opencode", &["acp"]),
        acp("gemini", "gemini", &["--experimental-acp"]),
        acp("codex", "codex-acp", &[]),
        PresetConfig {
            id: "claude-code".to_string(),
            provider: ProviderKind::ClaudeCode {
                command: "claude".to_string(),
                args: vec![
                    "-p".into(),
                    "--input-format".into(),
                    "stream-json".into(),
                    "--output-format".into(),
                    "stream-json".into(),
                    "--verbose".into(),
                ],
                env: HashMap::new(),
            },
        },
    ]
}

// ---------------------------------------------------------------------------
// Specialists
// ---------------------------------------------------------------------------

/// A reusable behavior profile: a system prompt plus a default model choice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialistConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub role: Option<AgentRole>,
    /// Fixed model; wins over `tier`.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub tier: Option<ModelTier>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub max_turns: Option<u32>,
}

pub fn builtin_specialists() -> Vec<SpecialistConfig> {
    vec![
        SpecialistConfig {
            id: "coordinator".into(),
            name: "Coordinator".into(),
            system_prompt: "You plan work, split it into independent tasks, delegate each \
                            task to an implementer and verify the reports before answering."
                .into(),
            role: Some(AgentRole::Coordinator),
            model: None,
            tier: Some(ModelTier::Smart),
            provider: None,
            max_turns: Some(100),
        },
        SpecialistConfig {
            id: "implementer".into(),
            name: "Implementer".into(),
            system_prompt: "You implement exactly the task you were given, keep changes \
                            minimal, and finish with a short report of what changed."
                .into(),
            role: Some(AgentRole::Implementer),
            model: None,
            tier: Some(ModelTier::Balanced),
            provider: None,
            max_turns: Some(50),
        },
        SpecialistConfig {
            id: "verifier".into(),
            name: "Verifier".into(),
            system_prompt: "You review a report against the task's acceptance criteria and \
                            answer APPROVED or list the concrete problems."
                .into(),
            role: Some(AgentRole::Verifier),
            model: None,
            tier: Some(ModelTier::Fast),
            provider: None,
            max_turns: Some(30),
        },
    ]
}

/// Default provider -> tier -> model table.
pub fn default_model_tiers() -> BTreeMap<String, BTreeMap<ModelTier, String>> {
    let row = |fast: &str, balanced: &str, smart: &str| {
        BTreeMap::from([
            (ModelTier::Fast, fast.to_string()),
            (ModelTier::Balanced, balanced.to_string()),
            (ModelTier::Smart, smart.to_string()),
        ])
    };
    BTreeMap::from([
        (
            "anthropic".to_string(),
            row(
                "claude-3-5-haiku-20241022",
                "claude-sonnet-4-20250514",
                "claude-opus-4-20250514",
            ),
        ),
        ("openai".to_string(), row("gpt-4o-mini", "gpt-4.1", "o3")),
        (
            "gemini".to_string(),
            row("gemini-2.5-flash", "gemini-2.5-pro", "gemini-2.5-pro"),
        ),
    ])
}
