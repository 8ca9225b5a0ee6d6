//! Which model, provider and turn ceiling a session runs with.
//!
//! Model priority, first hit wins:
//! 1. explicit override in the request
//! 2. the specialist's fixed model
//! 3. the specialist's tier, mapped through the tier table for the provider
//! 4. `TROUPE_<ROLE>_MODEL` from the environment
//! 5. unresolved; the provider's own default applies
//!
//! Results are computed once per session and never change afterwards.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tp_core::config::{Config, SpecialistConfig};
use tp_core::types::{AgentRole, ModelTier};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("unknown specialist: {0}")]
    UnknownSpecialist(String),
}

pub type Result<T> = std::result::Result<T, ResolveError>;

/// What a caller asks for when creating a session. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigRequest {
    pub model: Option<String>,
    pub provider: Option<String>,
    pub max_turns: Option<u32>,
    pub specialist_id: Option<String>,
    pub role: Option<AgentRole>,
}

impl ConfigRequest {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_specialist(mut self, id: impl Into<String>) -> Self {
        self.specialist_id = Some(id.into());
        self
    }

    pub fn with_role(mut self, role: AgentRole) -> Self {
        self.role = Some(role);
        self
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = Some(max_turns);
        self
    }
}

/// Where the resolved model came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelSource {
    Override,
    Specialist,
    SpecialistTier,
    RoleEnv,
    Unresolved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedAgentConfig {
    /// The explicit model override, as requested.
    pub model: Option<String>,
    pub provider: String,
    pub max_turns: u32,
    pub specialist_id: Option<String>,
    pub role: Option<AgentRole>,
    /// The model the session will use; `None` leaves it to the provider.
    pub resolved_model: Option<String>,
    pub source: ModelSource,
    /// Specialist system prompt, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Stateless resolution against a config snapshot.
#[derive(Clone)]
pub struct ConfigResolver {
    specialists: Vec<SpecialistConfig>,
    tiers: BTreeMap<String, BTreeMap<ModelTier, String>>,
    default_provider: String,
    default_max_turns: u32,
    env: EnvLookup,
}

impl ConfigResolver {
    pub fn new(config: &Config) -> Self {
        Self {
            specialists: config.all_specialists(),
            tiers: config.tier_table(),
            default_provider: config.general.default_provider.clone(),
            default_max_turns: config.agent_loop.max_steps,
            env: Arc::new(|key| std::env::var(key).ok()),
        }
    }

    /// Replace the environment lookup (tests).
    pub fn with_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.env = Arc::new(lookup);
        self
    }

    pub fn specialist(&self, id: &str) -> Option<&SpecialistConfig> {
        self.specialists.iter().find(|s| s.id == id)
    }

    pub fn env_key(role: AgentRole) -> String {
        format!("TROUPE_{}_MODEL", role.env_key())
    }

    pub fn resolve(&self, request: &ConfigRequest) -> Result<ResolvedAgentConfig> {
        let specialist = match &request.specialist_id {
            Some(id) => Some(
                self.specialist(id)
                    .ok_or_else(|| ResolveError::UnknownSpecialist(id.clone()))?,
            ),
            None => None,
        };

        let role = request.role.or_else(|| specialist.and_then(|s| s.role));
        let provider = request
            .provider
            .clone()
            .or_else(|| specialist.and_then(|s| s.provider.clone()))
            .unwrap_or_else(|| self.default_provider.clone());

        let (resolved_model, source) = self.resolve_model(request, specialist, role, &provider);

        let max_turns = request
            .max_turns
            .or_else(|| specialist.and_then(|s| s.max_turns))
            .or_else(|| role.map(|r| r.default_max_turns()))
            .unwrap_or(self.default_max_turns);

        Ok(ResolvedAgentConfig {
            model: request.model.clone(),
            provider,
            max_turns,
            specialist_id: request.specialist_id.clone(),
            role,
            resolved_model,
            source,
            system_prompt: specialist
                .map(|s| s.system_prompt.clone())
                .filter(|p| !p.is_empty()),
        })
    }

    fn resolve_model(
        &self,
        request: &ConfigRequest,
        specialist: Option<&SpecialistConfig>,
        role: Option<AgentRole>,
        provider: &str,
    ) -> (Option<String>, ModelSource) {
        if let Some(model) = &request.model {
            return (Some(model.clone()), ModelSource::Override);
        }
        if let Some(model) = specialist.and_then(|s| s.model.clone()) {
            return (Some(model), ModelSource::Specialist);
        }
        if let Some(tier) = specialist.and_then(|s| s.tier) {
            if let Some(model) = self.tiers.get(provider).and_then(|t| t.get(&tier)) {
                return (Some(model.clone()), ModelSource::SpecialistTier);
            }
            debug!(provider, ?tier, "no tier mapping for provider");
        }
        if let Some(role) = role {
            if let Some(model) = (self.env)(&Self::env_key(role)).filter(|m| !m.trim().is_empty()) {
                return (Some(model), ModelSource::RoleEnv);
            }
        }
        (None, ModelSource::Unresolved)
    }
}

// ---------------------------------------------------------------------------
// ResolvedConfigRegistry
// ---------------------------------------------------------------------------

/// Per-session resolution results, for lookup and observability.
#[derive(Clone)]
pub struct ResolvedConfigRegistry {
    resolver: ConfigResolver,
    sessions: Arc<DashMap<String, ResolvedAgentConfig>>,
}

impl ResolvedConfigRegistry {
    pub fn new(resolver: ConfigResolver) -> Self {
        Self {
            resolver,
            sessions: Arc::new(DashMap::new()),
        }
    }

    pub fn resolver(&self) -> &ConfigResolver {
        &self.resolver
    }

    /// Resolve for a session the first time; later calls return the stored
    /// result and ignore `request`.
    pub fn resolve_once(
        &self,
        session_id: &str,
        request: &ConfigRequest,
    ) -> Result<ResolvedAgentConfig> {
        if let Some(existing) = self.sessions.get(session_id) {
            return Ok(existing.clone());
        }
        let resolved = self.resolver.resolve(request)?;
        let stored = self
            .sessions
            .entry(session_id.to_string())
            .or_insert(resolved)
            .clone();
        info!(
            session_id,
            model = stored.resolved_model.as_deref().unwrap_or("<provider default>"),
            provider = %stored.provider,
            source = ?stored.source,
            max_turns = stored.max_turns,
            "session config resolved"
        );
        Ok(stored)
    }

    pub fn get(&self, session_id: &str) -> Option<ResolvedAgentConfig> {
        self.sessions.get(session_id).map(|e| e.clone())
    }

    /// Every session's config, sorted by session id.
    pub fn list(&self) -> Vec<(String, ResolvedAgentConfig)> {
        let mut all: Vec<(String, ResolvedAgentConfig)> = self
            .sessions
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn forget(&self, session_id: &str) -> bool {
        self.sessions.remove(session_id).is_some()
    }
}
