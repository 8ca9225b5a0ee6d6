//! Persistence seam for agent records.
//!
//! The real store lives outside this workspace; [`InMemoryAgentStore`] backs
//! the daemon and the tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tp_core::types::{AgentRecord, AgentStatus};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("agent not found: {workspace_id}/{agent_id}")]
    NotFound {
        workspace_id: String,
        agent_id: String,
    },
    #[error("store backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Agent records keyed by workspace id and agent id.
#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn get(&self, workspace_id: &str, agent_id: &str) -> Result<Option<AgentRecord>>;

    /// Insert or replace.
    async fn save(&self, record: AgentRecord) -> Result<()>;

    async fn list(&self, workspace_id: &str) -> Result<Vec<AgentRecord>>;

    /// Returns whether a record was removed.
    async fn delete(&self, workspace_id: &str, agent_id: &str) -> Result<bool>;

    async fn update_status(
        &self,
        workspace_id: &str,
        agent_id: &str,
        status: AgentStatus,
    ) -> Result<AgentRecord>;
}

#[derive(Default)]
pub struct InMemoryAgentStore {
    records: RwLock<HashMap<(String, String), AgentRecord>>,
}

impl InMemoryAgentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn key(workspace_id: &str, agent_id: &str) -> (String, String) {
    (workspace_id.to_string(), agent_id.to_string())
}

#[async_trait]
impl AgentStore for InMemoryAgentStore {
    async fn get(&self, workspace_id: &str, agent_id: &str) -> Result<Option<AgentRecord>> {
        Ok(self
            .records
            .read()
            .await
            .get(&key(workspace_id, agent_id))
            .cloned())
    }

    async fn save(&self, record: AgentRecord) -> Result<()> {
        self.records
            .write()
            .await
            .insert(key(&record.workspace_id, &record.id), record);
        Ok(())
    }

    async fn list(&self, workspace_id: &str) -> Result<Vec<AgentRecord>> {
        let records = self.records.read().await;
        let mut out: Vec<AgentRecord> = records
            .values()
            .filter(|r| r.workspace_id == workspace_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        Ok(out)
    }

    async fn delete(&self, workspace_id: &str, agent_id: &str) -> Result<bool> {
        Ok(self
            .records
            .write()
            .await
            .remove(&key(workspace_id, agent_id))
            .is_some())
    }

    async fn update_status(
        &self,
        workspace_id: &str,
        agent_id: &str,
        status: AgentStatus,
    ) -> Result<AgentRecord> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&key(workspace_id, agent_id))
            .ok_or_else(|| StoreError::NotFound {
                workspace_id: workspace_id.to_string(),
                agent_id: agent_id.to_string(),
            })?;
        record.status = status;
        record.updated_at = Utc::now();
        Ok(record.clone())
    }
}
