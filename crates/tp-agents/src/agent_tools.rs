//! Agent-management tools: how a native agent creates, directs and
//! watches other agents. Everything goes through the [`EventBus`] plus the
//! [`AgentStore`], the same way subprocess agents coordinate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tp_bridge::event_bus::{EventBus, PreSubscribeSpec};
use tp_bridge::protocol::{AgentEvent, AgentEventType};
use tp_core::types::{AgentRecord, AgentRole, AgentStatus, ToolKind};
use tp_harness::tools::{
    optional_str, optional_u64, required_str, Result, Tool, ToolContext, ToolError, ToolRegistry,
    ToolResult,
};
use tracing::{debug, info, warn};

use crate::store::AgentStore;

/// Default wait for a delegate's report when `wait` is set.
pub const DEFAULT_DELEGATE_TIMEOUT: Duration = Duration::from_secs(600);

/// The agent on whose behalf the tools act.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentIdentity {
    pub agent_id: String,
    pub agent_name: String,
    pub workspace_id: String,
}

impl AgentIdentity {
    pub fn new(
        agent_id: impl Into<String>,
        agent_name: impl Into<String>,
        workspace_id: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_name: agent_name.into(),
            workspace_id: workspace_id.into(),
        }
    }

    fn event(&self, event_type: AgentEventType) -> AgentEvent {
        AgentEvent::new(event_type, &self.agent_id, &self.agent_name)
            .with_workspace(&self.workspace_id)
    }
}

/// Shared state behind every management tool of one agent.
#[derive(Clone)]
pub struct AgentToolsContext {
    pub bus: EventBus,
    pub store: Arc<dyn AgentStore>,
    pub identity: AgentIdentity,
    pub delegate_timeout: Duration,
}

impl AgentToolsContext {
    pub fn new(bus: EventBus, store: Arc<dyn AgentStore>, identity: AgentIdentity) -> Self {
        Self {
            bus,
            store,
            identity,
            delegate_timeout: DEFAULT_DELEGATE_TIMEOUT,
        }
    }

    async fn target(&self, agent_id: &str) -> Result<AgentRecord> {
        self.store
            .get(&self.identity.workspace_id, agent_id)
            .await
            .map_err(|e| ToolError::Failed(e.to_string()))?
            .ok_or_else(|| ToolError::Failed(format!("no agent with id {agent_id} in this workspace")))
    }
}

/// Add the five management tools to `registry`.
pub fn register_agent_tools(registry: &mut ToolRegistry, ctx: AgentToolsContext) {
    let ctx = Arc::new(ctx);
    registry.register(Arc::new(ListAgentsTool(ctx.clone())));
    registry.register(Arc::new(CreateAgentTool(ctx.clone())));
    registry.register(Arc::new(DelegateTaskTool(ctx.clone())));
    registry.register(Arc::new(SendMessageTool(ctx.clone())));
    registry.register(Arc::new(GetAgentStatusTool(ctx)));
}

fn summary(record: &AgentRecord) -> Value {
    json!({
        "id": record.id,
        "name": record.name,
        "role": record.role,
        "status": record.status,
        "parentId": record.parent_id,
        "specialistId": record.specialist_id,
        "model": record.model,
    })
}

fn parse_enum<T: serde::de::DeserializeOwned>(field: &str, value: &str) -> Result<T> {
    serde_json::from_value(json!(value))
        .map_err(|_| ToolError::InvalidArguments(format!("invalid {field}: {value}")))
}

// ---------------------------------------------------------------------------
// list_agents
// ---------------------------------------------------------------------------

pub struct ListAgentsTool(Arc<AgentToolsContext>);

#[async_trait]
impl Tool for ListAgentsTool {
    fn name(&self) -> &str {
        "list_agents"
    }

    fn description(&self) -> &str {
        "List the agents in this workspace with their roles and statuses."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "status_filter": {
                    "type": "string",
                    "enum": ["pending", "active", "completed", "failed", "cancelled"]
                }
            }
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolResult> {
        let filter: Option<AgentStatus> = optional_str(&args, "status_filter")
            .map(|s| parse_enum("status_filter", s))
            .transpose()?;
        let agents = self
            .0
            .store
            .list(&self.0.identity.workspace_id)
            .await
            .map_err(|e| ToolError::Failed(e.to_string()))?;
        let listed: Vec<Value> = agents
            .iter()
            .filter(|a| filter.is_none_or(|f| a.status == f))
            .map(summary)
            .collect();
        Ok(ToolResult::text(
            json!({ "agents": listed, "count": listed.len() }).to_string(),
        ))
    }
}

// ---------------------------------------------------------------------------
// create_agent
// ---------------------------------------------------------------------------

pub struct CreateAgentTool(Arc<AgentToolsContext>);

#[async_trait]
impl Tool for CreateAgentTool {
    fn name(&self) -> &str {
        "create_agent"
    }

    fn description(&self) -> &str {
        "Create a new agent in this workspace as a child of the calling agent."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "required": ["name", "role"],
            "properties": {
                "name": {"type": "string"},
                "role": {"type": "string", "enum": ["coordinator", "implementer", "verifier", "developer"]},
                "specialist_id": {"type": "string"},
                "model": {"type": "string"}
            }
        })
    }

    fn title(&self, args: &Value) -> String {
        format!("Create agent {}", optional_str(args, "name").unwrap_or_default())
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolResult> {
        let ctx = &self.0;
        let name = required_str(&args, "name")?;
        let role: AgentRole = parse_enum("role", required_str(&args, "role")?)?;

        let mut record = AgentRecord::new(&ctx.identity.workspace_id, name, role);
        record.parent_id = Some(ctx.identity.agent_id.clone());
        record.specialist_id = optional_str(&args, "specialist_id").map(str::to_string);
        record.model = optional_str(&args, "model").map(str::to_string);
        ctx.store
            .save(record.clone())
            .await
            .map_err(|e| ToolError::Failed(e.to_string()))?;

        ctx.bus.emit(
            AgentEvent::new(AgentEventType::AgentCreated, &record.id, &record.name)
                .with_workspace(&ctx.identity.workspace_id)
                .with_data(json!({
                    "parentAgentId": ctx.identity.agent_id,
                    "role": role,
                })),
        );
        info!(parent = %ctx.identity.agent_id, agent_id = %record.id, %role, "agent created");
        Ok(ToolResult::text(summary(&record).to_string()))
    }
}

// ---------------------------------------------------------------------------
// delegate_task
// ---------------------------------------------------------------------------

/// Assign a task to another agent, optionally waiting for its report.
///
/// When waiting, the pre-subscription is registered before the assignment is
/// emitted, so a delegate that reports instantly is still observed.
pub struct DelegateTaskTool(Arc<AgentToolsContext>);

#[async_trait]
impl Tool for DelegateTaskTool {
    fn name(&self) -> &str {
        "delegate_task"
    }

    fn description(&self) -> &str {
        "Assign a task to another agent. Set wait=true to block until it reports back."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "required": ["agent_id", "task"],
            "properties": {
                "agent_id": {"type": "string"},
                "task": {"type": "string"},
                "wait": {"type": "boolean", "description": "Wait for the agent's report (default false)"},
                "timeout_secs": {"type": "integer", "minimum": 1}
            }
        })
    }

    fn title(&self, args: &Value) -> String {
        format!("Delegate to {}", optional_str(args, "agent_id").unwrap_or_default())
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolResult> {
        let ctx = &self.0;
        let agent_id = required_str(&args, "agent_id")?;
        let task = required_str(&args, "task")?;
        let wait = args.get("wait").and_then(Value::as_bool).unwrap_or(false);
        let timeout = optional_u64(&args, "timeout_secs")
            .map(Duration::from_secs)
            .unwrap_or(ctx.delegate_timeout);

        if agent_id == ctx.identity.agent_id {
            return Err(ToolError::InvalidArguments(
                "an agent cannot delegate to itself".into(),
            ));
        }
        let target = ctx.target(agent_id).await?;

        let report = wait.then(|| {
            ctx.bus.pre_subscribe(
                PreSubscribeSpec::new(
                    &ctx.identity.agent_id,
                    &ctx.identity.agent_name,
                    AgentEventType::completion_kinds(),
                )
                .from_agent(agent_id),
            )
        });

        if let Err(e) = ctx
            .store
            .update_status(&ctx.identity.workspace_id, agent_id, AgentStatus::Active)
            .await
        {
            warn!(agent_id, error = %e, "could not mark delegate active");
        }
        ctx.bus.emit(
            ctx.identity
                .event(AgentEventType::TaskAssigned)
                .with_data(json!({ "targetAgentId": agent_id, "task": task })),
        );
        debug!(from = %ctx.identity.agent_id, to = agent_id, wait, "task delegated");

        let Some(report) = report else {
            return Ok(ToolResult::text(
                json!({ "status": "assigned", "agentId": agent_id, "agentName": target.name })
                    .to_string(),
            ));
        };

        // Dropping the pre-subscription on timeout or cancellation disposes it.
        let event = tokio::time::timeout(timeout, report)
            .await
            .map_err(|_| ToolError::Timeout(timeout))?;
        let body = json!({
            "status": event.event_type,
            "agentId": event.agent_id,
            "agentName": event.agent_name,
            "report": event.data,
        })
        .to_string();
        if event.event_type == AgentEventType::AgentFailed {
            Ok(ToolResult::error(body))
        } else {
            Ok(ToolResult::text(body))
        }
    }
}

// ---------------------------------------------------------------------------
// send_message
// ---------------------------------------------------------------------------

pub struct SendMessageTool(Arc<AgentToolsContext>);

#[async_trait]
impl Tool for SendMessageTool {
    fn name(&self) -> &str {
        "send_message"
    }

    fn description(&self) -> &str {
        "Send a message to another agent in this workspace."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "required": ["agent_id", "message"],
            "properties": {
                "agent_id": {"type": "string"},
                "message": {"type": "string"}
            }
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolResult> {
        let ctx = &self.0;
        let agent_id = required_str(&args, "agent_id")?;
        let message = required_str(&args, "message")?;
        let target = ctx.target(agent_id).await?;

        ctx.bus.emit(
            ctx.identity
                .event(AgentEventType::MessageSent)
                .with_data(json!({ "targetAgentId": agent_id, "message": message })),
        );
        Ok(ToolResult::text(format!("message sent to {}", target.name)))
    }
}

// ---------------------------------------------------------------------------
// get_agent_status
// ---------------------------------------------------------------------------

pub struct GetAgentStatusTool(Arc<AgentToolsContext>);

#[async_trait]
impl Tool for GetAgentStatusTool {
    fn name(&self) -> &str {
        "get_agent_status"
    }

    fn description(&self) -> &str {
        "Get an agent's status and how many coordination events are waiting for it."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "required": ["agent_id"],
            "properties": { "agent_id": {"type": "string"} }
        })
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Read
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolResult> {
        let ctx = &self.0;
        let agent_id = required_str(&args, "agent_id")?;
        let record = ctx.target(agent_id).await?;
        let mut body = summary(&record);
        body["pendingEvents"] = json!(ctx.bus.pending_count(agent_id));
        body["updatedAt"] = json!(record.updated_at);
        Ok(ToolResult::text(body.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryAgentStore;
    use tp_core::config::AgentLoopConfig;

    fn setup() -> (ToolRegistry, EventBus, Arc<InMemoryAgentStore>, ToolContext) {
        let bus = EventBus::new();
        let store = Arc::new(InMemoryAgentStore::new());
        let mut registry = ToolRegistry::new();
        register_agent_tools(
            &mut registry,
            AgentToolsContext::new(
                bus.clone(),
                store.clone(),
                AgentIdentity::new("boss", "Boss", "ws"),
            ),
        );
        let ctx = ToolContext::new(std::env::temp_dir(), &AgentLoopConfig::default());
        (registry, bus, store, ctx)
    }

    #[tokio::test]
    async fn create_then_list() {
        let (tools, bus, _store, ctx) = setup();
        let tap = bus.tap();

        let created = tools
            .execute("create_agent", json!({"name": "worker", "role": "implementer"}), &ctx)
            .await;
        assert!(!created.is_error, "{}", created.content);
        let created: Value = serde_json::from_str(&created.content).unwrap();
        assert_eq!(created["parentId"], "boss");

        let event = tap.try_recv().unwrap();
        assert_eq!(event.event_type, AgentEventType::AgentCreated);
        assert_eq!(event.agent_id, created["id"].as_str().unwrap());

        let listed = tools
            .execute("list_agents", json!({"status_filter": "pending"}), &ctx)
            .await;
        let listed: Value = serde_json::from_str(&listed.content).unwrap();
        assert_eq!(listed["count"], 1);

        let none = tools
            .execute("list_agents", json!({"status_filter": "active"}), &ctx)
            .await;
        assert!(none.content.contains("\"count\":0"));
    }

    #[tokio::test]
    async fn bad_role_is_an_error_result() {
        let (tools, _bus, _store, ctx) = setup();
        let result = tools
            .execute("create_agent", json!({"name": "x", "role": "wizard"}), &ctx)
            .await;
        assert!(result.is_error);
        assert!(result.content.contains("invalid role"));
    }

    #[tokio::test]
    async fn send_message_targets_the_agent() {
        let (tools, bus, store, ctx) = setup();
        let worker = AgentRecord::new("ws", "worker", AgentRole::Implementer);
        store.save(worker.clone()).await.unwrap();
        bus.subscribe(tp_bridge::event_bus::Subscription::new(
            &worker.id,
            "worker",
            [AgentEventType::MessageSent],
        ));

        let sent = tools
            .execute(
                "send_message",
                json!({"agent_id": worker.id, "message": "ping"}),
                &ctx,
            )
            .await;
        assert_eq!(sent.content, "message sent to worker");
        let pending = bus.drain_pending_events(&worker.id);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].target_agent_id(), Some(worker.id.as_str()));
        assert_eq!(pending[0].data["message"], "ping");

        let missing = tools
            .execute("send_message", json!({"agent_id": "ghost", "message": "x"}), &ctx)
            .await;
        assert!(missing.is_error);
    }

    #[tokio::test]
    async fn delegate_without_wait_returns_immediately() {
        let (tools, bus, store, ctx) = setup();
        let worker = AgentRecord::new("ws", "worker", AgentRole::Implementer);
        store.save(worker.clone()).await.unwrap();
        let tap = bus.tap();

        let result = tools
            .execute(
                "delegate_task",
                json!({"agent_id": worker.id, "task": "write tests"}),
                &ctx,
            )
            .await;
        assert!(result.content.contains("\"status\":\"assigned\""));
        let assigned = tap.try_recv().unwrap();
        assert_eq!(assigned.event_type, AgentEventType::TaskAssigned);
        assert_eq!(assigned.agent_id, "boss");
        assert_eq!(
            store.get("ws", &worker.id).await.unwrap().unwrap().status,
            AgentStatus::Active
        );
        assert_eq!(bus.pre_subscription_count(), 0);
    }

    #[tokio::test]
    async fn delegate_and_wait_for_report() {
        let (tools, bus, store, ctx) = setup();
        let worker = AgentRecord::new("ws", "worker", AgentRole::Implementer);
        store.save(worker.clone()).await.unwrap();

        // The worker reports as soon as it sees its assignment.
        let worker_id = worker.id.clone();
        let responder = bus.clone();
        bus.on(AgentEventType::TaskAssigned, move |event| {
            if event.target_agent_id() == Some(worker_id.as_str()) {
                responder.emit(
                    AgentEvent::new(AgentEventType::ReportSubmitted, &worker_id, "worker")
                        .with_data(json!({"summary": "done"})),
                );
            }
        });

        let result = tools
            .execute(
                "delegate_task",
                json!({"agent_id": worker.id, "task": "go", "wait": true}),
                &ctx,
            )
            .await;
        assert!(!result.is_error, "{}", result.content);
        let body: Value = serde_json::from_str(&result.content).unwrap();
        assert_eq!(body["status"], "REPORT_SUBMITTED");
        assert_eq!(body["report"]["summary"], "done");
        assert_eq!(bus.pre_subscription_count(), 0);
    }

    #[tokio::test]
    async fn delegate_wait_times_out_and_cleans_up() {
        let (tools, bus, store, ctx) = setup();
        let worker = AgentRecord::new("ws", "worker", AgentRole::Implementer);
        store.save(worker.clone()).await.unwrap();

        let result = tools
            .execute(
                "delegate_task",
                json!({"agent_id": worker.id, "task": "go", "wait": true, "timeout_secs": 1}),
                &ctx,
            )
            .await;
        assert!(result.is_error);
        assert!(result.content.contains("timed out"));
        assert_eq!(bus.pre_subscription_count(), 0);
    }

    #[tokio::test]
    async fn status_includes_pending_events() {
        let (tools, bus, store, ctx) = setup();
        let worker = AgentRecord::new("ws", "worker", AgentRole::Verifier);
        store.save(worker.clone()).await.unwrap();
        bus.subscribe(tp_bridge::event_bus::Subscription::new(&worker.id, "worker", []));
        bus.emit(AgentEvent::new(AgentEventType::AgentActivated, "someone", "else"));

        let status = tools
            .execute("get_agent_status", json!({"agent_id": worker.id}), &ctx)
            .await;
        let body: Value = serde_json::from_str(&status.content).unwrap();
        assert_eq!(body["pendingEvents"], 1);
        assert_eq!(body["role"], "verifier");
    }
}
