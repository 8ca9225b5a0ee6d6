use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tp_agents::agent_loop::AgentLoopError;
use tp_agents::agent_tools::AgentIdentity;
use tp_agents::config_resolver::{ConfigRequest, ModelSource, ResolvedAgentConfig};
use tp_agents::context::{AppContext, ContextError, NativeSessionRequest, ProviderFactory};
use tp_agents::store::{AgentStore, InMemoryAgentStore};
use tp_bridge::event_bus::WaitGroupSpec;
use tp_bridge::protocol::AgentEventType;
use tp_core::config::{Config, PresetConfig, ProviderKind};
use tp_core::notification::{SessionNotification, SessionUpdate};
use tp_core::types::{AgentRecord, AgentRole, AgentStatus, StopReason};
use tp_harness::provider::{LlmProvider, Response, ScriptedProvider, ToolCall};
use tp_harness::shutdown::DrainResult;
use tp_session::process::CreateSessionRequest;

/// Minimal stdio ACP agent: every prompt is answered with "hello" and
/// `end_turn`.
const SH_AGENT: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":1}}\n' "$id" ;;
    *'"method":"session/new"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"sessionId":"sh-session"}}\n' "$id" ;;
    *'"method":"session/prompt"'*)
      printf '{"jsonrpc":"2.0","method":"session/update","params":{"sessionId":"sh-session","update":{"sessionUpdate":"agent_message_chunk","content":{"type":"text","text":"hello"}}}}\n'
      printf '{"jsonrpc":"2.0","id":%s,"result":{"stopReason":"end_turn"}}\n' "$id" ;;
  esac
done
"#;

fn sh_config() -> Config {
    Config {
        presets: vec![PresetConfig {
            id: "sh".to_string(),
            provider: ProviderKind::Acp {
                command: "sh".to_string(),
                args: vec!["-c".to_string(), SH_AGENT.to_string()],
                env: HashMap::new(),
            },
        }],
        ..Config::default()
    }
}

fn identity(record: &AgentRecord) -> AgentIdentity {
    AgentIdentity::new(&record.id, &record.name, &record.workspace_id)
}

/// Hands the same scripted provider to every native session.
struct SharedScript(Arc<ScriptedProvider>);

impl ProviderFactory for SharedScript {
    fn create(&self, _config: &ResolvedAgentConfig) -> Arc<dyn LlmProvider> {
        self.0.clone()
    }
}

struct EchoFactory;

impl ProviderFactory for EchoFactory {
    fn create(&self, config: &ResolvedAgentConfig) -> Arc<dyn LlmProvider> {
        let model = config.resolved_model.clone().unwrap_or_default();
        Arc::new(ScriptedProvider::repeating(
            config.provider.clone(),
            Response::text(format!("answered by {model}")),
        ))
    }
}

#[tokio::test]
async fn native_session_uses_resolved_config() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = AppContext::new(
        Config::default(),
        Arc::new(InMemoryAgentStore::new()),
        Arc::new(EchoFactory),
    );

    let resolved = ctx
        .start_native_session(
            NativeSessionRequest::new("s1", dir.path())
                .with_config(ConfigRequest::default().with_specialist("verifier")),
        )
        .unwrap();
    assert_eq!(resolved.max_turns, 30);
    assert_eq!(resolved.source, ModelSource::SpecialistTier);
    assert_eq!(ctx.agent_loop.state("s1").unwrap().max_steps, 30);
    assert_eq!(ctx.configs.get("s1"), Some(resolved.clone()));

    let (_, outcome) = ctx
        .agent_loop
        .prompt("s1", "review this")
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert_eq!(
        outcome.final_text,
        format!("answered by {}", resolved.resolved_model.unwrap())
    );

    ctx.end_session("s1").await;
    assert!(ctx.agent_loop.state("s1").is_none());
    assert!(ctx.configs.get("s1").is_none());
}

#[tokio::test]
async fn duplicate_and_unknown_sessions_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = AppContext::in_memory(Config::default());
    ctx.start_native_session(NativeSessionRequest::new("s1", dir.path()))
        .unwrap();

    let again = ctx.start_native_session(
        NativeSessionRequest::new("s1", dir.path())
            .with_config(ConfigRequest::default().with_model("other")),
    );
    assert!(matches!(
        again,
        Err(ContextError::Loop(AgentLoopError::SessionExists(_)))
    ));
    // The first resolution is kept.
    assert_eq!(ctx.configs.get("s1").unwrap().model, None);

    let unknown = ctx.start_native_session(
        NativeSessionRequest::new("s2", dir.path())
            .with_config(ConfigRequest::default().with_specialist("wizard")),
    );
    assert!(matches!(unknown, Err(ContextError::Resolve(_))));
    assert!(ctx.agent_loop.state("s2").is_none());
}

#[tokio::test]
async fn stub_provider_reports_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = AppContext::in_memory(Config::default());
    ctx.start_native_session(NativeSessionRequest::new("s1", dir.path()))
        .unwrap();

    let (updates, outcome) = ctx
        .agent_loop
        .prompt("s1", "hello")
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert_eq!(outcome.stop_reason, StopReason::Error);
    match updates[0].known() {
        Some(SessionUpdate::Error { message }) => assert!(message.contains("not configured")),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn shutdown_stops_sessions_and_drains_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = AppContext::in_memory(Config::default());
    ctx.start_native_session(NativeSessionRequest::new("s1", dir.path()))
        .unwrap();
    ctx.tasks.spawn("waiter", |signal| async move {
        signal.wait().await;
        Ok::<(), String>(())
    });

    let drained = ctx.shutdown(Duration::from_secs(5)).await;
    assert_eq!(drained, DrainResult::Complete(1));
    assert!(ctx.shutdown_signal().is_shutting_down());
    assert!(ctx.agent_loop.list_sessions().is_empty());
}

#[tokio::test]
async fn subprocess_agent_completion_reaches_wait_groups() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryAgentStore::new());
    let worker = AgentRecord::new("ws", "worker", AgentRole::Implementer);
    store.save(worker.clone()).await.unwrap();
    let ctx = AppContext::new(sh_config(), store.clone(), Arc::new(EchoFactory));

    let (tx, rx) = flume::unbounded::<SessionNotification>();
    ctx.start_process_session(
        CreateSessionRequest::new("p1", dir.path(), "sh"),
        tx,
        Some(identity(&worker)),
    )
    .await
    .unwrap();

    let (done_tx, done_rx) = flume::bounded(1);
    ctx.bus
        .create_wait_group(WaitGroupSpec::new("wg", "lead", [worker.id.clone()], move |done| {
            let _ = done_tx.send(done);
        }))
        .unwrap();

    let outcome = ctx.prompt_process("p1", "say hello").await.unwrap();
    assert_eq!(outcome.stop_reason, StopReason::EndTurn);

    let done = tokio::time::timeout(Duration::from_secs(5), done_rx.recv_async())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(done.events.len(), 1);
    assert_eq!(done.events[0].event_type, AgentEventType::AgentCompleted);
    assert_eq!(done.events[0].data["summary"], "hello");
    assert_eq!(done.events[0].data["sessionId"], "p1");

    // The caller still sees every update.
    let kinds: Vec<String> = rx
        .try_iter()
        .filter_map(|n| n.kind().map(str::to_string))
        .collect();
    assert_eq!(kinds, vec!["agent_message_chunk", "turn_complete"]);

    let record = store.get("ws", &worker.id).await.unwrap().unwrap();
    assert_eq!(record.status, AgentStatus::Completed);
    ctx.end_session("p1").await;
}

#[tokio::test]
async fn waiting_delegation_is_answered_by_a_subprocess_agent() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryAgentStore::new());
    let lead = AgentRecord::new("ws", "lead", AgentRole::Coordinator);
    let worker = AgentRecord::new("ws", "worker", AgentRole::Implementer);
    store.save(lead.clone()).await.unwrap();
    store.save(worker.clone()).await.unwrap();

    let script = Arc::new(ScriptedProvider::new("lead"));
    script
        .push_response(Response::tool_calls(vec![ToolCall::new(
            "d1",
            "delegate_task",
            json!({"agent_id": worker.id, "task": "greet", "wait": true, "timeout_secs": 10}),
        )]))
        .push_response(Response::text("all done"));
    let ctx = Arc::new(AppContext::new(
        sh_config(),
        store.clone(),
        Arc::new(SharedScript(script.clone())),
    ));
    ctx.spawn_dispatcher();

    let (tx, _rx) = flume::unbounded();
    ctx.start_process_session(
        CreateSessionRequest::new("worker-session", dir.path(), "sh"),
        tx,
        Some(identity(&worker)),
    )
    .await
    .unwrap();
    ctx.start_native_session(
        NativeSessionRequest::new("lead-session", dir.path()).with_agent(identity(&lead)),
    )
    .unwrap();

    let outcome = tokio::time::timeout(
        Duration::from_secs(20),
        ctx.agent_loop.prompt("lead-session", "get a greeting").unwrap().outcome(),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(outcome.stop_reason, StopReason::EndTurn);
    assert_eq!(outcome.final_text, "all done");

    let request = script.last_request().unwrap();
    let report = request
        .iter()
        .find(|m| m.tool_call_id.as_deref() == Some("d1"))
        .unwrap();
    let report: Value = serde_json::from_str(&report.content).unwrap();
    assert_eq!(report["status"], "AGENT_COMPLETED");
    assert_eq!(report["report"]["summary"], "hello");

    ctx.shutdown(Duration::from_secs(5)).await;
}
